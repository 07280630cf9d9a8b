// Purpose: Public proxy surface tying the tree, watcher and hotplug together.

//! The sysfs GPIO emulation core.
//!
//! [`GpioProxy`] bundles the node tree, the chip registry, the base
//! allocator and the event watcher behind one cloneable handle. The FUSE
//! binding addresses it by inode; tests and the hotplug integrator address
//! it by path and by synthetic events. All tree state lives behind a single
//! mutex so filesystem callbacks and hotplug mutations serialize.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use log::debug;
use thiserror::Error as ThisError;

pub mod alloc;
pub mod chip;
pub mod fuse;
pub mod hotplug;
pub mod line;
pub mod node;
pub mod watch;

use self::chip::State;
use self::hotplug::{HotplugAction, HotplugEvent};
use self::node::{split_path, DirEntry, NodeAttr, NodeType, WriteOutcome};
use self::watch::{EventWatcher, PollWaker};
use crate::gpio::GpioBackend;

/// Errors surfaced by proxy operations, each mapping onto one errno.
#[derive(Debug, ThisError)]
pub enum Error {
    /// Unparseable payload, unknown gpio number, or double export.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// Operation the emulated tree never allows.
    #[error("permission denied")]
    PermissionDenied,
    /// Node creation, which sysfs refuses outright.
    #[error("access denied")]
    AccessDenied,
    /// Path resolution miss.
    #[error("no such entry")]
    NoEntry,
    /// Directory expected, or rmdir on the immutable tree.
    #[error("not a directory")]
    NotADirectory,
    /// Failure from the character-device layer.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// The errno handed back to the kernel.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => libc::EINVAL,
            Error::PermissionDenied => libc::EPERM,
            Error::AccessDenied => libc::EACCES,
            Error::NoEntry => libc::ENOENT,
            Error::NotADirectory => libc::ENOTDIR,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}

/// Result alias used throughout the proxy.
pub type Result<T> = std::result::Result<T, Error>;

struct ProxyInner {
    state: Mutex<State>,
    watcher: EventWatcher,
    backend: Arc<dyn GpioBackend>,
}

/// Cloneable handle to the emulation core.
#[derive(Clone)]
pub struct GpioProxy {
    inner: Arc<ProxyInner>,
}

impl GpioProxy {
    /// Build an empty proxy; chips arrive through [`GpioProxy::apply_hotplug`].
    ///
    /// `mount_root` is the target every `subsystem` symlink points at.
    pub fn new(backend: Arc<dyn GpioBackend>, mount_root: impl Into<PathBuf>) -> Result<Self> {
        let watcher = EventWatcher::spawn()?;
        Ok(Self {
            inner: Arc::new(ProxyInner {
                state: Mutex::new(State::new(mount_root.into())),
                watcher,
                backend,
            }),
        })
    }

    /// Install the poll wake sink once the filesystem session exists.
    pub fn set_waker(&self, waker: Arc<dyn PollWaker>) {
        self.inner.watcher.set_waker(waker);
    }

    /// Release remaining lines and join the watcher.
    pub fn shutdown(&self) {
        self.lock().clear(&self.inner.watcher);
        self.inner.watcher.stop();
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().expect("poisoned proxy state lock")
    }

    /// Apply one chip bind/unbind event.
    ///
    /// Bind failures for devices that vanished between the notification and
    /// the open are swallowed; everything else propagates to the caller.
    pub fn apply_hotplug(&self, event: &HotplugEvent) -> Result<()> {
        match event.action {
            HotplugAction::Bind => {
                let Some(devnode) = &event.devnode else {
                    debug!("ignoring bind of {} without a device node", event.name);
                    return Ok(());
                };
                let mut state = self.lock();
                if state.has_chip(&event.name) {
                    debug!("chip {} is already bound", event.name);
                    return Ok(());
                }
                let port = match self.inner.backend.open_chip(devnode) {
                    Ok(port) => port,
                    Err(err) if hotplug::is_device_gone(&err) => {
                        debug!("chip {} vanished before open: {err}", event.name);
                        return Ok(());
                    }
                    Err(err) => return Err(Error::Io(err)),
                };
                state.add_chip(port, &event.syspath)?;
            }
            HotplugAction::Unbind => {
                let mut state = self.lock();
                if !state.remove_chip(&event.name, &self.inner.watcher)? {
                    debug!("ignoring unbind of unknown chip {}", event.name);
                }
            }
        }
        Ok(())
    }

    // Inode-addressed surface consumed by the FUSE binding.

    /// Attributes of a node.
    pub fn attr_of(&self, ino: u64) -> Result<NodeAttr> {
        Ok(self.lock().tree().node_by_ino(ino)?.attr())
    }

    /// Attributes of `parent/name`.
    pub fn attr_of_child(&self, parent: u64, name: &str) -> Result<NodeAttr> {
        let state = self.lock();
        let mut path = state.tree().path_of(parent)?.to_vec();
        path.push(name.to_owned());
        Ok(state.tree().lookup(&path)?.attr())
    }

    /// Directory listing with `.` and `..` first.
    pub fn read_dir(&self, ino: u64) -> Result<Vec<DirEntry>> {
        self.lock().tree().read_dir(ino)
    }

    /// Read an attribute slice.
    pub fn read(&self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.lock().tree().read(ino, offset, size)
    }

    /// Apply a write, executing any export/unexport side effect.
    ///
    /// Returns the full payload length, the convention sysfs attributes use.
    pub fn write(&self, ino: u64, data: &[u8]) -> Result<usize> {
        let mut state = self.lock();
        match state.tree_mut().write(ino, data)? {
            WriteOutcome::Applied => {}
            WriteOutcome::Export(number) => state.export(number, &self.inner.watcher)?,
            WriteOutcome::Unexport(number) => state.unexport(number, &self.inner.watcher)?,
        }
        Ok(data.len())
    }

    /// Symlink target.
    pub fn readlink(&self, ino: u64) -> Result<String> {
        Ok(self.lock().tree().readlink(ino)?.to_owned())
    }

    /// chmod.
    pub fn set_mode(&self, ino: u64, mode: u32) -> Result<()> {
        self.lock().tree_mut().set_mode(ino, mode)
    }

    /// chown.
    pub fn set_owner(&self, ino: u64, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        self.lock().tree_mut().set_owner(ino, uid, gid)
    }

    /// Poll readiness; arms `handle` on a `value` attribute.
    pub fn poll(&self, ino: u64, handle: u64) -> Result<u32> {
        self.lock().tree().poll(ino, handle)
    }

    /// rmdir semantics of an immutable tree: directories answer
    /// not-a-directory, files permission-denied.
    pub fn remove_dir(&self, parent: u64, name: &str) -> Result<()> {
        let state = self.lock();
        let mut path = state.tree().path_of(parent)?.to_vec();
        path.push(name.to_owned());
        match state.tree().lookup(&path)?.node_type() {
            NodeType::Directory => Err(Error::NotADirectory),
            _ => Err(Error::PermissionDenied),
        }
    }

    // Path-addressed surface used by tests and tooling.

    /// Inode of a path.
    pub fn lookup_ino(&self, path: &str) -> Result<u64> {
        Ok(self.lock().tree().lookup(&split_path(path))?.ino())
    }

    /// Full rendering of an attribute.
    pub fn read_path(&self, path: &str) -> Result<Vec<u8>> {
        let state = self.lock();
        let ino = state.tree().lookup(&split_path(path))?.ino();
        state.tree().read(ino, 0, node::ATTR_SIZE as u32)
    }

    /// Write to an attribute by path.
    pub fn write_path(&self, path: &str, data: &[u8]) -> Result<usize> {
        let ino = self.lookup_ino(path)?;
        self.write(ino, data)
    }

    /// Readlink by path; a missing path answers permission-denied, matching
    /// the sysfs surface where only symlinks ever resolve through readlink.
    pub fn readlink_path(&self, path: &str) -> Result<String> {
        let state = self.lock();
        let node = state
            .tree()
            .lookup(&split_path(path))
            .map_err(|_| Error::PermissionDenied)?;
        Ok(state.tree().readlink(node.ino())?.to_owned())
    }

    /// Directory listing by path.
    pub fn read_dir_path(&self, path: &str) -> Result<Vec<DirEntry>> {
        let state = self.lock();
        let ino = state.tree().lookup(&split_path(path))?.ino();
        state.tree().read_dir(ino)
    }

    /// Poll by path.
    pub fn poll_path(&self, path: &str, handle: u64) -> Result<u32> {
        let ino = self.lookup_ino(path)?;
        self.poll(ino, handle)
    }
}
