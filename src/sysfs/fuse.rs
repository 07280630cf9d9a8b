// Purpose: fuser binding translating kernel calls onto the proxy.

//! The kernel-facing shim.
//!
//! `fuser` addresses nodes by inode, the proxy keeps the index, and every
//! operation below is a thin translation plus errno mapping. Nothing here
//! blocks: attribute reads and writes complete synchronously, and poll
//! wakeups travel back through the session notifier.

use std::ffi::OsStr;
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, Notifier, PollHandle, ReplyAttr, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyOpen, ReplyPoll, ReplyWrite, Request, TimeOrNow,
};
use log::{debug, trace};

use super::node::{NodeAttr, NodeType};
use super::watch::PollWaker;
use super::GpioProxy;

const TTL: Duration = Duration::from_secs(1);

/// `fuser::Filesystem` implementation over a [`GpioProxy`].
pub struct GpioFs {
    proxy: GpioProxy,
}

impl GpioFs {
    /// Wrap a proxy for mounting.
    pub fn new(proxy: GpioProxy) -> Self {
        Self { proxy }
    }
}

/// Poll wake sink backed by the mounted session's notifier.
pub struct NotifierWaker {
    notifier: Notifier,
}

impl NotifierWaker {
    /// Wrap a session notifier.
    pub fn new(notifier: Notifier) -> Self {
        Self { notifier }
    }
}

impl PollWaker for NotifierWaker {
    fn wake(&self, handle: u64) {
        if let Err(err) = self.notifier.poll(handle) {
            debug!("poll notification for handle {handle} failed: {err}");
        }
    }
}

fn file_attr(attr: &NodeAttr) -> FileAttr {
    FileAttr {
        ino: attr.ino,
        size: attr.stat.size,
        blocks: 0,
        atime: attr.stat.atime,
        mtime: attr.stat.mtime,
        ctime: attr.stat.ctime,
        crtime: attr.stat.ctime,
        kind: file_type(attr.kind),
        perm: (attr.stat.mode & 0o7777) as u16,
        nlink: attr.stat.nlink,
        uid: attr.stat.uid,
        gid: attr.stat.gid,
        rdev: 0,
        blksize: 4096,
        flags: 0,
    }
}

fn file_type(kind: NodeType) -> FileType {
    match kind {
        NodeType::Directory => FileType::Directory,
        NodeType::Attribute => FileType::RegularFile,
        NodeType::Symlink => FileType::Symlink,
    }
}

impl Filesystem for GpioFs {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.proxy.attr_of_child(parent, name) {
            Ok(attr) => reply.entry(&TTL, &file_attr(&attr), 0),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.proxy.attr_of(ino) {
            Ok(attr) => reply.attr(&TTL, &file_attr(&attr)),
            Err(err) => reply.error(err.errno()),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        _size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        // Truncate requests are accepted as no-ops; attribute sizes are
        // advisory anyway.
        if let Some(mode) = mode {
            if let Err(err) = self.proxy.set_mode(ino, mode) {
                reply.error(err.errno());
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            if let Err(err) = self.proxy.set_owner(ino, uid, gid) {
                reply.error(err.errno());
                return;
            }
        }
        match self.proxy.attr_of(ino) {
            Ok(attr) => reply.attr(&TTL, &file_attr(&attr)),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        match self.proxy.readlink(ino) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.proxy.attr_of(ino) {
            Ok(attr) if attr.kind == NodeType::Attribute => reply.opened(0, 0),
            Ok(attr) if attr.kind == NodeType::Directory => reply.error(libc::EISDIR),
            Ok(_) => reply.error(libc::EPERM),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        trace!("read ino={ino} offset={offset} size={size}");
        match self.proxy.read(ino, offset.max(0) as u64, size) {
            Ok(data) => reply.data(&data),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        trace!("write ino={ino} len={}", data.len());
        match self.proxy.write(ino, data) {
            Ok(written) => reply.written(written as u32),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        match self.proxy.attr_of(ino) {
            Ok(attr) if attr.kind == NodeType::Directory => reply.opened(0, 0),
            Ok(_) => reply.error(libc::ENOTDIR),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let entries = match self.proxy.read_dir(ino) {
            Ok(entries) => entries,
            Err(err) => {
                reply.error(err.errno());
                return;
            }
        };
        for (index, entry) in entries.into_iter().enumerate().skip(offset.max(0) as usize) {
            if reply.add(
                entry.ino,
                (index + 1) as i64,
                file_type(entry.kind),
                &entry.name,
            ) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EACCES);
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        reply.error(libc::EPERM);
    }

    fn unlink(&mut self, _req: &Request<'_>, _parent: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::EPERM);
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.proxy.remove_dir(parent, name) {
            Ok(()) => reply.ok(),
            Err(err) => reply.error(err.errno()),
        }
    }

    fn poll(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        ph: PollHandle,
        _events: u32,
        _flags: u32,
        reply: ReplyPoll,
    ) {
        match self.proxy.poll(ino, ph.into()) {
            Ok(mask) => reply.poll(mask),
            Err(err) => reply.error(err.errno()),
        }
    }
}
