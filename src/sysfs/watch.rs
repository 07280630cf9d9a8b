// Purpose: Edge-event watcher thread waking blocked poll clients.

//! Multiplexes the edge-event descriptors of every exported line.
//!
//! A single background thread waits for readability on the watched set plus
//! a self-pipe. Watched-set mutations and shutdown write one byte to the
//! pipe so they take effect before the next wait. The watcher only ever
//! holds weak references into the line entities; callers unwatch before the
//! owning `gpio<N>` node releases the line.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread::{self, JoinHandle};

use log::{trace, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::line::ExportedLine;

/// Sink the watcher notifies when an armed poll handle must wake.
pub trait PollWaker: Send + Sync {
    /// Wake the filesystem client that armed `handle`.
    fn wake(&self, handle: u64);
}

const WAIT_TIMEOUT_MS: u16 = 60_000;

struct Shared {
    lines: Mutex<HashMap<RawFd, Weak<ExportedLine>>>,
    keep_going: AtomicBool,
    wake_tx: Mutex<File>,
    waker: OnceLock<Arc<dyn PollWaker>>,
}

/// Handle to the watcher thread.
pub struct EventWatcher {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventWatcher {
    /// Start the watcher with an empty watched set.
    pub fn spawn() -> io::Result<Self> {
        let (rx, tx) =
            nix::unistd::pipe().map_err(|err| io::Error::from_raw_os_error(err as i32))?;
        let shared = Arc::new(Shared {
            lines: Mutex::new(HashMap::new()),
            keep_going: AtomicBool::new(true),
            wake_tx: Mutex::new(File::from(tx)),
            waker: OnceLock::new(),
        });
        let wake_rx = File::from(rx);
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("gpiofs-watch".into())
                .spawn(move || run(shared, wake_rx))?
        };
        Ok(Self {
            shared,
            thread: Mutex::new(Some(worker)),
        })
    }

    /// Install the wake sink once the filesystem session exists.
    pub fn set_waker(&self, waker: Arc<dyn PollWaker>) {
        let _ = self.shared.waker.set(waker);
    }

    /// Add a line's event fd to the watched set.
    pub fn watch_line(&self, line: &Arc<ExportedLine>) {
        self.shared
            .lines
            .lock()
            .expect("poisoned watcher lock")
            .insert(line.event_fd(), Arc::downgrade(line));
        self.poke();
    }

    /// Drop a line from the watched set before its fd is released.
    pub fn unwatch_line(&self, fd: RawFd) {
        self.shared
            .lines
            .lock()
            .expect("poisoned watcher lock")
            .remove(&fd);
        self.poke();
    }

    /// Stop the thread and join it.
    pub fn stop(&self) {
        self.shared.keep_going.store(false, Ordering::SeqCst);
        self.poke();
        if let Some(worker) = self.thread.lock().expect("poisoned watcher lock").take() {
            let _ = worker.join();
        }
    }

    fn poke(&self) {
        let mut tx = self.shared.wake_tx.lock().expect("poisoned watcher lock");
        if let Err(err) = tx.write_all(b"w") {
            warn!("event watcher self-pipe write failed: {err}");
        }
    }
}

fn run(shared: Arc<Shared>, wake_rx: File) {
    while shared.keep_going.load(Ordering::SeqCst) {
        let fds: Vec<RawFd> = {
            let mut lines = shared.lines.lock().expect("poisoned watcher lock");
            lines.retain(|_, line| line.strong_count() > 0);
            lines.keys().copied().collect()
        };

        // A stale descriptor that raced an unexport polls as POLLNVAL and is
        // skipped below; the map lookup is the source of truth.
        let mut poll_fds: Vec<PollFd> = fds
            .iter()
            .map(|fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN))
            .collect();
        poll_fds.push(PollFd::new(wake_rx.as_fd(), PollFlags::POLLIN));

        match poll(&mut poll_fds, PollTimeout::from(WAIT_TIMEOUT_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                warn!("event watcher poll failed: {err}");
                continue;
            }
        }

        let pipe_ready = poll_fds
            .last()
            .and_then(|p| p.revents())
            .is_some_and(|r| !r.is_empty());
        let ready: Vec<RawFd> = poll_fds[..fds.len()]
            .iter()
            .zip(&fds)
            .filter(|(p, _)| p.revents().is_some_and(|r| !r.is_empty()))
            .map(|(_, fd)| *fd)
            .collect();
        drop(poll_fds);

        if pipe_ready {
            let mut buf = [0u8; 1024];
            let _ = (&wake_rx).read(&mut buf);
        }

        for fd in ready {
            let line = shared
                .lines
                .lock()
                .expect("poisoned watcher lock")
                .get(&fd)
                .and_then(Weak::upgrade);
            let Some(line) = line else {
                continue;
            };
            trace!("edge event on gpio{}", line.number());
            line.drain_event();
            if let Some(waker) = shared.waker.get() {
                line.notify_poll(waker.as_ref());
            }
        }
    }
}
