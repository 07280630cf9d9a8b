// Purpose: Exported-line entity behind the per-gpio attribute files.

//! State of a single exported line.
//!
//! An [`ExportedLine`] owns the requested-line handle and the cached
//! `(direction, edge, active_low)` tuple the attribute files render. Writes
//! parse and reconfigure as a unit: the cache only moves once the backend
//! has accepted the new settings.

use std::os::unix::io::RawFd;
use std::sync::Mutex;

use log::debug;

use super::watch::PollWaker;
use super::{Error, Result};
use crate::gpio::{Direction, Edge, LinePort, LineSettings};

/// The four attribute files of a `gpio<N>` directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineAttr {
    /// `direction`: `in` or `out`.
    Direction,
    /// `edge`: `none`, `rising`, `falling` or `both`.
    Edge,
    /// `active_low`: `0` or `1`.
    ActiveLow,
    /// `value`: `0` or `1`, pollable.
    Value,
}

#[derive(Debug, Default)]
struct PollArm {
    pending: bool,
    handle: Option<u64>,
}

/// A line surfaced as `gpio<N>`.
pub struct ExportedLine {
    number: u32,
    chip_name: String,
    port: Box<dyn LinePort>,
    settings: Mutex<LineSettings>,
    poll: Mutex<PollArm>,
}

impl ExportedLine {
    /// Wrap a freshly requested line with its observed settings.
    pub fn new(
        number: u32,
        chip_name: impl Into<String>,
        port: Box<dyn LinePort>,
        initial: LineSettings,
    ) -> Self {
        Self {
            number,
            chip_name: chip_name.into(),
            port,
            settings: Mutex::new(initial),
            poll: Mutex::new(PollArm::default()),
        }
    }

    /// Global line number (`chip base + offset`).
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Kernel name of the owning chip, used for unbind cascades.
    pub fn chip_name(&self) -> &str {
        &self.chip_name
    }

    /// File descriptor delivering edge events for this line.
    pub fn event_fd(&self) -> RawFd {
        self.port.event_fd()
    }

    /// Render one attribute, newline-terminated.
    pub fn read_attr(&self, attr: LineAttr) -> Result<String> {
        let settings = *self.settings.lock().expect("poisoned line settings lock");
        Ok(match attr {
            LineAttr::Direction => format!("{}\n", settings.direction.as_str()),
            LineAttr::Edge => format!("{}\n", settings.edge.as_str()),
            LineAttr::ActiveLow => format!("{}\n", u8::from(settings.active_low)),
            LineAttr::Value => format!("{}\n", u8::from(self.port.level()?)),
        })
    }

    /// Parse and apply a write to one attribute.
    pub fn write_attr(&self, attr: LineAttr, payload: &str) -> Result<()> {
        match attr {
            LineAttr::Direction => {
                let direction = Direction::parse(payload)
                    .ok_or_else(|| Error::invalid(format!("bad direction: {payload:?}")))?;
                self.update_settings(|s| s.direction = direction)
            }
            LineAttr::Edge => {
                let edge = Edge::parse(payload)
                    .ok_or_else(|| Error::invalid(format!("bad edge: {payload:?}")))?;
                self.update_settings(|s| s.edge = edge)
            }
            LineAttr::ActiveLow => {
                let active_low = parse_digit(payload)? != 0;
                self.update_settings(|s| s.active_low = active_low)
            }
            LineAttr::Value => {
                let level = parse_digit(payload)? != 0;
                self.port.set_level(level)?;
                Ok(())
            }
        }
    }

    fn update_settings(&self, apply: impl FnOnce(&mut LineSettings)) -> Result<()> {
        let mut settings = self.settings.lock().expect("poisoned line settings lock");
        let mut updated = *settings;
        apply(&mut updated);
        if updated == *settings {
            return Ok(());
        }
        self.port.reconfigure(&updated)?;
        debug!(
            "gpio{}: reconfigured direction={} edge={} active_low={}",
            self.number,
            updated.direction.as_str(),
            updated.edge.as_str(),
            updated.active_low
        );
        *settings = updated;
        Ok(())
    }

    /// Poll entry point: consume the pending flag and arm the handle.
    ///
    /// Plain reads and writes never block on sysfs attributes, so the mask
    /// always carries readable and writable; an edge since the last poll
    /// additionally raises priority.
    pub fn poll_mask(&self, handle: u64) -> u32 {
        let mut poll = self.poll.lock().expect("poisoned line poll lock");
        let pending = std::mem::take(&mut poll.pending);
        if poll.handle.is_none() {
            poll.handle = Some(handle);
        }
        let mut mask = (libc::POLLIN | libc::POLLOUT) as u32;
        if pending {
            mask |= libc::POLLPRI as u32;
        }
        mask
    }

    /// Watcher entry point: flag the edge and wake the armed poll, if any.
    ///
    /// The handle is consumed; a client must re-poll to rearm.
    pub fn notify_poll(&self, waker: &dyn PollWaker) {
        let handle = {
            let mut poll = self.poll.lock().expect("poisoned line poll lock");
            match poll.handle.take() {
                Some(handle) => {
                    poll.pending = true;
                    Some(handle)
                }
                None => None,
            }
        };
        if let Some(handle) = handle {
            waker.wake(handle);
        }
    }

    /// Read and discard one pending edge event.
    pub fn drain_event(&self) {
        self.port.drain_event();
    }
}

fn parse_digit(payload: &str) -> Result<u8> {
    let mut bytes = payload.bytes();
    match (bytes.next(), bytes.next()) {
        (Some(b), None) if b.is_ascii_digit() => Ok(b - b'0'),
        _ => Err(Error::invalid(format!("not a digit: {payload:?}"))),
    }
}
