// Purpose: udev-driven chip bind/unbind integration.

//! Hotplug feed for the chip registry.
//!
//! The kernel side is consumed as a stream of `(action, device)` events
//! plus an initial enumeration snapshot, both filtered to the `gpio`
//! subsystem. Only `bind` and `unbind` are recognized; everything else the
//! bus emits is ignored. The monitor thread multiplexes the udev socket
//! with a stop pipe, the same wakeup idiom the event watcher uses.
//!
//! A device can vanish between the notification and our open; those
//! failures are swallowed. Any other failure while handling an event is
//! unrecoverable and terminates the process with exit code 1.

use std::fs::File;
use std::io::{self, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use anyhow::Context;
use log::{debug, error, info, warn};
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};

use super::GpioProxy;

const WAIT_TIMEOUT_MS: u16 = 60_000;

/// `udev::MonitorSocket` wraps raw `libudev` pointers and so isn't `Send`,
/// even though ownership is handed off to the monitor thread wholesale (the
/// spawning thread never touches it again). This wrapper asserts that move
/// is sound so the socket can cross the `thread::spawn` boundary.
struct SendMonitorSocket(udev::MonitorSocket);

unsafe impl Send for SendMonitorSocket {}

/// Recognized hotplug actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HotplugAction {
    /// A chip appeared; open it and allocate a base.
    Bind,
    /// A chip disappeared; cascade removal and free its base.
    Unbind,
}

/// One hotplug notification reduced to what the registry needs.
#[derive(Debug, Clone)]
pub struct HotplugEvent {
    /// Bind or unbind.
    pub action: HotplugAction,
    /// Kernel device name, e.g. `gpiochip0`.
    pub name: String,
    /// Character-device node; events without one are ignored.
    pub devnode: Option<PathBuf>,
    /// The device's sysfs directory.
    pub syspath: PathBuf,
}

/// Whether an open failure means the device is already gone.
pub(crate) fn is_device_gone(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::NotFound
        || matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::ENODEV))
}

/// Enumerate the GPIO bus and feed synthetic bind events to the proxy.
pub fn snapshot(proxy: &GpioProxy) -> anyhow::Result<()> {
    let mut enumerator = udev::Enumerator::new().context("create udev enumerator")?;
    enumerator
        .match_subsystem("gpio")
        .context("filter gpio subsystem")?;
    let devices = enumerator.scan_devices().context("scan gpio devices")?;
    for device in devices {
        let Some(event) = event_from_device(HotplugAction::Bind, &device) else {
            continue;
        };
        proxy
            .apply_hotplug(&event)
            .with_context(|| format!("bind {} from snapshot", event.name))?;
    }
    Ok(())
}

fn event_from_device(action: HotplugAction, device: &udev::Device) -> Option<HotplugEvent> {
    let name = device.sysname().to_str()?.to_owned();
    Some(HotplugEvent {
        action,
        name,
        devnode: device.devnode().map(Path::to_path_buf),
        syspath: device.syspath().to_path_buf(),
    })
}

/// Handle stopping the monitor thread.
pub struct HotplugMonitor {
    thread: Mutex<Option<JoinHandle<()>>>,
    stop_tx: Mutex<File>,
}

impl HotplugMonitor {
    /// Subscribe to gpio subsystem uevents and start the monitor thread.
    pub fn spawn(proxy: GpioProxy) -> io::Result<Self> {
        let socket = udev::MonitorBuilder::new()?
            .match_subsystem("gpio")?
            .listen()?;
        let (rx, tx) =
            nix::unistd::pipe().map_err(|err| io::Error::from_raw_os_error(err as i32))?;
        let stop_rx = File::from(rx);
        let socket = SendMonitorSocket(socket);
        let worker = thread::Builder::new()
            .name("gpiofs-hotplug".into())
            .spawn(move || {
                let socket = socket;
                run(proxy, socket.0, stop_rx)
            })?;
        Ok(Self {
            thread: Mutex::new(Some(worker)),
            stop_tx: Mutex::new(File::from(tx)),
        })
    }

    /// Stop the thread and join it.
    pub fn stop(&self) {
        {
            let mut tx = self.stop_tx.lock().expect("poisoned monitor lock");
            if let Err(err) = tx.write_all(b"q") {
                warn!("hotplug monitor stop-pipe write failed: {err}");
            }
        }
        if let Some(worker) = self.thread.lock().expect("poisoned monitor lock").take() {
            let _ = worker.join();
        }
    }
}

fn run(proxy: GpioProxy, socket: udev::MonitorSocket, stop_rx: File) {
    info!("watching the gpio subsystem for chip hotplug");
    loop {
        // The socket is owned by this frame, so its fd stays valid for the
        // duration of the wait.
        let socket_fd = unsafe { BorrowedFd::borrow_raw(socket.as_raw_fd()) };
        let mut fds = [
            PollFd::new(socket_fd, PollFlags::POLLIN),
            PollFd::new(stop_rx.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::from(WAIT_TIMEOUT_MS)) {
            Ok(0) => continue,
            Ok(_) => {}
            Err(nix::errno::Errno::EINTR) => continue,
            Err(err) => {
                warn!("hotplug monitor poll failed: {err}");
                continue;
            }
        }
        if fds[1].revents().is_some_and(|r| !r.is_empty()) {
            debug!("hotplug monitor stopping");
            return;
        }
        if !fds[0].revents().is_some_and(|r| !r.is_empty()) {
            continue;
        }
        for event in socket.iter() {
            let action = match event.event_type() {
                udev::EventType::Bind => HotplugAction::Bind,
                udev::EventType::Unbind => HotplugAction::Unbind,
                _ => continue,
            };
            let Some(event) = event_from_device(action, &event.device()) else {
                continue;
            };
            if let Err(err) = proxy.apply_hotplug(&event) {
                let err = anyhow::Error::new(err)
                    .context(format!("handling {:?} of {}", event.action, event.name));
                error!("fatal hotplug failure: {err:?}");
                std::process::exit(1);
            }
        }
    }
}
