// Purpose: End-to-end scenarios driven through the public proxy core.

//! Exercises the emulation core the way a mounted client would: hotplug
//! events feed chips in, export surfaces lines, attribute writes
//! reconfigure, edge events wake polls. The character-device layer is a
//! deterministic fake; edges are simulated through pipes.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use gpiofs::gpio::{ChipInfo, ChipPort, Direction, Edge, GpioBackend, LinePort, LineSettings};
use gpiofs::sysfs::hotplug::{HotplugAction, HotplugEvent};
use gpiofs::sysfs::watch::PollWaker;
use gpiofs::GpioProxy;

const MOUNT_ROOT: &str = "/mnt/gpio";

type EdgeTaps = Arc<Mutex<HashMap<(String, u32), File>>>;
type LineConfigs = Arc<Mutex<HashMap<(String, u32), LineSettings>>>;

struct FakeBackend {
    chips: Mutex<HashMap<PathBuf, ChipInfo>>,
    taps: EdgeTaps,
    initials: LineConfigs,
    applied: LineConfigs,
}

impl FakeBackend {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            chips: Mutex::new(HashMap::new()),
            taps: Arc::new(Mutex::new(HashMap::new())),
            initials: Arc::new(Mutex::new(HashMap::new())),
            applied: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    fn add_chip(&self, name: &str, label: &str, num_lines: u32) {
        self.chips.lock().unwrap().insert(
            PathBuf::from(format!("/dev/{name}")),
            ChipInfo {
                name: name.to_owned(),
                label: label.to_owned(),
                num_lines,
            },
        );
    }

    /// Seed the pre-request settings a line reports before export.
    fn set_line_settings(&self, chip: &str, offset: u32, settings: LineSettings) {
        self.initials
            .lock()
            .unwrap()
            .insert((chip.to_owned(), offset), settings);
    }

    /// Last settings applied to the live request, if any.
    fn applied_settings(&self, chip: &str, offset: u32) -> Option<LineSettings> {
        self.applied
            .lock()
            .unwrap()
            .get(&(chip.to_owned(), offset))
            .copied()
    }

    /// Simulate an external edge on a requested line.
    fn trigger_edge(&self, chip: &str, offset: u32) {
        let mut taps = self.taps.lock().unwrap();
        let tap = taps
            .get_mut(&(chip.to_owned(), offset))
            .expect("line is requested");
        tap.write_all(b"e").expect("edge pipe");
    }
}

impl GpioBackend for FakeBackend {
    fn open_chip(&self, devnode: &Path) -> io::Result<Box<dyn ChipPort>> {
        let info = self
            .chips
            .lock()
            .unwrap()
            .get(devnode)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        Ok(Box::new(FakeChip {
            info,
            taps: self.taps.clone(),
            initials: self.initials.clone(),
            applied: self.applied.clone(),
        }))
    }
}

struct FakeChip {
    info: ChipInfo,
    taps: EdgeTaps,
    initials: LineConfigs,
    applied: LineConfigs,
}

impl ChipPort for FakeChip {
    fn info(&self) -> &ChipInfo {
        &self.info
    }

    fn line_settings(&self, offset: u32) -> io::Result<LineSettings> {
        Ok(self
            .initials
            .lock()
            .unwrap()
            .get(&(self.info.name.clone(), offset))
            .copied()
            .unwrap_or_default())
    }

    fn request_line(&self, offset: u32, _consumer: &str) -> io::Result<Box<dyn LinePort>> {
        let (rx, tx) = nix::unistd::pipe().map_err(|err| io::Error::from_raw_os_error(err as i32))?;
        self.taps
            .lock()
            .unwrap()
            .insert((self.info.name.clone(), offset), File::from(tx));
        Ok(Box::new(FakeLine {
            key: (self.info.name.clone(), offset),
            applied: self.applied.clone(),
            rx: Mutex::new(File::from(rx)),
            level: AtomicBool::new(false),
        }))
    }
}

struct FakeLine {
    key: (String, u32),
    applied: LineConfigs,
    rx: Mutex<File>,
    level: AtomicBool,
}

impl LinePort for FakeLine {
    fn reconfigure(&self, settings: &LineSettings) -> io::Result<()> {
        self.applied
            .lock()
            .unwrap()
            .insert(self.key.clone(), *settings);
        Ok(())
    }

    fn level(&self) -> io::Result<bool> {
        Ok(self.level.load(Ordering::SeqCst))
    }

    fn set_level(&self, active: bool) -> io::Result<()> {
        self.level.store(active, Ordering::SeqCst);
        Ok(())
    }

    fn event_fd(&self) -> RawFd {
        self.rx.lock().unwrap().as_raw_fd()
    }

    fn drain_event(&self) {
        let mut buf = [0u8; 64];
        let _ = self.rx.lock().unwrap().read(&mut buf);
    }
}

struct ChannelWaker(mpsc::Sender<u64>);

impl PollWaker for ChannelWaker {
    fn wake(&self, handle: u64) {
        let _ = self.0.send(handle);
    }
}

fn bind_event(name: &str) -> HotplugEvent {
    HotplugEvent {
        action: HotplugAction::Bind,
        name: name.to_owned(),
        devnode: Some(PathBuf::from(format!("/dev/{name}"))),
        syspath: PathBuf::from(format!("/sys/devices/platform/soc/{name}")),
    }
}

fn unbind_event(name: &str) -> HotplugEvent {
    HotplugEvent {
        action: HotplugAction::Unbind,
        name: name.to_owned(),
        devnode: Some(PathBuf::from(format!("/dev/{name}"))),
        syspath: PathBuf::from(format!("/sys/devices/platform/soc/{name}")),
    }
}

fn proxy_with(chips: &[(&str, &str, u32)]) -> (Arc<FakeBackend>, GpioProxy) {
    let backend = FakeBackend::new();
    for (name, label, lines) in chips {
        backend.add_chip(name, label, *lines);
    }
    let proxy = GpioProxy::new(backend.clone(), MOUNT_ROOT).expect("start proxy");
    for (name, _, _) in chips {
        proxy.apply_hotplug(&bind_event(name)).expect("bind chip");
    }
    (backend, proxy)
}

fn names(proxy: &GpioProxy, path: &str) -> Vec<String> {
    proxy
        .read_dir_path(path)
        .expect("readdir")
        .into_iter()
        .map(|e| e.name)
        .collect()
}

#[test]
fn startup_snapshot_lists_single_chip() {
    let (_backend, proxy) = proxy_with(&[("gpiochip0", "pinctrl-bank0", 32)]);
    assert_eq!(
        names(&proxy, "/"),
        vec![".", "..", "export", "unexport", "gpiochip512"]
    );
    assert_eq!(proxy.read_path("/gpiochip512/base").expect("base"), b"512\n");
    assert_eq!(proxy.read_path("/gpiochip512/ngpio").expect("ngpio"), b"32\n");
    assert_eq!(
        proxy.read_path("/gpiochip512/label").expect("label"),
        b"pinctrl-bank0\n"
    );
    proxy.shutdown();
}

#[test]
fn bases_allocate_in_order_and_reuse_gaps() {
    let (backend, proxy) = proxy_with(&[("gpiochip0", "bank0", 32), ("gpiochip1", "bank1", 16)]);
    assert_eq!(
        names(&proxy, "/"),
        vec![".", "..", "export", "unexport", "gpiochip512", "gpiochip544"]
    );

    proxy
        .apply_hotplug(&unbind_event("gpiochip0"))
        .expect("unbind first chip");
    backend.add_chip("gpiochip2", "bank2", 8);
    proxy
        .apply_hotplug(&bind_event("gpiochip2"))
        .expect("bind third chip");
    assert_eq!(proxy.read_path("/gpiochip512/ngpio").expect("ngpio"), b"8\n");
    assert_eq!(
        proxy.read_path("/gpiochip512/label").expect("label"),
        b"bank2\n"
    );
    proxy.shutdown();
}

#[test]
fn export_surfaces_line_directory() {
    let (_backend, proxy) = proxy_with(&[("gpiochip0", "bank0", 32)]);
    let written = proxy.write_path("/export", b"520\n").expect("export 520");
    assert_eq!(written, 4);

    assert_eq!(
        names(&proxy, "/gpio520"),
        vec![
            ".",
            "..",
            "active_low",
            "direction",
            "edge",
            "value",
            "uevent",
            "device",
            "power",
            "subsystem"
        ]
    );
    assert_eq!(
        proxy.read_path("/gpio520/direction").expect("direction"),
        b"in\n"
    );
    assert_eq!(
        proxy.read_path("/gpio520/active_low").expect("active_low"),
        b"0\n"
    );
    assert_eq!(proxy.read_path("/gpio520/edge").expect("edge"), b"none\n");

    proxy
        .write_path("/gpio520/direction", b"out\n")
        .expect("switch to output");
    proxy
        .write_path("/gpio520/value", b"1\n")
        .expect("drive high");
    assert_eq!(proxy.read_path("/gpio520/value").expect("value"), b"1\n");
    proxy.shutdown();
}

#[test]
fn export_preserves_preexisting_output_direction() {
    let (backend, proxy) = proxy_with(&[("gpiochip0", "bank0", 32)]);
    backend.set_line_settings(
        "gpiochip0",
        8,
        LineSettings {
            direction: Direction::Out,
            edge: Edge::None,
            active_low: false,
        },
    );
    proxy.write_path("/export", b"520").expect("export");

    // The attribute cache renders the observed direction...
    assert_eq!(
        proxy.read_path("/gpio520/direction").expect("direction"),
        b"out\n"
    );
    // ...and the live request was pinned to the same settings.
    let applied = backend
        .applied_settings("gpiochip0", 8)
        .expect("request reconfigured at export");
    assert_eq!(applied.direction, Direction::Out);
    assert_eq!(applied.edge, Edge::None);
    assert!(!applied.active_low);
    proxy.shutdown();
}

#[test]
fn unexport_removes_line_directory() {
    let (_backend, proxy) = proxy_with(&[("gpiochip0", "bank0", 32)]);
    proxy.write_path("/export", b"520").expect("export");
    proxy.write_path("/unexport", b"520").expect("unexport");

    let err = proxy.read_path("/gpio520/value").expect_err("gone");
    assert_eq!(err.errno(), libc::ENOENT);
    assert!(!names(&proxy, "/").contains(&"gpio520".to_owned()));
    proxy.shutdown();
}

#[test]
fn uevent_write_is_pattern_validated() {
    let (_backend, proxy) = proxy_with(&[("gpiochip0", "bank0", 32)]);
    let payload = b"add 12345678-1234-1234-1234-123456789abc KEY=VAL";
    assert_eq!(
        proxy
            .write_path("/gpiochip512/uevent", payload)
            .expect("valid uevent"),
        payload.len()
    );
    let err = proxy
        .write_path("/gpiochip512/uevent", b"junk")
        .expect_err("invalid uevent");
    assert_eq!(err.errno(), libc::EINVAL);
    proxy.shutdown();
}

#[test]
fn invalid_control_payloads_yield_einval() {
    let (_backend, proxy) = proxy_with(&[("gpiochip0", "bank0", 32)]);
    for (path, payload) in [
        ("/export", b"abc".as_slice()),
        ("/export", b"5x".as_slice()),
        ("/unexport", b"".as_slice()),
        ("/export", b"999".as_slice()),
        ("/unexport", b"520".as_slice()),
    ] {
        let err = proxy.write_path(path, payload).expect_err("rejected");
        assert_eq!(err.errno(), libc::EINVAL, "payload {payload:?} on {path}");
    }

    proxy.write_path("/export", b"520").expect("export");
    for (path, payload) in [
        ("/gpio520/active_low", b"yes".as_slice()),
        ("/gpio520/value", b"x".as_slice()),
        ("/gpio520/direction", b"north".as_slice()),
        ("/gpio520/edge", b"steep".as_slice()),
    ] {
        let err = proxy.write_path(path, payload).expect_err("rejected");
        assert_eq!(err.errno(), libc::EINVAL, "payload {payload:?} on {path}");
    }
    // A second export of the same line is refused as well.
    let err = proxy.write_path("/export", b"520").expect_err("double export");
    assert_eq!(err.errno(), libc::EINVAL);
    proxy.shutdown();
}

#[test]
fn read_only_attributes_refuse_writes() {
    let (_backend, proxy) = proxy_with(&[("gpiochip0", "bank0", 32)]);
    let err = proxy
        .write_path("/gpiochip512/base", b"9")
        .expect_err("read-only");
    assert_eq!(err.errno(), libc::EPERM);
    proxy.shutdown();
}

#[test]
fn edge_event_cycle_raises_pollpri_once() {
    let (backend, proxy) = proxy_with(&[("gpiochip0", "bank0", 32)]);
    let (tx, rx) = mpsc::channel();
    proxy.set_waker(Arc::new(ChannelWaker(tx)));

    proxy.write_path("/export", b"520").expect("export");
    proxy
        .write_path("/gpio520/edge", b"both")
        .expect("enable edges");

    let mask = proxy.poll_path("/gpio520/value", 11).expect("arm poll");
    assert_eq!(mask & libc::POLLPRI as u32, 0);
    assert_ne!(mask & libc::POLLIN as u32, 0);
    assert_ne!(mask & libc::POLLOUT as u32, 0);

    backend.trigger_edge("gpiochip0", 8);
    let woken = rx.recv_timeout(Duration::from_secs(5)).expect("wakeup");
    assert_eq!(woken, 11);

    let mask = proxy.poll_path("/gpio520/value", 12).expect("re-poll");
    assert_ne!(mask & libc::POLLPRI as u32, 0);
    // Without a new edge the priority flag stays consumed.
    let mask = proxy.poll_path("/gpio520/value", 13).expect("re-poll again");
    assert_eq!(mask & libc::POLLPRI as u32, 0);
    proxy.shutdown();
}

#[test]
fn reexport_does_not_replay_stale_edges() {
    let (backend, proxy) = proxy_with(&[("gpiochip0", "bank0", 32)]);
    let (tx, rx) = mpsc::channel();
    proxy.set_waker(Arc::new(ChannelWaker(tx)));

    proxy.write_path("/export", b"520").expect("export");
    proxy
        .write_path("/gpio520/edge", b"both")
        .expect("enable edges");
    proxy.poll_path("/gpio520/value", 1).expect("arm");
    backend.trigger_edge("gpiochip0", 8);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)), Ok(1));

    proxy.write_path("/unexport", b"520").expect("unexport");
    proxy.write_path("/export", b"520").expect("re-export");
    let mask = proxy.poll_path("/gpio520/value", 2).expect("fresh poll");
    assert_eq!(mask & libc::POLLPRI as u32, 0);
    assert!(rx.recv_timeout(Duration::from_millis(300)).is_err());
    proxy.shutdown();
}

#[test]
fn chip_unbind_cascades_exported_lines() {
    let (backend, proxy) = proxy_with(&[("gpiochip0", "bank0", 32)]);
    proxy.write_path("/export", b"513").expect("export 513");
    proxy.write_path("/export", b"520").expect("export 520");

    proxy
        .apply_hotplug(&unbind_event("gpiochip0"))
        .expect("unbind");
    assert_eq!(names(&proxy, "/"), vec![".", "..", "export", "unexport"]);

    // The base range is free again for the next chip.
    backend.add_chip("gpiochip1", "bank1", 16);
    proxy
        .apply_hotplug(&bind_event("gpiochip1"))
        .expect("rebind");
    assert_eq!(proxy.read_path("/gpiochip512/base").expect("base"), b"512\n");
    proxy.write_path("/export", b"515").expect("export on new chip");
    proxy.shutdown();
}

#[test]
fn hotplug_ignores_incomplete_or_vanished_devices() {
    let (_backend, proxy) = proxy_with(&[]);
    // No device node: ignored.
    proxy
        .apply_hotplug(&HotplugEvent {
            action: HotplugAction::Bind,
            name: "gpio-export".to_owned(),
            devnode: None,
            syspath: PathBuf::from("/sys/devices/virtual/gpio-export"),
        })
        .expect("event without devnode");
    // Device vanished before the open: swallowed.
    proxy
        .apply_hotplug(&bind_event("gpiochip9"))
        .expect("vanished device");
    // Unbind of something never bound: ignored.
    proxy
        .apply_hotplug(&unbind_event("gpiochip9"))
        .expect("unknown unbind");
    assert_eq!(names(&proxy, "/"), vec![".", "..", "export", "unexport"]);
    proxy.shutdown();
}

#[test]
fn readlink_resolves_documented_symlinks() {
    let (_backend, proxy) = proxy_with(&[("gpiochip0", "bank0", 32)]);
    proxy.write_path("/export", b"520").expect("export");

    assert_eq!(
        proxy
            .readlink_path("/gpiochip512/device")
            .expect("device target"),
        "/sys/devices/platform/soc/gpiochip0"
    );
    assert_eq!(
        proxy
            .readlink_path("/gpiochip512/power")
            .expect("power target"),
        "/sys/devices/platform/soc/gpiochip0/power"
    );
    assert_eq!(
        proxy
            .readlink_path("/gpio520/subsystem")
            .expect("subsystem target"),
        MOUNT_ROOT
    );
    // Non-symlinks and missing paths both answer permission-denied.
    assert_eq!(
        proxy
            .readlink_path("/gpiochip512/base")
            .expect_err("not a symlink")
            .errno(),
        libc::EPERM
    );
    assert_eq!(
        proxy
            .readlink_path("/no/such/node")
            .expect_err("missing path")
            .errno(),
        libc::EPERM
    );
    proxy.shutdown();
}

#[test]
fn directories_always_list_dot_entries_first() {
    let (_backend, proxy) = proxy_with(&[("gpiochip0", "bank0", 32)]);
    proxy.write_path("/export", b"520").expect("export");
    for path in ["/", "/gpiochip512", "/gpio520"] {
        let listing = names(&proxy, path);
        assert_eq!(&listing[..2], &[".", ".."], "listing of {path}");
    }
    proxy.shutdown();
}

#[test]
fn tree_mutation_is_refused_with_documented_errnos() {
    let (_backend, proxy) = proxy_with(&[("gpiochip0", "bank0", 32)]);
    let root = proxy.lookup_ino("/").expect("root ino");
    assert_eq!(
        proxy
            .remove_dir(root, "gpiochip512")
            .expect_err("rmdir on dir")
            .errno(),
        libc::ENOTDIR
    );
    assert_eq!(
        proxy
            .remove_dir(root, "export")
            .expect_err("rmdir on file")
            .errno(),
        libc::EPERM
    );
    assert_eq!(
        proxy
            .remove_dir(root, "missing")
            .expect_err("rmdir on nothing")
            .errno(),
        libc::ENOENT
    );
    proxy.shutdown();
}
