// Purpose: Character-device GPIO backend surface consumed by the sysfs tree.

//! Boundary between the sysfs emulation and the GPIO character-device
//! layer.
//!
//! The tree never talks to `/dev/gpiochip*` directly; it goes through the
//! [`GpioBackend`] / [`ChipPort`] / [`LinePort`] traits so the whole proxy
//! can be driven by a deterministic fake in tests. The production
//! implementation wraps the `gpiocdev` crate.

use std::fs;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use gpiocdev::line::{Direction as CdevDirection, EdgeDetection, Value};
use gpiocdev::request::Request;

/// Direction of a GPIO line, in its sysfs textual form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Line is an input.
    In,
    /// Line is an output.
    Out,
}

impl Direction {
    /// Parse the sysfs form (`in` / `out`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "in" => Some(Direction::In),
            "out" => Some(Direction::Out),
            _ => None,
        }
    }

    /// Render the sysfs form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

/// Edge detection mode of a GPIO line, in its sysfs textual form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Edge {
    /// No edge detection.
    None,
    /// Rising edges only.
    Rising,
    /// Falling edges only.
    Falling,
    /// Both edges.
    Both,
}

impl Edge {
    /// Parse the sysfs form (`none` / `rising` / `falling` / `both`).
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Edge::None),
            "rising" => Some(Edge::Rising),
            "falling" => Some(Edge::Falling),
            "both" => Some(Edge::Both),
            _ => None,
        }
    }

    /// Render the sysfs form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Edge::None => "none",
            Edge::Rising => "rising",
            Edge::Falling => "falling",
            Edge::Both => "both",
        }
    }
}

/// The configuration tuple applied to a line as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineSettings {
    /// Input or output.
    pub direction: Direction,
    /// Edge detection mode.
    pub edge: Edge,
    /// Logical inversion.
    pub active_low: bool,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            direction: Direction::In,
            edge: Edge::None,
            active_low: false,
        }
    }
}

/// Static description of a GPIO chip.
#[derive(Debug, Clone)]
pub struct ChipInfo {
    /// Kernel device name, e.g. `gpiochip0`.
    pub name: String,
    /// Functional label reported by the driver.
    pub label: String,
    /// Number of lines on the chip.
    pub num_lines: u32,
}

/// A requested GPIO line.
///
/// Dropping the port releases the line back to the kernel.
pub trait LinePort: Send + Sync {
    /// Apply the full settings tuple to the line.
    fn reconfigure(&self, settings: &LineSettings) -> io::Result<()>;

    /// Read the logical level (`true` when active).
    fn level(&self) -> io::Result<bool>;

    /// Drive the logical level.
    fn set_level(&self, active: bool) -> io::Result<()>;

    /// File descriptor that becomes readable on an edge event.
    fn event_fd(&self) -> RawFd;

    /// Read and discard one pending edge event, ignoring errors.
    fn drain_event(&self);
}

/// An open GPIO chip.
///
/// Dropping the port closes the chip handle.
pub trait ChipPort: Send {
    /// Chip description.
    fn info(&self) -> &ChipInfo;

    /// Current settings of an unrequested line.
    fn line_settings(&self, offset: u32) -> io::Result<LineSettings>;

    /// Request a line for exclusive use.
    fn request_line(&self, offset: u32, consumer: &str) -> io::Result<Box<dyn LinePort>>;
}

/// Factory opening chips by device node.
pub trait GpioBackend: Send + Sync {
    /// Open the chip behind `devnode`.
    fn open_chip(&self, devnode: &Path) -> io::Result<Box<dyn ChipPort>>;
}

/// Production backend over the GPIO character device.
#[derive(Debug, Default)]
pub struct CdevBackend;

impl GpioBackend for CdevBackend {
    fn open_chip(&self, devnode: &Path) -> io::Result<Box<dyn ChipPort>> {
        let chip = gpiocdev::chip::Chip::from_path(devnode)
            .map_err(|err| devnode_io_error(devnode, err))?;
        let info = chip.info().map_err(io::Error::other)?;
        let name = info.name.to_string();
        // Drivers may leave the label empty; fall back to the chip name so
        // the label attribute never renders blank.
        let label = if info.label.is_empty() {
            name.clone()
        } else {
            info.label.to_string()
        };
        Ok(Box::new(CdevChip {
            devnode: devnode.to_path_buf(),
            info: ChipInfo {
                name,
                label,
                num_lines: info.num_lines,
            },
            chip,
        }))
    }
}

/// Recover the errno of a vanished device node.
///
/// `gpiocdev` folds open failures into its own error type; re-probing the
/// node keeps `ENOENT` visible to the hotplug transient classification.
fn devnode_io_error(devnode: &Path, err: gpiocdev::Error) -> io::Error {
    match fs::metadata(devnode) {
        Err(probe) if probe.kind() == io::ErrorKind::NotFound => probe,
        _ => io::Error::other(err),
    }
}

struct CdevChip {
    devnode: PathBuf,
    info: ChipInfo,
    chip: gpiocdev::chip::Chip,
}

impl ChipPort for CdevChip {
    fn info(&self) -> &ChipInfo {
        &self.info
    }

    fn line_settings(&self, offset: u32) -> io::Result<LineSettings> {
        let info = self.chip.line_info(offset).map_err(io::Error::other)?;
        Ok(LineSettings {
            direction: match info.direction {
                CdevDirection::Output => Direction::Out,
                _ => Direction::In,
            },
            edge: match info.edge_detection {
                Some(EdgeDetection::RisingEdge) => Edge::Rising,
                Some(EdgeDetection::FallingEdge) => Edge::Falling,
                Some(EdgeDetection::BothEdges) => Edge::Both,
                None => Edge::None,
            },
            active_low: info.active_low,
        })
    }

    fn request_line(&self, offset: u32, consumer: &str) -> io::Result<Box<dyn LinePort>> {
        // The request itself never touches the line configuration; the
        // export path pins the observed settings right after this returns.
        let request = Request::builder()
            .on_chip(self.devnode.as_path())
            .with_consumer(consumer)
            .with_line(offset)
            .request()
            .map_err(io::Error::other)?;
        Ok(Box::new(CdevLine { request, offset }))
    }
}

struct CdevLine {
    request: Request,
    offset: u32,
}

impl LinePort for CdevLine {
    fn reconfigure(&self, settings: &LineSettings) -> io::Result<()> {
        let mut config = self.request.config();
        config.with_line(self.offset);
        match settings.direction {
            Direction::In => {
                config.as_input();
            }
            Direction::Out => {
                let value = self.request.value(self.offset).unwrap_or(Value::Inactive);
                config.as_output(value);
            }
        }
        let edge = match settings.edge {
            Edge::None => None,
            Edge::Rising => Some(EdgeDetection::RisingEdge),
            Edge::Falling => Some(EdgeDetection::FallingEdge),
            Edge::Both => Some(EdgeDetection::BothEdges),
        };
        config.with_edge_detection(edge);
        if settings.active_low {
            config.as_active_low();
        } else {
            config.as_active_high();
        }
        self.request
            .reconfigure(&config)
            .map(|_| ())
            .map_err(io::Error::other)
    }

    fn level(&self) -> io::Result<bool> {
        self.request
            .value(self.offset)
            .map(|value| value == Value::Active)
            .map_err(io::Error::other)
    }

    fn set_level(&self, active: bool) -> io::Result<()> {
        let value = if active { Value::Active } else { Value::Inactive };
        self.request
            .set_value(self.offset, value)
            .map(|_| ())
            .map_err(io::Error::other)
    }

    fn event_fd(&self) -> RawFd {
        self.request.as_raw_fd()
    }

    fn drain_event(&self) {
        // The fd may have raced a concurrent unexport; a failed read here
        // only means there is nothing left to drain.
        if let Ok(true) = self.request.has_edge_event() {
            let _ = self.request.read_edge_event();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_forms_round_trip() {
        for d in [Direction::In, Direction::Out] {
            assert_eq!(Direction::parse(d.as_str()), Some(d));
        }
        assert_eq!(Direction::parse("sideways"), None);
    }

    #[test]
    fn edge_forms_round_trip() {
        for e in [Edge::None, Edge::Rising, Edge::Falling, Edge::Both] {
            assert_eq!(Edge::parse(e.as_str()), Some(e));
        }
        assert_eq!(Edge::parse("ridge"), None);
    }
}
