// Purpose: Crate surface for the gpiofs sysfs compatibility layer.

//! gpiofs re-creates the retired `/sys/class/gpio` tree on top of the GPIO
//! character-device interface, served through FUSE.
//!
//! The [`sysfs`] module is the emulation core: a virtual node tree, the
//! chip/line domain behind it, the base allocator, the edge-event watcher
//! and the hotplug integration. The [`gpio`] module is the boundary to the
//! character-device layer, implemented over `gpiocdev` in production and by
//! fakes in the test suite.
//!
//! ```text
//! udev bind/unbind ──▶ GpioProxy ◀── fuser callbacks
//!                        │  ▲
//!         gpiocdev requests  └── POLLPRI wakeups from the event watcher
//! ```

pub mod gpio;
pub mod sysfs;

pub use gpio::{CdevBackend, GpioBackend};
pub use sysfs::{Error, GpioProxy, Result};
