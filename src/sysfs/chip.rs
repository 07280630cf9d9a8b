// Purpose: Chip registry and the export/unexport lifecycle.

//! Chips and their exported lines.
//!
//! `State` is the single shared-state bundle behind the proxy's mutex: the
//! node tree, the chip entries, the exported-line registry and the base
//! allocator move together so every mutation observes a consistent view.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info};

use super::alloc::BaseAllocator;
use super::line::{ExportedLine, LineAttr};
use super::node::{Node, Tree};
use super::watch::EventWatcher;
use super::{Error, Result};
use crate::gpio::ChipPort;

/// Consumer label stamped on every requested line.
const CONSUMER: &str = "sysfs";

/// A chip currently present on the bus.
pub struct ChipEntry {
    name: String,
    label: String,
    num_lines: u32,
    base: u32,
    syspath: PathBuf,
    port: Box<dyn ChipPort>,
}

impl ChipEntry {
    /// Kernel device name (`gpiochip0`).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Functional label reported by the driver.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Allocated base of this chip.
    pub fn base(&self) -> u32 {
        self.base
    }
}

/// Shared mutable state of the proxy.
pub struct State {
    tree: Tree,
    chips: Vec<ChipEntry>,
    lines: HashMap<u32, Arc<ExportedLine>>,
    alloc: BaseAllocator,
    mount_root: PathBuf,
}

impl State {
    /// Empty state rooted at `mount_root` (the `subsystem` symlink target).
    pub fn new(mount_root: PathBuf) -> Self {
        Self {
            tree: Tree::new(),
            chips: Vec::new(),
            lines: HashMap::new(),
            alloc: BaseAllocator::default(),
            mount_root,
        }
    }

    /// The node tree.
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    /// The node tree, mutably.
    pub fn tree_mut(&mut self) -> &mut Tree {
        &mut self.tree
    }

    /// Whether a chip with this kernel name is already registered.
    pub fn has_chip(&self, name: &str) -> bool {
        self.chips.iter().any(|c| c.name == name)
    }

    /// Register a freshly opened chip and surface its `gpiochip<base>` dir.
    pub fn add_chip(&mut self, port: Box<dyn ChipPort>, syspath: &Path) -> Result<u32> {
        let info = port.info().clone();
        let base = self.alloc.get_new_base(info.num_lines);
        let dir_name = format!("gpiochip{base}");
        let node = chip_dir(&info.label, base, info.num_lines, syspath, &self.mount_root);
        self.tree.insert(&[], &dir_name, node)?;
        info!(
            "bound {} as {dir_name} (label {:?}, {} lines)",
            info.name, info.label, info.num_lines
        );
        self.chips.push(ChipEntry {
            name: info.name,
            label: info.label,
            num_lines: info.num_lines,
            base,
            syspath: syspath.to_path_buf(),
            port,
        });
        Ok(base)
    }

    /// Drop a chip by kernel name, cascading removal of its exported lines.
    ///
    /// Returns `false` when no such chip is registered.
    pub fn remove_chip(&mut self, name: &str, watcher: &EventWatcher) -> Result<bool> {
        let Some(position) = self.chips.iter().position(|c| c.name == name) else {
            return Ok(false);
        };
        let exported: Vec<u32> = self
            .lines
            .values()
            .filter(|line| line.chip_name() == name)
            .map(|line| line.number())
            .collect();
        for number in exported {
            self.unexport(number, watcher)?;
        }
        let entry = self.chips.remove(position);
        self.tree.remove(&[], &format!("gpiochip{}", entry.base))?;
        self.alloc.free_range(entry.base);
        info!("unbound {} (base {})", entry.name, entry.base);
        Ok(true)
    }

    /// Export line N: request it and surface `gpio<N>` under the root.
    pub fn export(&mut self, number: u32, watcher: &EventWatcher) -> Result<()> {
        if self.lines.contains_key(&number) {
            return Err(Error::invalid(format!("gpio{number} is already exported")));
        }
        let chip = self
            .chips
            .iter()
            .find(|c| c.base <= number && number < c.base + c.num_lines)
            .ok_or_else(|| Error::invalid(format!("no chip covers gpio{number}")))?;
        let offset = number - chip.base;
        let initial = chip.port.line_settings(offset)?;
        let port = chip.port.request_line(offset, CONSUMER)?;
        // Requesting leaves the line as-is; pin the observed settings so the
        // live request matches what the attributes render.
        port.reconfigure(&initial)?;
        let line = Arc::new(ExportedLine::new(number, chip.name.clone(), port, initial));
        watcher.watch_line(&line);
        let node = gpio_dir(&line, &chip.syspath, &self.mount_root);
        self.tree.insert(&[], &format!("gpio{number}"), node)?;
        debug!("exported gpio{number} (chip {}, offset {offset})", chip.name);
        self.lines.insert(number, line);
        Ok(())
    }

    /// Unexport line N: unwatch, drop the node, release the request.
    pub fn unexport(&mut self, number: u32, watcher: &EventWatcher) -> Result<()> {
        let line = self
            .lines
            .remove(&number)
            .ok_or_else(|| Error::invalid(format!("gpio{number} is not exported")))?;
        watcher.unwatch_line(line.event_fd());
        self.tree.remove(&[], &format!("gpio{number}"))?;
        debug!("unexported gpio{number}");
        // Dropping the last strong reference releases the line request.
        drop(line);
        Ok(())
    }

    /// Release every remaining line request during teardown.
    pub fn clear(&mut self, watcher: &EventWatcher) {
        let numbers: Vec<u32> = self.lines.keys().copied().collect();
        for number in numbers {
            let _ = self.unexport(number, watcher);
        }
    }
}

fn chip_dir(
    label: &str,
    base: u32,
    num_lines: u32,
    syspath: &Path,
    mount_root: &Path,
) -> Node {
    Node::directory()
        .with_child("base", Node::const_attr(base.to_string()))
        .with_child("label", Node::const_attr(label))
        .with_child("ngpio", Node::const_attr(num_lines.to_string()))
        .with_child("uevent", Node::uevent_attr())
        .with_child("device", Node::symlink(syspath.display().to_string()))
        .with_child(
            "power",
            Node::symlink(syspath.join("power").display().to_string()),
        )
        .with_child("subsystem", Node::symlink(mount_root.display().to_string()))
}

fn gpio_dir(line: &Arc<ExportedLine>, syspath: &Path, mount_root: &Path) -> Node {
    Node::directory()
        .with_child(
            "active_low",
            Node::line_attr(line.clone(), LineAttr::ActiveLow),
        )
        .with_child(
            "direction",
            Node::line_attr(line.clone(), LineAttr::Direction),
        )
        .with_child("edge", Node::line_attr(line.clone(), LineAttr::Edge))
        .with_child("value", Node::line_attr(line.clone(), LineAttr::Value))
        .with_child("uevent", Node::uevent_attr())
        .with_child("device", Node::symlink(syspath.display().to_string()))
        .with_child(
            "power",
            Node::symlink(syspath.join("power").display().to_string()),
        )
        .with_child("subsystem", Node::symlink(mount_root.display().to_string()))
}
