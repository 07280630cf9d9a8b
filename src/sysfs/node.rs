// Purpose: In-memory node tree backing the emulated /sys/class/gpio surface.

//! The virtual tree of directories, attribute files and symlinks.
//!
//! Nodes are a tagged variant over the small capability set the legacy
//! sysfs tree exposes. The tree owns every node, keyed by name under its
//! parent directory, and keeps an inode index so the FUSE binding can
//! address nodes the way the kernel does.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::SystemTime;

use regex::Regex;

use super::line::{ExportedLine, LineAttr};
use super::{Error, Result};

/// Inode of the tree root.
pub const ROOT_INO: u64 = 1;

/// Advisory size reported for every regular attribute.
pub const ATTR_SIZE: u64 = 4096;

/// Stat metadata carried by every node.
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    /// Full mode including the file-type bits.
    pub mode: u32,
    /// Hard-link count.
    pub nlink: u32,
    /// Reported size (4096 for attributes, 0 for links and directories).
    pub size: u64,
    /// Owning user.
    pub uid: u32,
    /// Owning group.
    pub gid: u32,
    /// Access time, fixed at creation.
    pub atime: SystemTime,
    /// Modification time, fixed at creation.
    pub mtime: SystemTime,
    /// Change time, fixed at creation.
    pub ctime: SystemTime,
}

impl Stat {
    fn new(mode: u32, nlink: u32, size: u64) -> Self {
        let now = SystemTime::now();
        Self {
            mode,
            nlink,
            size,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
            atime: now,
            mtime: now,
            ctime: now,
        }
    }
}

/// Coarse node classification exposed to the FUSE binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    /// A directory.
    Directory,
    /// A regular attribute file.
    Attribute,
    /// A symbolic link.
    Symlink,
}

/// Which control file a write to `export` / `unexport` landed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportKind {
    /// `/export`.
    Export,
    /// `/unexport`.
    Unexport,
}

/// Attribute behaviour variants.
pub enum AttrKind {
    /// Renders `"{value}\n"`; writes fail.
    Const(String),
    /// Pattern-validated uevent trigger; reads yield nothing.
    Uevent,
    /// Digits-only control file mutating the root's children.
    Export(ExportKind),
    /// One of the four per-line attributes.
    Line {
        /// The exported line consulted on read/write/poll.
        line: Arc<ExportedLine>,
        /// Which attribute of the line this node renders.
        attr: LineAttr,
    },
}

/// Node payload.
pub enum NodeKind {
    /// Insertion-ordered children.
    Directory(Vec<(String, Node)>),
    /// A regular attribute file.
    Attr(AttrKind),
    /// Symlink target, stored by value.
    Symlink(String),
}

/// A single tree node.
pub struct Node {
    ino: u64,
    stat: Stat,
    kind: NodeKind,
}

impl Node {
    /// A directory (`drwxr-xr-x`).
    pub fn directory() -> Self {
        Self {
            ino: 0,
            stat: Stat::new(libc::S_IFDIR | 0o755, 2, 0),
            kind: NodeKind::Directory(Vec::new()),
        }
    }

    /// A read-only constant attribute (`r--r--r--`).
    pub fn const_attr(value: impl Into<String>) -> Self {
        Self {
            ino: 0,
            stat: Stat::new(libc::S_IFREG | 0o444, 1, ATTR_SIZE),
            kind: NodeKind::Attr(AttrKind::Const(value.into())),
        }
    }

    /// A uevent trigger attribute (`rw-r--r--`).
    pub fn uevent_attr() -> Self {
        Self {
            ino: 0,
            stat: Stat::new(libc::S_IFREG | 0o644, 1, ATTR_SIZE),
            kind: NodeKind::Attr(AttrKind::Uevent),
        }
    }

    /// An export control attribute (`-w-------`).
    pub fn export_attr(kind: ExportKind) -> Self {
        Self {
            ino: 0,
            stat: Stat::new(libc::S_IFREG | 0o200, 1, ATTR_SIZE),
            kind: NodeKind::Attr(AttrKind::Export(kind)),
        }
    }

    /// A per-line attribute (`rw-r--r--`).
    pub fn line_attr(line: Arc<ExportedLine>, attr: LineAttr) -> Self {
        Self {
            ino: 0,
            stat: Stat::new(libc::S_IFREG | 0o644, 1, ATTR_SIZE),
            kind: NodeKind::Attr(AttrKind::Line { line, attr }),
        }
    }

    /// A symlink with a by-value target.
    pub fn symlink(target: impl Into<String>) -> Self {
        Self {
            ino: 0,
            stat: Stat::new(libc::S_IFLNK | 0o777, 1, 0),
            kind: NodeKind::Symlink(target.into()),
        }
    }

    /// Attach a child while assembling a subtree, before insertion.
    pub fn with_child(mut self, name: impl Into<String>, child: Node) -> Self {
        match &mut self.kind {
            NodeKind::Directory(children) => children.push((name.into(), child)),
            _ => panic!("cannot attach child to a non-directory"),
        }
        self
    }

    /// Inode assigned at insertion.
    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Stat snapshot.
    pub fn stat(&self) -> &Stat {
        &self.stat
    }

    /// Projection handed across the FUSE boundary.
    pub fn attr(&self) -> NodeAttr {
        NodeAttr {
            ino: self.ino,
            kind: self.node_type(),
            stat: self.stat,
        }
    }

    /// Coarse classification.
    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::Directory(_) => NodeType::Directory,
            NodeKind::Attr(_) => NodeType::Attribute,
            NodeKind::Symlink(_) => NodeType::Symlink,
        }
    }

    fn child(&self, name: &str) -> Option<&Node> {
        match &self.kind {
            NodeKind::Directory(children) => {
                children.iter().find(|(n, _)| n == name).map(|(_, c)| c)
            }
            _ => None,
        }
    }

    fn child_mut(&mut self, name: &str) -> Option<&mut Node> {
        match &mut self.kind {
            NodeKind::Directory(children) => children
                .iter_mut()
                .find(|(n, _)| n == name)
                .map(|(_, c)| c),
            _ => None,
        }
    }
}

/// Projection of a node handed across the FUSE boundary.
#[derive(Debug, Clone, Copy)]
pub struct NodeAttr {
    /// Inode.
    pub ino: u64,
    /// Coarse classification.
    pub kind: NodeType,
    /// Stat snapshot.
    pub stat: Stat,
}

/// A directory entry as handed to readdir.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Inode of the entry.
    pub ino: u64,
    /// Entry classification.
    pub kind: NodeType,
    /// Entry name.
    pub name: String,
}

/// Effect of a write, executed by the caller after the tree returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The write was fully handled by the node.
    Applied,
    /// `export` requested line N.
    Export(u32),
    /// `unexport` requested line N.
    Unexport(u32),
}

/// The rooted tree plus its inode index.
pub struct Tree {
    root: Node,
    next_ino: u64,
    paths: HashMap<u64, Vec<String>>,
}

impl Tree {
    /// Build the root with its fixed `export` / `unexport` children.
    pub fn new() -> Self {
        let mut root = Node::directory();
        root.ino = ROOT_INO;
        let mut tree = Self {
            root,
            next_ino: ROOT_INO + 1,
            paths: HashMap::from([(ROOT_INO, Vec::new())]),
        };
        tree.insert(&[], "export", Node::export_attr(ExportKind::Export))
            .expect("insert /export");
        tree.insert(&[], "unexport", Node::export_attr(ExportKind::Unexport))
            .expect("insert /unexport");
        tree
    }

    /// Resolve a path to its node.
    pub fn lookup(&self, path: &[String]) -> Result<&Node> {
        let mut node = &self.root;
        for component in path {
            node = node.child(component).ok_or(Error::NoEntry)?;
        }
        Ok(node)
    }

    fn lookup_mut(&mut self, path: &[String]) -> Result<&mut Node> {
        let mut node = &mut self.root;
        for component in path {
            node = node.child_mut(component).ok_or(Error::NoEntry)?;
        }
        Ok(node)
    }

    /// Path components of an inode.
    pub fn path_of(&self, ino: u64) -> Result<&[String]> {
        self.paths
            .get(&ino)
            .map(|p| p.as_slice())
            .ok_or(Error::NoEntry)
    }

    /// Node behind an inode.
    pub fn node_by_ino(&self, ino: u64) -> Result<&Node> {
        let path = self.paths.get(&ino).ok_or(Error::NoEntry)?;
        self.lookup(path)
    }

    fn node_by_ino_mut(&mut self, ino: u64) -> Result<&mut Node> {
        let path = self.paths.get(&ino).cloned().ok_or(Error::NoEntry)?;
        self.lookup_mut(&path)
    }

    /// Parent inode (the root is its own parent).
    pub fn parent_ino(&self, ino: u64) -> Result<u64> {
        let path = self.paths.get(&ino).ok_or(Error::NoEntry)?;
        if path.is_empty() {
            return Ok(ROOT_INO);
        }
        Ok(self.lookup(&path[..path.len() - 1])?.ino)
    }

    /// Insert `node` as `parent/name`, assigning inodes to its subtree.
    pub fn insert(&mut self, parent: &[String], name: &str, mut node: Node) -> Result<u64> {
        let mut path = parent.to_vec();
        path.push(name.to_owned());
        {
            let dir = self.lookup(parent)?;
            if dir.child(name).is_some() {
                return Err(Error::invalid(format!("node {name} already exists")));
            }
            if !matches!(dir.kind, NodeKind::Directory(_)) {
                return Err(Error::NotADirectory);
            }
        }
        self.register(&mut node, path);
        let ino = node.ino;
        match &mut self.lookup_mut(parent)?.kind {
            NodeKind::Directory(children) => children.push((name.to_owned(), node)),
            _ => unreachable!("parent checked above"),
        }
        Ok(ino)
    }

    /// Remove `parent/name`, dropping its subtree from the index.
    pub fn remove(&mut self, parent: &[String], name: &str) -> Result<Node> {
        let node = {
            let dir = self.lookup_mut(parent)?;
            match &mut dir.kind {
                NodeKind::Directory(children) => {
                    let pos = children
                        .iter()
                        .position(|(n, _)| n == name)
                        .ok_or(Error::NoEntry)?;
                    children.remove(pos).1
                }
                _ => return Err(Error::NotADirectory),
            }
        };
        self.unregister(&node);
        Ok(node)
    }

    fn register(&mut self, node: &mut Node, path: Vec<String>) {
        node.ino = self.next_ino;
        self.next_ino += 1;
        self.paths.insert(node.ino, path.clone());
        if let NodeKind::Directory(children) = &mut node.kind {
            for (name, child) in children.iter_mut() {
                let mut child_path = path.clone();
                child_path.push(name.clone());
                self.register(child, child_path);
            }
        }
    }

    fn unregister(&mut self, node: &Node) {
        self.paths.remove(&node.ino);
        if let NodeKind::Directory(children) = &node.kind {
            for (_, child) in children {
                self.unregister(child);
            }
        }
    }

    /// Directory listing: `.`, `..`, then children in insertion order.
    pub fn read_dir(&self, ino: u64) -> Result<Vec<DirEntry>> {
        let node = self.node_by_ino(ino)?;
        let children = match &node.kind {
            NodeKind::Directory(children) => children,
            _ => return Err(Error::NotADirectory),
        };
        let mut entries = vec![
            DirEntry {
                ino,
                kind: NodeType::Directory,
                name: ".".to_owned(),
            },
            DirEntry {
                ino: self.parent_ino(ino)?,
                kind: NodeType::Directory,
                name: "..".to_owned(),
            },
        ];
        for (name, child) in children {
            entries.push(DirEntry {
                ino: child.ino,
                kind: child.node_type(),
                name: name.clone(),
            });
        }
        Ok(entries)
    }

    /// Read an attribute's rendering, sliced at `offset`/`size`.
    pub fn read(&self, ino: u64, offset: u64, size: u32) -> Result<Vec<u8>> {
        let node = self.node_by_ino(ino)?;
        let payload = match &node.kind {
            NodeKind::Attr(AttrKind::Const(value)) => format!("{value}\n").into_bytes(),
            NodeKind::Attr(AttrKind::Uevent) => Vec::new(),
            NodeKind::Attr(AttrKind::Export(_)) => return Err(Error::PermissionDenied),
            NodeKind::Attr(AttrKind::Line { line, attr }) => {
                line.read_attr(*attr)?.into_bytes()
            }
            NodeKind::Directory(_) | NodeKind::Symlink(_) => {
                return Err(Error::PermissionDenied)
            }
        };
        Ok(read_slice(&payload, offset, size))
    }

    /// Apply a write; side-effecting outcomes are executed by the caller.
    pub fn write(&mut self, ino: u64, data: &[u8]) -> Result<WriteOutcome> {
        let payload = std::str::from_utf8(data)
            .map_err(|_| Error::invalid("payload is not valid UTF-8"))?
            .trim()
            .to_owned();
        let node = self.node_by_ino_mut(ino)?;
        match &node.kind {
            NodeKind::Attr(AttrKind::Const(_)) => Err(Error::PermissionDenied),
            NodeKind::Attr(AttrKind::Uevent) => {
                validate_uevent(&payload)?;
                Ok(WriteOutcome::Applied)
            }
            NodeKind::Attr(AttrKind::Export(kind)) => {
                let number = parse_gpio_number(&payload)?;
                Ok(match kind {
                    ExportKind::Export => WriteOutcome::Export(number),
                    ExportKind::Unexport => WriteOutcome::Unexport(number),
                })
            }
            NodeKind::Attr(AttrKind::Line { line, attr }) => {
                line.write_attr(*attr, &payload)?;
                Ok(WriteOutcome::Applied)
            }
            NodeKind::Directory(_) | NodeKind::Symlink(_) => Err(Error::PermissionDenied),
        }
    }

    /// Symlink target; anything else answers permission-denied.
    pub fn readlink(&self, ino: u64) -> Result<&str> {
        match &self.node_by_ino(ino)?.kind {
            NodeKind::Symlink(target) => Ok(target),
            _ => Err(Error::PermissionDenied),
        }
    }

    /// Update the permission bits, keeping the file-type bits.
    pub fn set_mode(&mut self, ino: u64, mode: u32) -> Result<()> {
        let node = self.node_by_ino_mut(ino)?;
        node.stat.mode = (node.stat.mode & libc::S_IFMT) | (mode & 0o7777);
        Ok(())
    }

    /// Update the stored owner.
    pub fn set_owner(&mut self, ino: u64, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let node = self.node_by_ino_mut(ino)?;
        if let Some(uid) = uid {
            node.stat.uid = uid;
        }
        if let Some(gid) = gid {
            node.stat.gid = gid;
        }
        Ok(())
    }

    /// Poll readiness; priority is only ever raised by the `value` attribute.
    pub fn poll(&self, ino: u64, handle: u64) -> Result<u32> {
        match &self.node_by_ino(ino)?.kind {
            NodeKind::Attr(AttrKind::Line {
                line,
                attr: LineAttr::Value,
            }) => Ok(line.poll_mask(handle)),
            // Attributes never block on plain IO.
            _ => Ok((libc::POLLIN | libc::POLLOUT) as u32),
        }
    }
}

impl Default for Tree {
    fn default() -> Self {
        Self::new()
    }
}

fn read_slice(data: &[u8], offset: u64, size: u32) -> Vec<u8> {
    let start = offset as usize;
    if start >= data.len() {
        return Vec::new();
    }
    let end = start.saturating_add(size as usize).min(data.len());
    data[start..end].to_vec()
}

/// Split a textual path into components, dropping empty tokens.
pub fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_owned)
        .collect()
}

fn parse_gpio_number(payload: &str) -> Result<u32> {
    if payload.is_empty() || !payload.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::invalid(format!("not a gpio number: {payload:?}")));
    }
    payload
        .parse::<u32>()
        .map_err(|_| Error::invalid(format!("gpio number out of range: {payload}")))
}

fn uevent_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(
            r"^(add|remove|change|move|online|offline|bind|unbind)\s+[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}(\s+[A-Za-z0-9_]+=\S*)*$",
        )
        .expect("uevent pattern compiles")
    })
}

fn validate_uevent(payload: &str) -> Result<()> {
    if uevent_pattern().is_match(payload) {
        Ok(())
    } else {
        Err(Error::invalid(format!("malformed uevent: {payload:?}")))
    }
}
