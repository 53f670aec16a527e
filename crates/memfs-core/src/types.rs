// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions for MemFs

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Reserved identifier of the root directory
pub const ROOT_ID: NodeId = NodeId(1);

/// Node identifier (the inode number a transport hands out)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    /// The single place that knows which identifier is the root.
    pub fn is_root(self) -> bool {
        self == ROOT_ID
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of a node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    File,
    Directory,
}

/// Opaque open handle. Opens are stateless, so this is always `NULL`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct HandleId(pub u64);

impl HandleId {
    pub const NULL: HandleId = HandleId(0);
}

/// Attribute snapshot synthesized from a node on every request
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Attributes {
    pub ino: NodeId,
    pub kind: FileKind,
    /// Type and permission bits (`S_IFREG`/`S_IFDIR` | perms)
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
    pub blksize: u32,
    /// 512-byte sectors
    pub blocks: u64,
}

impl Attributes {
    pub fn is_dir(&self) -> bool {
        self.kind == FileKind::Directory
    }

    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }
}

/// Fields a SetAttr request may change. `None` leaves the field alone,
/// except `mtime`, which falls back to "now".
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub mtime: Option<SystemTime>,
}

impl SetAttr {
    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_mtime(mut self, mtime: SystemTime) -> Self {
        self.mtime = Some(mtime);
        self
    }
}

/// Entry reply for lookup/mkdir/create
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub ino: NodeId,
    pub generation: u64,
    pub attr: Attributes,
}

/// Create reply: the entry plus the (placeholder) open handle
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Created {
    pub entry: Entry,
    pub handle: HandleId,
}

/// Directory entry information
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: NodeId,
    pub name: String,
    pub kind: FileKind,
    /// Resume cookie: pass it back to continue after this entry
    pub offset: u64,
}

/// Filesystem statistics. These are static synthetic figures.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatFs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

impl Default for StatFs {
    fn default() -> Self {
        Self {
            blocks: 1_000_000,
            bfree: 1_000_000,
            bavail: 1_000_000,
            files: 1_000_000,
            ffree: 1_000_000,
            bsize: 4096,
            namelen: 255,
            frsize: 4096,
        }
    }
}

/// Time source used to stamp mtimes
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    fn now(&self) -> SystemTime;
}

/// Wall-clock time
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}
