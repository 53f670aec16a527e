// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Operation handlers for MemFs Core
//!
//! Every handler takes the node table lock once, validates its arguments in a
//! fixed order (target existence, kind, then names), asks the fault injector,
//! and only then mutates. A handler therefore either completes fully or
//! leaves the table exactly as it found it.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

use crate::attr::synthesize;
use crate::config::MemFsConfig;
use crate::error::{FsError, FsResult};
use crate::fault::{FaultInjector, FaultOp};
use crate::ops::{Reply, Request, UnsupportedOp};
use crate::store::{Node, NodeStore};
use crate::{
    Attributes, Clock, Created, DirEntry, Entry, HandleId, NodeId, SetAttr, StatFs, SystemClock,
};

/// The in-memory filesystem engine
pub struct MemFs {
    config: MemFsConfig,
    table: Mutex<NodeStore>,
    faults: FaultInjector,
    clock: Arc<dyn Clock>,
}

impl MemFs {
    pub fn new(config: MemFsConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: MemFsConfig, clock: Arc<dyn Clock>) -> Self {
        let table = NodeStore::new(config.root_mode, clock.now());
        let faults = FaultInjector::new(config.fault.clone());
        Self {
            config,
            table: Mutex::new(table),
            faults,
            clock,
        }
    }

    pub fn config(&self) -> &MemFsConfig {
        &self.config
    }

    /// Fault injector owned by this engine; drivers arm toggles through it.
    pub fn faults(&self) -> &FaultInjector {
        &self.faults
    }

    fn table(&self) -> MutexGuard<'_, NodeStore> {
        self.table.lock().expect("node table lock poisoned")
    }

    fn inject(&self, op: FaultOp, target: NodeId) -> FsResult<()> {
        match self.faults.should_fault(op, target) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn entry(node: &Node) -> Entry {
        Entry {
            ino: node.id,
            generation: 0,
            attr: synthesize(node),
        }
    }

    pub fn lookup(&self, parent: NodeId, name: &str) -> FsResult<Entry> {
        debug!(parent = parent.0, name, "lookup");
        let table = self.table();
        let child = table.resolve(parent, name)?;
        self.inject(FaultOp::Lookup, parent)?;
        Ok(Self::entry(table.node(child)))
    }

    pub fn getattr(&self, ino: NodeId) -> FsResult<Attributes> {
        let table = self.table();
        let node = table.get(ino)?;
        self.inject(FaultOp::GetAttr, ino)?;
        Ok(synthesize(node))
    }

    /// Apply the provided fields. Growing a file zero-fills, shrinking drops
    /// the tail. The mtime is set to "now" unless one is supplied.
    pub fn setattr(&self, ino: NodeId, changes: &SetAttr) -> FsResult<Attributes> {
        debug!(ino = ino.0, mode = ?changes.mode, size = ?changes.size, "setattr");
        let mut table = self.table();
        let node = table.get_mut(ino)?;
        let new_len = match changes.size {
            Some(_) if node.is_dir() => return Err(FsError::IsADirectory),
            Some(size) => Some(usize::try_from(size).map_err(|_| FsError::InvalidArgument)?),
            None => None,
        };
        self.inject(FaultOp::SetAttr, ino)?;

        if let Some(mode) = changes.mode {
            node.set_perm(mode);
        }
        if let (Some(len), Some(content)) = (new_len, node.content_mut()) {
            content.resize(len, 0);
        }
        node.mtime = changes.mtime.unwrap_or_else(|| self.clock.now());
        Ok(synthesize(node))
    }

    pub fn mkdir(&self, parent: NodeId, name: &str, mode: u32) -> FsResult<Entry> {
        debug!(parent = parent.0, name, mode = format_args!("{mode:o}"), "mkdir");
        let mut table = self.table();
        if table.directory(parent)?.contains_key(name) {
            return Err(FsError::AlreadyExists);
        }
        self.inject(FaultOp::Mkdir, parent)?;

        let id = table.allocate();
        table.attach(parent, Node::directory(id, name, mode, self.clock.now()))?;
        debug!(parent = parent.0, name, ino = id.0, "mkdir: created");
        Ok(Self::entry(table.node(id)))
    }

    /// Create a file, or hand back whatever node already holds the name,
    /// directories included. An existing node is left untouched.
    pub fn create(&self, parent: NodeId, name: &str, mode: u32) -> FsResult<Created> {
        debug!(parent = parent.0, name, mode = format_args!("{mode:o}"), "create");
        let mut table = self.table();
        let existing = table.directory(parent)?.get(name).copied();
        self.inject(FaultOp::Create, parent)?;

        let id = match existing {
            Some(id) => {
                debug!(parent = parent.0, name, ino = id.0, "create: already exists");
                id
            }
            None => {
                let id = table.allocate();
                table.attach(parent, Node::file(id, name, mode, self.clock.now()))?;
                debug!(parent = parent.0, name, ino = id.0, "create: created");
                id
            }
        };
        Ok(Created {
            entry: Self::entry(table.node(id)),
            handle: HandleId::NULL,
        })
    }

    pub fn open(&self, ino: NodeId) -> FsResult<HandleId> {
        let table = self.table();
        if table.get(ino)?.is_dir() {
            return Err(FsError::IsADirectory);
        }
        self.inject(FaultOp::Open, ino)?;
        Ok(HandleId::NULL)
    }

    pub fn opendir(&self, ino: NodeId) -> FsResult<HandleId> {
        let table = self.table();
        table.directory(ino)?;
        self.inject(FaultOp::OpenDir, ino)?;
        Ok(HandleId::NULL)
    }

    /// Bytes in `[offset, offset + len)` clamped to the file size. Reading at
    /// or past the end yields an empty buffer.
    pub fn read(&self, ino: NodeId, offset: u64, len: u32) -> FsResult<Vec<u8>> {
        debug!(ino = ino.0, offset, len, "read");
        let table = self.table();
        let content = table.get(ino)?.content().ok_or(FsError::IsADirectory)?;
        self.inject(FaultOp::Read, ino)?;

        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if start >= content.len() {
            return Ok(Vec::new());
        }
        let end = start.saturating_add(len as usize).min(content.len());
        Ok(content[start..end].to_vec())
    }

    /// Overwrite `[offset, offset + data.len())`, zero-filling any gap past the
    /// current end first.
    pub fn write(&self, ino: NodeId, offset: u64, data: &[u8]) -> FsResult<u32> {
        debug!(ino = ino.0, offset, len = data.len(), "write");
        let mut table = self.table();
        let node = table.get_mut(ino)?;
        let content = node.content_mut().ok_or(FsError::IsADirectory)?;
        let written = u32::try_from(data.len()).map_err(|_| FsError::InvalidArgument)?;
        let start = usize::try_from(offset).map_err(|_| FsError::InvalidArgument)?;
        let end = start.checked_add(data.len()).ok_or(FsError::InvalidArgument)?;
        self.inject(FaultOp::Write, ino)?;

        if end > content.len() {
            debug!(ino = ino.0, from = content.len(), to = end, "write: extending");
            content.resize(end, 0);
        }
        content[start..end].copy_from_slice(data);
        node.mtime = self.clock.now();
        Ok(written)
    }

    pub fn unlink(&self, parent: NodeId, name: &str) -> FsResult<()> {
        debug!(parent = parent.0, name, "unlink");
        let mut table = self.table();
        let child = table.resolve(parent, name)?;
        if table.node(child).is_dir() {
            return Err(FsError::IsADirectory);
        }
        self.inject(FaultOp::Unlink, parent)?;

        table.unlink(parent, name)?;
        table.remove(child);
        Ok(())
    }

    pub fn rmdir(&self, parent: NodeId, name: &str) -> FsResult<()> {
        debug!(parent = parent.0, name, "rmdir");
        let mut table = self.table();
        let child = table.resolve(parent, name)?;
        match table.node(child).children() {
            None => return Err(FsError::NotADirectory),
            Some(children) if !children.is_empty() => return Err(FsError::DirectoryNotEmpty),
            Some(_) => {}
        }
        self.inject(FaultOp::Rmdir, parent)?;

        table.unlink(parent, name)?;
        table.remove(child);
        Ok(())
    }

    /// Move `old_parent/old_name` to `new_parent/new_name`. An existing
    /// destination is replaced when the kinds are compatible and a directory
    /// destination is empty; the displaced node is removed along with its
    /// entry.
    pub fn rename(
        &self,
        old_parent: NodeId,
        old_name: &str,
        new_parent: NodeId,
        new_name: &str,
    ) -> FsResult<()> {
        debug!(
            old_parent = old_parent.0,
            old_name,
            new_parent = new_parent.0,
            new_name,
            "rename"
        );
        let mut table = self.table();
        table.directory(old_parent)?;
        let existing = table.directory(new_parent)?.get(new_name).copied();
        let child = table.resolve(old_parent, old_name)?;
        let child_is_dir = table.node(child).is_dir();

        let displaced = match existing {
            Some(id) if id == child => None,
            Some(id) => {
                match (child_is_dir, table.node(id).children()) {
                    (true, Some(children)) if !children.is_empty() => {
                        return Err(FsError::DirectoryNotEmpty)
                    }
                    (true, None) => return Err(FsError::NotADirectory),
                    (false, Some(_)) => return Err(FsError::IsADirectory),
                    _ => {}
                }
                Some(id)
            }
            None => None,
        };
        if child_is_dir && table.is_ancestor_or_self(child, new_parent) {
            return Err(FsError::InvalidArgument);
        }
        self.inject(FaultOp::Rename, old_parent)?;

        if existing == Some(child) {
            return Ok(());
        }
        if let Some(id) = displaced {
            table.unlink(new_parent, new_name)?;
            table.remove(id);
        }
        table.move_entry(old_parent, old_name, new_parent, new_name)?;
        Ok(())
    }

    /// Up to `capacity` entries in name order, starting after the entry whose
    /// cookie is `offset` (0 starts from the beginning). Running out of
    /// capacity is not an error.
    pub fn readdir(&self, ino: NodeId, offset: u64, capacity: usize) -> FsResult<Vec<DirEntry>> {
        debug!(ino = ino.0, offset, capacity, "readdir");
        let table = self.table();
        let children = table.directory(ino)?;
        self.inject(FaultOp::ReadDir, ino)?;

        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        let entries: Vec<DirEntry> = children
            .iter()
            .enumerate()
            .skip(skip)
            .take(capacity)
            .map(|(index, (name, id))| DirEntry {
                ino: *id,
                name: name.clone(),
                kind: table.node(*id).file_kind(),
                offset: index as u64 + 1,
            })
            .collect();
        if skip.saturating_add(entries.len()) < children.len() {
            debug!(ino = ino.0, returned = entries.len(), "readdir: capacity exhausted");
        }
        Ok(entries)
    }

    pub fn statfs(&self, ino: NodeId) -> StatFs {
        debug!(ino = ino.0, "statfs");
        self.config.statfs
    }

    /// Lookup counts are not tracked.
    pub fn forget(&self, ino: NodeId, nlookup: u64) {
        debug!(ino = ino.0, nlookup, "forget");
    }

    pub fn release(&self, ino: NodeId, fh: HandleId) {
        debug!(ino = ino.0, fh = fh.0, "release");
    }

    pub fn releasedir(&self, ino: NodeId, fh: HandleId) {
        debug!(ino = ino.0, fh = fh.0, "releasedir");
    }

    /// Reject an operation outside the capability table.
    pub fn reject(&self, op: UnsupportedOp) -> FsError {
        debug!(?op, "not supported");
        FsError::NotSupported
    }

    /// Single typed entry point for transports.
    pub fn dispatch(&self, request: Request) -> FsResult<Reply> {
        match request {
            Request::Lookup { parent, name } => self.lookup(parent, &name).map(Reply::Entry),
            Request::GetAttr { ino } => self.getattr(ino).map(Reply::Attr),
            Request::SetAttr { ino, changes } => self.setattr(ino, &changes).map(Reply::Attr),
            Request::Mkdir { parent, name, mode } => {
                self.mkdir(parent, &name, mode).map(Reply::Entry)
            }
            Request::Create { parent, name, mode } => {
                self.create(parent, &name, mode).map(Reply::Created)
            }
            Request::Open { ino } => self.open(ino).map(Reply::Opened),
            Request::OpenDir { ino } => self.opendir(ino).map(Reply::Opened),
            Request::Read { ino, offset, len } => self.read(ino, offset, len).map(Reply::Data),
            Request::Write { ino, offset, data } => {
                self.write(ino, offset, &data).map(Reply::Written)
            }
            Request::Unlink { parent, name } => self.unlink(parent, &name).map(|_| Reply::Empty),
            Request::Rmdir { parent, name } => self.rmdir(parent, &name).map(|_| Reply::Empty),
            Request::Rename {
                old_parent,
                old_name,
                new_parent,
                new_name,
            } => self
                .rename(old_parent, &old_name, new_parent, &new_name)
                .map(|_| Reply::Empty),
            Request::ReadDir {
                ino,
                offset,
                capacity,
            } => self.readdir(ino, offset, capacity).map(Reply::DirEntries),
            Request::ReadDirPlus {
                ino,
                offset,
                capacity,
            } => self.readdir(ino, offset, capacity).map(Reply::DirEntries),
            Request::StatFs { ino } => Ok(Reply::StatFs(self.statfs(ino))),
            Request::Forget { ino, nlookup } => {
                self.forget(ino, nlookup);
                Ok(Reply::Empty)
            }
            Request::Release { ino, fh } => {
                self.release(ino, fh);
                Ok(Reply::Empty)
            }
            Request::ReleaseDir { ino, fh } => {
                self.releasedir(ino, fh);
                Ok(Reply::Empty)
            }
            Request::Unsupported(op) => Err(self.reject(op)),
        }
    }

    /// Check every structural invariant of the node table.
    pub fn audit(&self) -> Result<(), Vec<String>> {
        let problems = self.table().audit();
        if problems.is_empty() {
            Ok(())
        } else {
            Err(problems)
        }
    }

    pub fn node_count(&self) -> usize {
        self.table().len()
    }
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new(MemFsConfig::default())
    }
}
