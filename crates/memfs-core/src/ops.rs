// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Capability table and typed request/reply pair for transports
//!
//! A transport decodes each wire request into a [`Request`] and hands it to
//! [`crate::MemFs::dispatch`]. Requests the engine does not implement are
//! carried as `Request::Unsupported` with an [`UnsupportedOp`], so only kinds
//! outside the contract can take that path, and they are rejected without
//! reaching any handler.

use crate::fault::FaultOp;
use crate::{Attributes, Created, DirEntry, Entry, HandleId, NodeId, SetAttr, StatFs};

/// Every request kind a filesystem transport may decode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Operation {
    Lookup,
    Forget,
    GetAttr,
    SetAttr,
    Mkdir,
    Create,
    Open,
    OpenDir,
    Read,
    Write,
    Unlink,
    Rmdir,
    Rename,
    ReadDir,
    ReadDirPlus,
    StatFs,
    Release,
    ReleaseDir,
    // Outside the implemented contract
    Link,
    Symlink,
    Readlink,
    Mknod,
    Access,
    GetXattr,
    SetXattr,
    ListXattr,
    RemoveXattr,
    GetLk,
    SetLk,
    SetLkw,
    Ioctl,
    Fallocate,
    CopyFileRange,
    Lseek,
    Flush,
    Fsync,
    FsyncDir,
}

/// Request kinds the engine answers with `NotSupported`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UnsupportedOp {
    Link,
    Symlink,
    Readlink,
    Mknod,
    Access,
    GetXattr,
    SetXattr,
    ListXattr,
    RemoveXattr,
    GetLk,
    SetLk,
    SetLkw,
    Ioctl,
    Fallocate,
    CopyFileRange,
    Lseek,
    Flush,
    Fsync,
    FsyncDir,
}

impl UnsupportedOp {
    pub const ALL: [UnsupportedOp; 19] = [
        UnsupportedOp::Link,
        UnsupportedOp::Symlink,
        UnsupportedOp::Readlink,
        UnsupportedOp::Mknod,
        UnsupportedOp::Access,
        UnsupportedOp::GetXattr,
        UnsupportedOp::SetXattr,
        UnsupportedOp::ListXattr,
        UnsupportedOp::RemoveXattr,
        UnsupportedOp::GetLk,
        UnsupportedOp::SetLk,
        UnsupportedOp::SetLkw,
        UnsupportedOp::Ioctl,
        UnsupportedOp::Fallocate,
        UnsupportedOp::CopyFileRange,
        UnsupportedOp::Lseek,
        UnsupportedOp::Flush,
        UnsupportedOp::Fsync,
        UnsupportedOp::FsyncDir,
    ];
}

impl From<UnsupportedOp> for Operation {
    fn from(op: UnsupportedOp) -> Self {
        match op {
            UnsupportedOp::Link => Operation::Link,
            UnsupportedOp::Symlink => Operation::Symlink,
            UnsupportedOp::Readlink => Operation::Readlink,
            UnsupportedOp::Mknod => Operation::Mknod,
            UnsupportedOp::Access => Operation::Access,
            UnsupportedOp::GetXattr => Operation::GetXattr,
            UnsupportedOp::SetXattr => Operation::SetXattr,
            UnsupportedOp::ListXattr => Operation::ListXattr,
            UnsupportedOp::RemoveXattr => Operation::RemoveXattr,
            UnsupportedOp::GetLk => Operation::GetLk,
            UnsupportedOp::SetLk => Operation::SetLk,
            UnsupportedOp::SetLkw => Operation::SetLkw,
            UnsupportedOp::Ioctl => Operation::Ioctl,
            UnsupportedOp::Fallocate => Operation::Fallocate,
            UnsupportedOp::CopyFileRange => Operation::CopyFileRange,
            UnsupportedOp::Lseek => Operation::Lseek,
            UnsupportedOp::Flush => Operation::Flush,
            UnsupportedOp::Fsync => Operation::Fsync,
            UnsupportedOp::FsyncDir => Operation::FsyncDir,
        }
    }
}

impl Operation {
    /// The unsupported kind this operation maps to, or `None` when a handler
    /// serves it.
    pub fn unsupported(self) -> Option<UnsupportedOp> {
        UnsupportedOp::ALL
            .into_iter()
            .find(|op| Operation::from(*op) == self)
    }

    pub fn is_supported(self) -> bool {
        self.unsupported().is_none()
    }

    /// Fault family this operation reports under, if it consults the injector.
    pub fn fault_op(self) -> Option<FaultOp> {
        match self {
            Operation::Lookup => Some(FaultOp::Lookup),
            Operation::GetAttr => Some(FaultOp::GetAttr),
            Operation::SetAttr => Some(FaultOp::SetAttr),
            Operation::Mkdir => Some(FaultOp::Mkdir),
            Operation::Create => Some(FaultOp::Create),
            Operation::Open => Some(FaultOp::Open),
            Operation::OpenDir => Some(FaultOp::OpenDir),
            Operation::Read => Some(FaultOp::Read),
            Operation::Write => Some(FaultOp::Write),
            Operation::Unlink => Some(FaultOp::Unlink),
            Operation::Rmdir => Some(FaultOp::Rmdir),
            Operation::Rename => Some(FaultOp::Rename),
            Operation::ReadDir | Operation::ReadDirPlus => Some(FaultOp::ReadDir),
            _ => None,
        }
    }
}

/// Decoded request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Lookup {
        parent: NodeId,
        name: String,
    },
    GetAttr {
        ino: NodeId,
    },
    SetAttr {
        ino: NodeId,
        changes: SetAttr,
    },
    Mkdir {
        parent: NodeId,
        name: String,
        mode: u32,
    },
    Create {
        parent: NodeId,
        name: String,
        mode: u32,
    },
    Open {
        ino: NodeId,
    },
    OpenDir {
        ino: NodeId,
    },
    Read {
        ino: NodeId,
        offset: u64,
        len: u32,
    },
    Write {
        ino: NodeId,
        offset: u64,
        data: Vec<u8>,
    },
    Unlink {
        parent: NodeId,
        name: String,
    },
    Rmdir {
        parent: NodeId,
        name: String,
    },
    Rename {
        old_parent: NodeId,
        old_name: String,
        new_parent: NodeId,
        new_name: String,
    },
    ReadDir {
        ino: NodeId,
        offset: u64,
        capacity: usize,
    },
    /// Served by the plain readdir handler.
    ReadDirPlus {
        ino: NodeId,
        offset: u64,
        capacity: usize,
    },
    StatFs {
        ino: NodeId,
    },
    Forget {
        ino: NodeId,
        nlookup: u64,
    },
    Release {
        ino: NodeId,
        fh: HandleId,
    },
    ReleaseDir {
        ino: NodeId,
        fh: HandleId,
    },
    Unsupported(UnsupportedOp),
}

impl Request {
    pub fn operation(&self) -> Operation {
        match self {
            Request::Lookup { .. } => Operation::Lookup,
            Request::GetAttr { .. } => Operation::GetAttr,
            Request::SetAttr { .. } => Operation::SetAttr,
            Request::Mkdir { .. } => Operation::Mkdir,
            Request::Create { .. } => Operation::Create,
            Request::Open { .. } => Operation::Open,
            Request::OpenDir { .. } => Operation::OpenDir,
            Request::Read { .. } => Operation::Read,
            Request::Write { .. } => Operation::Write,
            Request::Unlink { .. } => Operation::Unlink,
            Request::Rmdir { .. } => Operation::Rmdir,
            Request::Rename { .. } => Operation::Rename,
            Request::ReadDir { .. } => Operation::ReadDir,
            Request::ReadDirPlus { .. } => Operation::ReadDirPlus,
            Request::StatFs { .. } => Operation::StatFs,
            Request::Forget { .. } => Operation::Forget,
            Request::Release { .. } => Operation::Release,
            Request::ReleaseDir { .. } => Operation::ReleaseDir,
            Request::Unsupported(op) => Operation::from(*op),
        }
    }
}

/// Handler result, shaped for the transport to encode
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    Entry(Entry),
    Attr(Attributes),
    Created(Created),
    Opened(HandleId),
    Data(Vec<u8>),
    Written(u32),
    DirEntries(Vec<DirEntry>),
    StatFs(StatFs),
    Empty,
}
