// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! MemFs Core - in-memory inode filesystem engine
//!
//! This crate provides a transport-agnostic filesystem engine: a node table
//! keyed by stable identifiers, a directory tree layered over the nodes'
//! child maps, attribute synthesis, and a deterministic fault injector that
//! makes selected calls report a stale handle so callers can exercise their
//! retry paths.

pub mod attr;
pub mod config;
pub mod error;
pub mod fault;
pub mod ops;
pub(crate) mod store;
pub(crate) mod tree;
pub mod types;
pub mod vfs;

pub use config::MemFsConfig;
pub use error::{FsError, FsResult};
pub use fault::{
    FaultInjector, FaultOp, FaultPolicy, FaultPolicySummary, FaultRule, FaultRuleStats,
    FaultStrategy,
};
pub use ops::{Operation, Reply, Request, UnsupportedOp};
pub use types::*;
pub use vfs::MemFs;
