// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Configuration types for MemFs Core

use serde::{Deserialize, Serialize};

use crate::fault::FaultPolicy;
use crate::StatFs;

fn default_root_mode() -> u32 {
    0o755
}

/// Engine configuration. Every field has a default, so `{}` is a valid config.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemFsConfig {
    /// Permission bits of the root directory
    #[serde(default = "default_root_mode")]
    pub root_mode: u32,
    /// Figures returned by StatFs
    pub statfs: StatFs,
    /// Fault injection policy installed at construction
    pub fault: FaultPolicy,
}

impl Default for MemFsConfig {
    fn default() -> Self {
        Self {
            root_mode: default_root_mode(),
            statfs: StatFs::default(),
            fault: FaultPolicy::default(),
        }
    }
}

impl MemFsConfig {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    pub fn with_fault_policy(mut self, policy: FaultPolicy) -> Self {
        self.fault = policy;
        self
    }
}
