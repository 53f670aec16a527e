// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Fault injection policy + runtime controller for MemFs
//!
//! A policy is a list of rules. Each rule covers a set of operation families
//! that share one counter and decides, deterministically, when a call from
//! one of those families reports [`FsError::TransientStale`] instead of
//! running. Calls targeting the root never fail.

use crate::{FsError, NodeId};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};
use tracing::warn;

/// Operation families that consult the injector.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultOp {
    Lookup,
    #[serde(rename = "getattr")]
    GetAttr,
    #[serde(rename = "setattr")]
    SetAttr,
    Mkdir,
    Create,
    Open,
    #[serde(rename = "opendir")]
    OpenDir,
    Read,
    Write,
    Unlink,
    Rmdir,
    Rename,
    #[serde(rename = "readdir")]
    ReadDir,
}

fn default_period() -> u64 {
    2
}

fn default_auto_clear() -> bool {
    true
}

/// How a rule decides to trip.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FaultStrategy {
    /// Fail every `period`-th covered call. The counter keeps running across
    /// failures; it is never reset.
    Periodic {
        #[serde(default = "default_period")]
        period: u64,
    },
    /// Fail while armed. With `auto_clear` the rule disarms itself when it
    /// trips; otherwise it stays armed until [`FaultInjector::disarm`].
    Toggle {
        #[serde(default)]
        armed: bool,
        #[serde(default = "default_auto_clear")]
        auto_clear: bool,
    },
}

/// Individual rule describing which families fail and when.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRule {
    pub ops: Vec<FaultOp>,
    /// Families that advance this rule's counter but never fail through it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub count_only: Vec<FaultOp>,
    pub strategy: FaultStrategy,
    /// Optional maximum number of injected failures for this rule.
    #[serde(default)]
    pub max_faults: Option<u64>,
}

impl FaultRule {
    /// Even-counter rule over `ops`.
    pub fn periodic(ops: &[FaultOp]) -> Self {
        Self {
            ops: ops.to_vec(),
            count_only: Vec::new(),
            strategy: FaultStrategy::Periodic {
                period: default_period(),
            },
            max_faults: None,
        }
    }

    /// Disarmed toggle rule over `ops`.
    pub fn toggle(ops: &[FaultOp], auto_clear: bool) -> Self {
        Self {
            ops: ops.to_vec(),
            count_only: Vec::new(),
            strategy: FaultStrategy::Toggle {
                armed: false,
                auto_clear,
            },
            max_faults: None,
        }
    }

    pub fn with_max_faults(mut self, max: u64) -> Self {
        self.max_faults = Some(max);
        self
    }

    pub fn with_count_only(mut self, ops: &[FaultOp]) -> Self {
        self.count_only = ops.to_vec();
        self
    }

    /// Whether calls from `op` can fail through this rule.
    pub fn covers(&self, op: FaultOp) -> bool {
        self.ops.contains(&op)
    }

    /// Whether calls from `op` advance this rule's counter.
    pub fn observes(&self, op: FaultOp) -> bool {
        self.covers(op) || self.count_only.contains(&op)
    }
}

/// JSON-serializable policy, usually carried inside the engine config.
#[derive(Clone, Debug, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct FaultPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<FaultRule>,
}

impl FaultPolicy {
    pub fn from_json_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn enabled(rules: Vec<FaultRule>) -> Self {
        Self {
            enabled: true,
            rules,
        }
    }

    /// The wiring used by the stale-handle retry drill: one counter shared by
    /// mkdir/create/opendir/readdir that lookup also advances without ever
    /// failing through it, a separate counter for open, and an auto-clearing
    /// toggle over lookup and write that a driver arms.
    pub fn retry_drill() -> Self {
        Self::enabled(vec![
            FaultRule::periodic(&[
                FaultOp::Mkdir,
                FaultOp::Create,
                FaultOp::OpenDir,
                FaultOp::ReadDir,
            ])
            .with_count_only(&[FaultOp::Lookup]),
            FaultRule::periodic(&[FaultOp::Open]),
            FaultRule::toggle(&[FaultOp::Lookup, FaultOp::Write], true),
        ])
    }

    pub fn summary(&self) -> FaultPolicySummary {
        FaultPolicySummary {
            enabled: self.enabled,
            active: self.enabled && !self.rules.is_empty(),
            rule_count: self.rules.len(),
        }
    }
}

/// Lightweight summary returned to callers.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FaultPolicySummary {
    pub enabled: bool,
    pub active: bool,
    pub rule_count: usize,
}

/// Per-rule counters as observed at one instant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FaultRuleStats {
    pub ops: Vec<FaultOp>,
    pub invocations: u64,
    pub faults: u64,
    pub armed: bool,
}

#[derive(Debug)]
struct RuleState {
    rule: FaultRule,
    invocations: AtomicU64,
    faults: AtomicU64,
    armed: AtomicBool,
}

impl RuleState {
    fn new(rule: FaultRule) -> Self {
        let armed = matches!(rule.strategy, FaultStrategy::Toggle { armed: true, .. });
        Self {
            rule,
            invocations: AtomicU64::new(0),
            faults: AtomicU64::new(0),
            armed: AtomicBool::new(armed),
        }
    }

    fn spent(&self) -> bool {
        self.rule
            .max_faults
            .is_some_and(|max| self.faults.load(Ordering::SeqCst) >= max)
    }

    /// Take one of the rule's fault slots. Fails once `max_faults` are taken.
    fn claim(&self) -> bool {
        match self.rule.max_faults {
            Some(max) => self
                .faults
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                    (f < max).then_some(f + 1)
                })
                .is_ok(),
            None => {
                self.faults.fetch_add(1, Ordering::SeqCst);
                true
            }
        }
    }

    /// Count the call and report whether this rule trips on it.
    fn observe(&self, op: FaultOp, target: NodeId) -> bool {
        let count = self.invocations.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        if target.is_root() || !self.rule.covers(op) || self.spent() {
            return false;
        }
        let trip = match self.rule.strategy {
            FaultStrategy::Periodic { period } => period != 0 && count % period == 0,
            FaultStrategy::Toggle { auto_clear, .. } => {
                if auto_clear {
                    self.armed
                        .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                } else {
                    self.armed.load(Ordering::SeqCst)
                }
            }
        };
        // An arm consumed here stays consumed if the last slot went elsewhere;
        // the rule cannot trip again before the next set_policy anyway.
        trip && self.claim()
    }
}

#[derive(Debug, Default)]
struct FaultState {
    enabled: bool,
    rules: Vec<RuleState>,
}

/// Runtime controller that tracks policy + hit counts. Each engine owns one.
#[derive(Debug, Default)]
pub struct FaultInjector {
    state: RwLock<FaultState>,
}

impl FaultInjector {
    pub fn new(policy: FaultPolicy) -> Self {
        let injector = Self::default();
        injector.set_policy(policy);
        injector
    }

    fn read(&self) -> RwLockReadGuard<'_, FaultState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a policy, resetting every counter and toggle.
    pub fn set_policy(&self, policy: FaultPolicy) {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        guard.enabled = policy.enabled;
        guard.rules = policy.rules.into_iter().map(RuleState::new).collect();
    }

    pub fn clear(&self) {
        self.set_policy(FaultPolicy::default());
    }

    /// Current policy, with toggles reflecting their live armed state.
    pub fn snapshot(&self) -> FaultPolicy {
        let guard = self.read();
        FaultPolicy {
            enabled: guard.enabled,
            rules: guard
                .rules
                .iter()
                .map(|state| {
                    let mut rule = state.rule.clone();
                    if let FaultStrategy::Toggle { armed, .. } = &mut rule.strategy {
                        *armed = state.armed.load(Ordering::SeqCst);
                    }
                    rule
                })
                .collect(),
        }
    }

    pub fn summary(&self) -> FaultPolicySummary {
        self.snapshot().summary()
    }

    pub fn stats(&self) -> Vec<FaultRuleStats> {
        self.read()
            .rules
            .iter()
            .map(|state| FaultRuleStats {
                ops: state.rule.ops.clone(),
                invocations: state.invocations.load(Ordering::SeqCst),
                faults: state.faults.load(Ordering::SeqCst),
                armed: state.armed.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Arm every toggle rule covering `op`. Returns how many rules changed state.
    pub fn arm(&self, op: FaultOp) -> usize {
        self.set_armed(op, true)
    }

    pub fn disarm(&self, op: FaultOp) -> usize {
        self.set_armed(op, false)
    }

    fn set_armed(&self, op: FaultOp, armed: bool) -> usize {
        let guard = self.read();
        let mut changed = 0;
        for state in guard.rules.iter().filter(|state| {
            matches!(state.rule.strategy, FaultStrategy::Toggle { .. }) && state.rule.covers(op)
        }) {
            if state.armed.swap(armed, Ordering::SeqCst) != armed {
                changed += 1;
            }
        }
        changed
    }

    pub fn is_armed(&self, op: FaultOp) -> bool {
        self.read()
            .rules
            .iter()
            .any(|state| state.rule.covers(op) && state.armed.load(Ordering::SeqCst))
    }

    /// Decide whether the call `op` on `target` fails. Every rule observing
    /// `op` counts the call, so counters stay independent of each other.
    pub fn should_fault(&self, op: FaultOp, target: NodeId) -> Option<FsError> {
        let guard = self.read();
        if !guard.enabled {
            return None;
        }
        let mut tripped = false;
        for state in guard.rules.iter().filter(|state| state.rule.observes(op)) {
            tripped |= state.observe(op, target);
        }
        if tripped {
            warn!(target: "memfs::fault", ?op, ino = target.0, "injecting stale handle");
            Some(FsError::TransientStale)
        } else {
            None
        }
    }
}
