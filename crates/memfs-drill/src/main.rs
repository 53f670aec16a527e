// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use memfs_core::{
    FaultOp, FaultPolicy, FaultRuleStats, FsError, FsResult, MemFs, MemFsConfig, NodeId, SetAttr,
    ROOT_ID,
};
use rand::{rngs::SmallRng, Rng, SeedableRng};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            let report = run_drill(&args)?;
            if let Some(path) = &args.json_output {
                write_report(&report, path)?;
            }
            write_json_to_stdout(&report)?;
            if report.status != "passed" {
                bail!(
                    "drill failed: {} fatal error kinds, {} audit problems",
                    report.fatal_errors.len(),
                    report.audit.len()
                );
            }
        }
        Command::Config => write_json_to_stdout(&default_config())?,
    }
    Ok(())
}

fn write_json_to_stdout<T: Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    out.flush()?;
    Ok(())
}

fn write_report(report: &DrillReport, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("failed to create report {}", path.display()))?;
    serde_json::to_writer_pretty(file, report)
        .with_context(|| format!("failed to write report {}", path.display()))?;
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about = "MemFs stale-handle retry drill")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a workload against an in-process engine and report the outcome
    Run(RunArgs),
    /// Print the configuration used when no --config is given
    Config,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Workload {
    /// Write, truncate and extend a file, then tear the tree down again
    Scenarios,
    /// Open the same files over and over
    OpenLoop,
    /// Arm the write toggle before every write
    WriteLoop,
    /// Random mix of every handler, checked against a shadow copy
    Mixed,
}

impl Workload {
    fn label(self) -> &'static str {
        match self {
            Workload::Scenarios => "scenarios",
            Workload::OpenLoop => "open-loop",
            Workload::WriteLoop => "write-loop",
            Workload::Mixed => "mixed",
        }
    }

    fn pick(self, rng: &mut SmallRng) -> Step {
        match self {
            Workload::Scenarios => Step::Scenario,
            Workload::OpenLoop => Step::Open,
            Workload::WriteLoop => Step::Write,
            Workload::Mixed => match rng.gen_range(0..100) {
                0..=19 => Step::Create,
                20..=39 => Step::Write,
                40..=54 => Step::Read,
                55..=64 => Step::Lookup,
                65..=74 => Step::ReadDir,
                75..=84 => Step::Rename,
                85..=89 => Step::Open,
                90..=94 => Step::Truncate,
                _ => Step::Unlink,
            },
        }
    }

    /// Chance that a write or lookup arms its toggle first.
    fn arm_chance(self) -> f64 {
        match self {
            Workload::WriteLoop => 1.0,
            Workload::Mixed => 0.2,
            Workload::Scenarios | Workload::OpenLoop => 0.0,
        }
    }
}

#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Workload to drive
    #[arg(long, value_enum, default_value_t = Workload::Mixed)]
    workload: Workload,

    /// Number of worker threads sharing the engine
    #[arg(long, default_value_t = 4)]
    threads: usize,

    /// Steps per worker
    #[arg(long, default_value_t = 1000)]
    ops: usize,

    /// RNG seed; derived from the clock when absent
    #[arg(long)]
    seed: Option<u64>,

    /// JSON engine configuration; defaults to the retry-drill fault policy
    #[arg(long, env = "MEMFS_DRILL_CONFIG")]
    config: Option<PathBuf>,

    /// Retries allowed per call before a stale handle is given up on
    #[arg(long, default_value_t = 8)]
    max_retries: u32,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

fn default_config() -> MemFsConfig {
    MemFsConfig::default().with_fault_policy(FaultPolicy::retry_drill())
}

fn load_config(config_path: Option<&Path>) -> Result<MemFsConfig> {
    match config_path {
        Some(path) => {
            let content = fs::read(path)
                .with_context(|| format!("failed to read config {}", path.display()))?;
            MemFsConfig::from_json_bytes(&content)
                .with_context(|| format!("failed to parse config {}", path.display()))
        }
        None => Ok(default_config()),
    }
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
struct RetryStats {
    retries: u64,
    exhausted: u64,
}

/// Reissue `call` while it reports a stale handle, up to `max_retries` times.
fn with_retry<T>(
    max_retries: u32,
    stats: &mut RetryStats,
    mut call: impl FnMut() -> FsResult<T>,
) -> FsResult<T> {
    let mut attempt = 0;
    loop {
        match call() {
            Err(err) if err.is_transient() => {
                if attempt >= max_retries {
                    stats.exhausted += 1;
                    return Err(err);
                }
                attempt += 1;
                stats.retries += 1;
                debug!(attempt, "retrying after stale handle");
            }
            other => return other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Scenario,
    Create,
    Open,
    Write,
    Read,
    Lookup,
    ReadDir,
    Rename,
    Truncate,
    Unlink,
}

impl Step {
    fn label(self) -> &'static str {
        match self {
            Step::Scenario => "scenario",
            Step::Create => "create",
            Step::Open => "open",
            Step::Write => "write",
            Step::Read => "read",
            Step::Lookup => "lookup",
            Step::ReadDir => "readdir",
            Step::Rename => "rename",
            Step::Truncate => "truncate",
            Step::Unlink => "unlink",
        }
    }
}

#[derive(Serialize, Debug)]
struct DrillReport {
    workload: String,
    threads: usize,
    ops_per_thread: usize,
    seed: u64,
    max_retries: u32,
    start_time: String,
    end_time: String,
    operations: HashMap<String, u64>,
    total_ops: u64,
    retries: u64,
    retries_exhausted: u64,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
    fault_rules: Vec<FaultRuleStats>,
    node_count: usize,
    audit: Vec<String>,
    status: String,
}

fn run_drill(args: &RunArgs) -> Result<DrillReport> {
    let config = load_config(args.config.as_deref())?;
    let seed = args
        .seed
        .unwrap_or_else(|| chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64);
    let fs = Arc::new(MemFs::new(config));

    info!(
        "retry drill: workload={}, threads={}, ops={}, seed={}, rules={}",
        args.workload.label(),
        args.threads,
        args.ops,
        seed,
        fs.faults().summary().rule_count
    );

    let start_time = chrono::Utc::now();
    let mut handles = Vec::with_capacity(args.threads);
    for worker_id in 0..args.threads {
        let worker = Worker {
            id: worker_id,
            fs: Arc::clone(&fs),
            workload: args.workload,
            ops: args.ops,
            max_retries: args.max_retries,
            rng_seed: seed ^ (worker_id as u64).rotate_left(32),
        };
        handles.push(thread::spawn(move || worker.run()));
    }

    let mut operations: HashMap<String, u64> = HashMap::new();
    let mut retry = RetryStats::default();
    let mut benign_errors: HashMap<String, u64> = HashMap::new();
    let mut fatal_errors: HashMap<String, u64> = HashMap::new();

    for handle in handles {
        match handle.join() {
            Ok(result) => {
                merge_counts(&mut operations, &result.operations);
                merge_counts(&mut benign_errors, &result.benign_errors);
                merge_counts(&mut fatal_errors, &result.fatal_errors);
                retry.retries += result.retry.retries;
                retry.exhausted += result.retry.exhausted;
            }
            Err(panic) => {
                let msg = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    "unknown panic".to_string()
                };
                *fatal_errors.entry("thread_panic".to_string()).or_insert(0) += 1;
                warn!("worker thread panicked: {}", msg);
            }
        }
    }

    let audit = match fs.audit() {
        Ok(()) => Vec::new(),
        Err(problems) => {
            for problem in &problems {
                warn!("audit: {}", problem);
            }
            problems
        }
    };
    let end_time = chrono::Utc::now();

    let status = if fatal_errors.is_empty() && audit.is_empty() {
        "passed".to_string()
    } else {
        "failed".to_string()
    };

    Ok(DrillReport {
        workload: args.workload.label().to_string(),
        threads: args.threads,
        ops_per_thread: args.ops,
        seed,
        max_retries: args.max_retries,
        start_time: start_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        end_time: end_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        total_ops: operations.values().sum(),
        operations,
        retries: retry.retries,
        retries_exhausted: retry.exhausted,
        benign_errors,
        fatal_errors,
        fault_rules: fs.faults().stats(),
        node_count: fs.node_count(),
        audit,
        status,
    })
}

fn merge_counts(target: &mut HashMap<String, u64>, source: &HashMap<String, u64>) {
    for (key, value) in source {
        *target.entry(key.clone()).or_insert(0) += value;
    }
}

/// Worker-private view of what its directory must contain.
struct Shadow {
    ino: NodeId,
    content: Vec<u8>,
}

struct Worker {
    id: usize,
    fs: Arc<MemFs>,
    workload: Workload,
    ops: usize,
    max_retries: u32,
    rng_seed: u64,
}

struct WorkerState {
    dir: NodeId,
    files: BTreeMap<String, Shadow>,
    seq: u64,
    retry: RetryStats,
}

struct WorkerResult {
    operations: HashMap<String, u64>,
    retry: RetryStats,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
}

enum StepResult {
    Completed,
    Benign { label: String },
    Fatal { label: String, detail: String },
}

impl StepResult {
    fn from_error(step: Step, err: FsError) -> Self {
        if err.is_transient() {
            StepResult::Benign {
                label: format!("{}_retries_exhausted", step.label()),
            }
        } else {
            StepResult::Fatal {
                label: format!("{}_errno_{}", step.label(), err.errno()),
                detail: err.to_string(),
            }
        }
    }

    fn mismatch(step: Step, detail: String) -> Self {
        StepResult::Fatal {
            label: format!("{}_mismatch", step.label()),
            detail,
        }
    }
}

impl Worker {
    fn run(self) -> WorkerResult {
        let mut rng = SmallRng::seed_from_u64(self.rng_seed);
        let mut operations: HashMap<String, u64> = HashMap::new();
        let mut benign_errors: HashMap<String, u64> = HashMap::new();
        let mut fatal_errors: HashMap<String, u64> = HashMap::new();
        let mut retry = RetryStats::default();

        let dir_name = format!("worker-{}", self.id);
        let dir = match with_retry(self.max_retries, &mut retry, || {
            self.fs.mkdir(ROOT_ID, &dir_name, 0o755)
        }) {
            Ok(entry) => entry.ino,
            Err(err) => {
                fatal_errors.insert("worker_dir_create".into(), 1);
                warn!("worker {} failed to create {}: {}", self.id, dir_name, err);
                return WorkerResult {
                    operations,
                    retry,
                    benign_errors,
                    fatal_errors,
                };
            }
        };

        let mut state = WorkerState {
            dir,
            files: BTreeMap::new(),
            seq: 0,
            retry,
        };

        for _ in 0..self.ops {
            let step = self.workload.pick(&mut rng);
            let result = match step {
                Step::Scenario => self.scenario(&mut state),
                Step::Create => self.create_file(&mut state),
                Step::Open => self.open_file(&mut state, &mut rng),
                Step::Write => self.write_file(&mut state, &mut rng),
                Step::Read => self.read_file(&mut state, &mut rng),
                Step::Lookup => self.lookup_file(&mut state, &mut rng),
                Step::ReadDir => self.list_dir(&mut state),
                Step::Rename => self.rename_file(&mut state, &mut rng),
                Step::Truncate => self.truncate_file(&mut state, &mut rng),
                Step::Unlink => self.unlink_file(&mut state, &mut rng),
            };

            match result {
                StepResult::Completed => {
                    *operations.entry(step.label().to_string()).or_insert(0) += 1;
                }
                StepResult::Benign { label } => {
                    *benign_errors.entry(label).or_insert(0) += 1;
                }
                StepResult::Fatal { label, detail } => {
                    *fatal_errors.entry(label.clone()).or_insert(0) += 1;
                    warn!("worker {} fatal {}: {}", self.id, label, detail);
                }
            }
        }

        WorkerResult {
            operations,
            retry: state.retry,
            benign_errors,
            fatal_errors,
        }
    }

    fn pick_file(state: &WorkerState, rng: &mut SmallRng) -> Option<(String, NodeId)> {
        if state.files.is_empty() {
            return None;
        }
        let index = rng.gen_range(0..state.files.len());
        state.files.iter().nth(index).map(|(name, shadow)| (name.clone(), shadow.ino))
    }

    fn maybe_arm(&self, op: FaultOp, rng: &mut SmallRng) {
        if rng.gen_bool(self.workload.arm_chance()) {
            self.fs.faults().arm(op);
        }
    }

    fn scenario(&self, state: &mut WorkerState) -> StepResult {
        state.seq += 1;
        let name = format!("s{}", state.seq);
        match self.scenario_steps(state.dir, &name, &mut state.retry) {
            Ok(Ok(())) => StepResult::Completed,
            Ok(Err(detail)) => StepResult::mismatch(Step::Scenario, detail),
            Err(err) => StepResult::from_error(Step::Scenario, err),
        }
    }

    /// Write "Hello!", truncate to 3, extend to 10, then remove everything.
    fn scenario_steps(
        &self,
        parent: NodeId,
        name: &str,
        retry: &mut RetryStats,
    ) -> FsResult<Result<(), String>> {
        let max = self.max_retries;
        let fs = &self.fs;

        let d = with_retry(max, retry, || fs.mkdir(parent, name, 0o755))?.ino;
        let f = with_retry(max, retry, || fs.create(d, "f", 0o644))?.entry.ino;
        let written = with_retry(max, retry, || fs.write(f, 0, b"Hello!"))?;
        if written != 6 {
            return Ok(Err(format!("wrote {written} bytes, expected 6")));
        }
        let size = with_retry(max, retry, || fs.getattr(f))?.size;
        if size != 6 {
            return Ok(Err(format!("size {size} after write, expected 6")));
        }

        with_retry(max, retry, || fs.setattr(f, &SetAttr::default().with_size(3)))?;
        let data = with_retry(max, retry, || fs.read(f, 0, 10))?;
        if data != b"Hel" {
            return Ok(Err(format!("read {data:?} after truncate")));
        }

        with_retry(max, retry, || fs.setattr(f, &SetAttr::default().with_size(10)))?;
        let data = with_retry(max, retry, || fs.read(f, 0, 10))?;
        if data != b"Hel\0\0\0\0\0\0\0" {
            return Ok(Err(format!("read {data:?} after extend")));
        }

        with_retry(max, retry, || fs.unlink(d, "f"))?;
        with_retry(max, retry, || fs.rmdir(parent, name))?;
        Ok(Ok(()))
    }

    fn create_file(&self, state: &mut WorkerState) -> StepResult {
        state.seq += 1;
        let name = format!("f{}", state.seq);
        let dir = state.dir;
        match with_retry(self.max_retries, &mut state.retry, || {
            self.fs.create(dir, &name, 0o644)
        }) {
            Ok(created) => {
                state.files.insert(
                    name,
                    Shadow {
                        ino: created.entry.ino,
                        content: Vec::new(),
                    },
                );
                StepResult::Completed
            }
            Err(err) => StepResult::from_error(Step::Create, err),
        }
    }

    fn open_file(&self, state: &mut WorkerState, rng: &mut SmallRng) -> StepResult {
        let Some((_, ino)) = Self::pick_file(state, rng) else {
            return self.create_file(state);
        };
        match with_retry(self.max_retries, &mut state.retry, || self.fs.open(ino)) {
            Ok(_) => StepResult::Completed,
            Err(err) => StepResult::from_error(Step::Open, err),
        }
    }

    fn write_file(&self, state: &mut WorkerState, rng: &mut SmallRng) -> StepResult {
        let Some((name, ino)) = Self::pick_file(state, rng) else {
            return self.create_file(state);
        };
        let current = state.files[&name].content.len();
        let offset = rng.gen_range(0..=current + 32);
        let len: usize = rng.gen_range(1..=64);
        let data: Vec<u8> = (0..len).map(|_| rng.gen()).collect();

        self.maybe_arm(FaultOp::Write, rng);
        match with_retry(self.max_retries, &mut state.retry, || {
            self.fs.write(ino, offset as u64, &data)
        }) {
            Ok(written) if written as usize == data.len() => {
                if let Some(shadow) = state.files.get_mut(&name) {
                    let end = offset + data.len();
                    if shadow.content.len() < end {
                        shadow.content.resize(end, 0);
                    }
                    shadow.content[offset..end].copy_from_slice(&data);
                }
                StepResult::Completed
            }
            Ok(written) => StepResult::mismatch(
                Step::Write,
                format!("{name}: wrote {written} of {} bytes", data.len()),
            ),
            Err(err) => StepResult::from_error(Step::Write, err),
        }
    }

    fn read_file(&self, state: &mut WorkerState, rng: &mut SmallRng) -> StepResult {
        let Some((name, ino)) = Self::pick_file(state, rng) else {
            return self.create_file(state);
        };
        let content = &state.files[&name].content;
        let offset = rng.gen_range(0..=content.len() + 8);
        let len: usize = rng.gen_range(1..=128);
        let start = offset.min(content.len());
        let end = offset.saturating_add(len).min(content.len());
        let expected = content[start..end].to_vec();

        match with_retry(self.max_retries, &mut state.retry, || {
            self.fs.read(ino, offset as u64, len as u32)
        }) {
            Ok(data) if data == expected => StepResult::Completed,
            Ok(data) => StepResult::mismatch(
                Step::Read,
                format!("{name}@{offset}: got {} bytes, expected {}", data.len(), expected.len()),
            ),
            Err(err) => StepResult::from_error(Step::Read, err),
        }
    }

    fn lookup_file(&self, state: &mut WorkerState, rng: &mut SmallRng) -> StepResult {
        let Some((name, ino)) = Self::pick_file(state, rng) else {
            return self.create_file(state);
        };
        let dir = state.dir;
        self.maybe_arm(FaultOp::Lookup, rng);
        match with_retry(self.max_retries, &mut state.retry, || self.fs.lookup(dir, &name)) {
            Ok(entry) if entry.ino == ino => StepResult::Completed,
            Ok(entry) => StepResult::mismatch(
                Step::Lookup,
                format!("{name} resolved to {}, expected {ino}", entry.ino),
            ),
            Err(err) => StepResult::from_error(Step::Lookup, err),
        }
    }

    fn list_dir(&self, state: &mut WorkerState) -> StepResult {
        let dir = state.dir;
        if let Err(err) = with_retry(self.max_retries, &mut state.retry, || self.fs.opendir(dir)) {
            return StepResult::from_error(Step::ReadDir, err);
        }

        let mut names = Vec::new();
        let mut cookie = 0;
        loop {
            let page = match with_retry(self.max_retries, &mut state.retry, || {
                self.fs.readdir(dir, cookie, 4)
            }) {
                Ok(page) => page,
                Err(err) => return StepResult::from_error(Step::ReadDir, err),
            };
            let Some(last) = page.last() else {
                break;
            };
            cookie = last.offset;
            names.extend(page.into_iter().map(|entry| entry.name));
        }

        let expected: Vec<&String> = state.files.keys().collect();
        if names.iter().collect::<Vec<_>>() == expected {
            StepResult::Completed
        } else {
            StepResult::mismatch(
                Step::ReadDir,
                format!("listed {} entries, expected {}", names.len(), expected.len()),
            )
        }
    }

    fn rename_file(&self, state: &mut WorkerState, rng: &mut SmallRng) -> StepResult {
        let Some((name, _)) = Self::pick_file(state, rng) else {
            return self.create_file(state);
        };
        state.seq += 1;
        let new_name = format!("r{}", state.seq);
        let dir = state.dir;
        match with_retry(self.max_retries, &mut state.retry, || {
            self.fs.rename(dir, &name, dir, &new_name)
        }) {
            Ok(()) => {
                if let Some(shadow) = state.files.remove(&name) {
                    state.files.insert(new_name, shadow);
                }
                StepResult::Completed
            }
            Err(err) => StepResult::from_error(Step::Rename, err),
        }
    }

    fn truncate_file(&self, state: &mut WorkerState, rng: &mut SmallRng) -> StepResult {
        let Some((name, ino)) = Self::pick_file(state, rng) else {
            return self.create_file(state);
        };
        let size = rng.gen_range(0..=state.files[&name].content.len() + 16);
        let changes = SetAttr::default().with_size(size as u64);
        match with_retry(self.max_retries, &mut state.retry, || self.fs.setattr(ino, &changes)) {
            Ok(attr) if attr.size == size as u64 => {
                if let Some(shadow) = state.files.get_mut(&name) {
                    shadow.content.resize(size, 0);
                }
                StepResult::Completed
            }
            Ok(attr) => StepResult::mismatch(
                Step::Truncate,
                format!("{name}: size {} after setattr, expected {size}", attr.size),
            ),
            Err(err) => StepResult::from_error(Step::Truncate, err),
        }
    }

    fn unlink_file(&self, state: &mut WorkerState, rng: &mut SmallRng) -> StepResult {
        let Some((name, _)) = Self::pick_file(state, rng) else {
            return self.create_file(state);
        };
        let dir = state.dir;
        match with_retry(self.max_retries, &mut state.retry, || self.fs.unlink(dir, &name)) {
            Ok(()) => {
                state.files.remove(&name);
                StepResult::Completed
            }
            Err(err) => StepResult::from_error(Step::Unlink, err),
        }
    }
}
