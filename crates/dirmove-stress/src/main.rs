// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use dirmove_core::{
    Credential, DirectoryStore, FaultPolicy, FaultPolicySummary, FaultyStore, MemoryStore,
    ObjectId, RenameError, TreeReport, Violation, Volume, VolumeConfig, verify,
};
use rand::{Rng, SeedableRng, rngs::SmallRng, seq::SliceRandom};
use serde::Serialize;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Violations beyond this many are counted but not listed in the report
const MAX_REPORTED_VIOLATIONS: usize = 32;

fn main() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).with_target(false).init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => {
            let context = run_workload(args)?;
            if let Some(path) = context.json_output.clone() {
                serde_json::to_writer_pretty(File::create(&path)?, &context.report)?;
            }
            write_json_to_stdout(&context.report)?;
            if context.report.status != "passed" {
                bail!(
                    "stress run failed: {} fatal errors, consistent={}",
                    context.report.fatal_errors.values().sum::<u64>(),
                    context.report.integrity.consistent
                );
            }
        }
        Command::CheckConfig(args) => {
            let config = VolumeConfig::from_file(&args.path)?;
            write_json_to_stdout(&config)?;
        }
    }
    Ok(())
}

fn write_json_to_stdout<T: serde::Serialize>(value: &T) -> Result<()> {
    let mut out = io::stdout().lock();
    writeln!(out, "{}", serde_json::to_string_pretty(value)?)?;
    out.flush()?;
    Ok(())
}

#[derive(Parser)]
#[command(author, version, about = "dirmove concurrent rename workload runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Run(RunArgs),
    CheckConfig(CheckConfigArgs),
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Number of worker threads to spawn
    #[arg(long, default_value_t = 8)]
    threads: usize,

    /// Duration of the workload in milliseconds
    #[arg(long, default_value_t = 2000)]
    duration_ms: u64,

    /// Directories created before the workload starts
    #[arg(long, default_value_t = 32)]
    dirs: usize,

    /// Files created before the workload starts
    #[arg(long, default_value_t = 128)]
    files: usize,

    /// Seed for the initial tree and the worker schedules
    #[arg(long, default_value_t = 1)]
    seed: u64,

    /// Volume configuration (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Fault policy (JSON) applied once the initial tree is built
    #[arg(long)]
    fault_policy: Option<PathBuf>,

    /// Optional path for writing the JSON report
    #[arg(long)]
    json_output: Option<PathBuf>,
}

#[derive(Args)]
struct CheckConfigArgs {
    #[arg(long)]
    path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Rename,
    Mkdir,
    Create,
    Rmdir,
}

impl Operation {
    fn label(self) -> &'static str {
        match self {
            Operation::Rename => "rename",
            Operation::Mkdir => "mkdir",
            Operation::Create => "create",
            Operation::Rmdir => "rmdir",
        }
    }
}

#[derive(Default, Serialize, Clone, Debug, PartialEq, Eq)]
struct OperationStats {
    rename: u64,
    mkdir: u64,
    create: u64,
    rmdir: u64,
}

impl OperationStats {
    fn increment(&mut self, op: Operation) {
        match op {
            Operation::Rename => self.rename += 1,
            Operation::Mkdir => self.mkdir += 1,
            Operation::Create => self.create += 1,
            Operation::Rmdir => self.rmdir += 1,
        }
    }

    fn total(&self) -> u64 {
        self.rename + self.mkdir + self.create + self.rmdir
    }
}

impl std::ops::AddAssign<&OperationStats> for OperationStats {
    fn add_assign(&mut self, other: &OperationStats) {
        self.rename += other.rename;
        self.mkdir += other.mkdir;
        self.create += other.create;
        self.rmdir += other.rmdir;
    }
}

#[derive(Serialize, Clone, Debug)]
struct IntegritySummary {
    consistent: bool,
    before: TreeReport,
    after: Option<TreeReport>,
    violation_count: usize,
    violations: Vec<Violation>,
}

#[derive(Serialize, Clone, Debug)]
struct RunReport {
    phase: String,
    threads: usize,
    duration_ms: u64,
    dirs: usize,
    files: usize,
    seed: u64,
    start_time: String,
    end_time: String,
    operations: OperationStats,
    total_ops: u64,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
    fault_policy: FaultPolicySummary,
    faults_injected: u64,
    integrity: IntegritySummary,
    status: String,
}

struct RunContext {
    report: RunReport,
    json_output: Option<PathBuf>,
}

/// Directories and names the workers draw from. Entries go stale as the
/// workload runs; operations on them fail with benign errors.
struct Pool {
    dirs: Mutex<Vec<ObjectId>>,
    names: Vec<String>,
    max_dirs: usize,
}

impl Pool {
    fn pick_dir(&self, rng: &mut SmallRng) -> Option<ObjectId> {
        self.dirs.lock().unwrap().choose(rng).copied()
    }

    fn pick_name(&self, rng: &mut SmallRng) -> &str {
        self.names.choose(rng).map(String::as_str).unwrap_or("x")
    }

    fn add_dir(&self, dir: ObjectId) {
        let mut dirs = self.dirs.lock().unwrap();
        if dirs.len() < self.max_dirs {
            dirs.push(dir);
        }
    }
}

fn run_workload(args: RunArgs) -> Result<RunContext> {
    if args.threads == 0 {
        bail!("--threads must be at least 1");
    }
    let config = match &args.config {
        Some(path) => VolumeConfig::from_file(path)?,
        None => VolumeConfig::permissive(),
    };
    let policy = match &args.fault_policy {
        Some(path) => {
            let bytes = fs::read(path)
                .with_context(|| format!("failed to read fault policy {}", path.display()))?;
            FaultPolicy::from_json_bytes(&bytes)
                .with_context(|| format!("failed to parse fault policy {}", path.display()))?
        }
        None => FaultPolicy::default(),
    };

    let backing = MemoryStore::new(config.limits.max_entries_per_dir);
    let store = Arc::new(FaultyStore::new(Arc::new(backing)));
    let volume = Arc::new(
        Volume::builder(config)
            .store(Arc::clone(&store) as Arc<dyn DirectoryStore>)
            .build()?,
    );
    let pool = Arc::new(seed_tree(&volume, &args)?);
    let before = verify(&volume).map_err(|violations| {
        anyhow::anyhow!("initial tree inconsistent: {} violations", violations.len())
    })?;

    let fault_summary = policy.summary();
    store.injector().set_policy(policy);

    info!(
        "rename workload: threads={}, duration={}ms, dirs={}, files={}, seed={}, faults={}",
        args.threads,
        args.duration_ms,
        before.directories,
        before.files,
        args.seed,
        fault_summary.active
    );

    let start_time = chrono::Utc::now();
    let stop_at = Instant::now() + Duration::from_millis(args.duration_ms);

    let mut handles = Vec::with_capacity(args.threads);
    for worker_id in 0..args.threads {
        let worker = Worker {
            id: worker_id,
            volume: Arc::clone(&volume),
            pool: Arc::clone(&pool),
            run_until: stop_at,
            rng_seed: worker_seed(args.seed, worker_id),
        };
        handles.push(std::thread::spawn(move || worker.run()));
    }

    let mut aggregate_stats = OperationStats::default();
    let mut benign_errors: HashMap<String, u64> = HashMap::new();
    let mut fatal_errors: HashMap<String, u64> = HashMap::new();

    for handle in handles {
        match handle.join() {
            Ok(result) => {
                aggregate_stats += &result.stats;
                merge_counts(&mut benign_errors, &result.benign_errors);
                merge_counts(&mut fatal_errors, &result.fatal_errors);
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

    let faults_injected = store.injector().injected();
    store.injector().clear();
    let integrity = match verify(&volume) {
        Ok(after) => IntegritySummary {
            consistent: true,
            before,
            after: Some(after),
            violation_count: 0,
            violations: Vec::new(),
        },
        Err(violations) => {
            for violation in violations.iter().take(MAX_REPORTED_VIOLATIONS) {
                warn!("consistency violation: {}", violation);
            }
            IntegritySummary {
                consistent: false,
                before,
                after: None,
                violation_count: violations.len(),
                violations: violations.into_iter().take(MAX_REPORTED_VIOLATIONS).collect(),
            }
        }
    };
    let end_time = chrono::Utc::now();

    let status = if fatal_errors.is_empty() && integrity.consistent {
        "passed".to_string()
    } else {
        "failed".to_string()
    };

    let report = RunReport {
        phase: "rename".to_string(),
        threads: args.threads,
        duration_ms: args.duration_ms,
        dirs: args.dirs,
        files: args.files,
        seed: args.seed,
        start_time: start_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        end_time: end_time.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        operations: aggregate_stats.clone(),
        total_ops: aggregate_stats.total(),
        benign_errors,
        fatal_errors,
        fault_policy: fault_summary,
        faults_injected,
        integrity,
        status,
    };

    Ok(RunContext {
        report,
        json_output: args.json_output,
    })
}

/// Build a random tree of `args.dirs` directories and `args.files` files
fn seed_tree(volume: &Volume, args: &RunArgs) -> Result<Pool> {
    let mut rng = SmallRng::seed_from_u64(args.seed);
    let cred = Credential::root();
    let mut dirs = vec![volume.root()];

    for i in 0..args.dirs {
        let parent = dirs.choose(&mut rng).copied().unwrap_or(volume.root());
        let dir = volume
            .mkdir(parent, &format!("d{i}"), &cred, 0o755)
            .with_context(|| format!("failed to create seed directory d{i}"))?;
        dirs.push(dir);
    }
    for i in 0..args.files {
        let parent = dirs.choose(&mut rng).copied().unwrap_or(volume.root());
        let len = rng.gen_range(1..=4096);
        volume
            .create(parent, &format!("f{i}"), &cred, 0o644, len)
            .with_context(|| format!("failed to create seed file f{i}"))?;
    }

    // shared names make workers collide on targets
    let mut names: Vec<String> = (0..args.dirs).map(|i| format!("d{i}")).collect();
    names.extend((0..args.files).map(|i| format!("f{i}")));
    names.extend((0..(args.dirs + args.files) / 4 + 1).map(|i| format!("n{i}")));

    let max_dirs = (dirs.len() * 4).max(16);
    Ok(Pool {
        dirs: Mutex::new(dirs),
        names,
        max_dirs,
    })
}

fn worker_seed(seed: u64, worker_id: usize) -> u64 {
    seed ^ (worker_id as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

fn merge_counts(target: &mut HashMap<String, u64>, source: &HashMap<String, u64>) {
    for (key, value) in source {
        *target.entry(key.clone()).or_insert(0) += value;
    }
}

struct Worker {
    id: usize,
    volume: Arc<Volume>,
    pool: Arc<Pool>,
    run_until: Instant,
    rng_seed: u64,
}

struct WorkerResult {
    stats: OperationStats,
    benign_errors: HashMap<String, u64>,
    fatal_errors: HashMap<String, u64>,
}

#[derive(Debug, PartialEq, Eq)]
enum OperationResult {
    Completed,
    Benign { label: String },
    Fatal { label: String, detail: String },
}

impl Worker {
    fn run(self) -> WorkerResult {
        let mut rng = SmallRng::seed_from_u64(self.rng_seed);
        let mut stats = OperationStats::default();
        let mut benign_errors: HashMap<String, u64> = HashMap::new();
        let mut fatal_errors: HashMap<String, u64> = HashMap::new();
        let cred = Credential::root();

        while Instant::now() < self.run_until {
            let op = pick_operation(&mut rng);
            let result = match op {
                Operation::Rename => self.rename(&mut rng, &cred),
                Operation::Mkdir => self.mkdir(&mut rng, &cred),
                Operation::Create => self.create(&mut rng, &cred),
                Operation::Rmdir => self.rmdir(&mut rng, &cred),
            };

            match result {
                OperationResult::Completed => stats.increment(op),
                OperationResult::Benign { label } => {
                    *benign_errors.entry(label).or_insert(0) += 1;
                }
                OperationResult::Fatal { label, detail } => {
                    *fatal_errors.entry(label.clone()).or_insert(0) += 1;
                    debug!("worker {} fatal {}: {}", self.id, label, detail);
                }
            }
        }

        WorkerResult {
            stats,
            benign_errors,
            fatal_errors,
        }
    }

    fn rename(&self, rng: &mut SmallRng, cred: &Credential) -> OperationResult {
        let (Some(from), Some(to)) = (self.pool.pick_dir(rng), self.pool.pick_dir(rng)) else {
            return OperationResult::Benign {
                label: "rename_no_dir".into(),
            };
        };
        let from_name = self.pool.pick_name(rng);
        let to_name = self.pool.pick_name(rng);
        classify(
            Operation::Rename,
            self.volume.rename(from, from_name, to, to_name, cred),
        )
    }

    fn mkdir(&self, rng: &mut SmallRng, cred: &Credential) -> OperationResult {
        let Some(parent) = self.pool.pick_dir(rng) else {
            return OperationResult::Benign {
                label: "mkdir_no_dir".into(),
            };
        };
        let name = self.pool.pick_name(rng);
        match self.volume.mkdir(parent, name, cred, 0o755) {
            Ok(dir) => {
                self.pool.add_dir(dir);
                OperationResult::Completed
            }
            Err(err) => classify(Operation::Mkdir, Err(err)),
        }
    }

    fn create(&self, rng: &mut SmallRng, cred: &Credential) -> OperationResult {
        let Some(parent) = self.pool.pick_dir(rng) else {
            return OperationResult::Benign {
                label: "create_no_dir".into(),
            };
        };
        let name = self.pool.pick_name(rng);
        let len = rng.gen_range(1..=4096);
        let result = self.volume.create(parent, name, cred, 0o644, len).map(|_| ());
        classify(Operation::Create, result)
    }

    fn rmdir(&self, rng: &mut SmallRng, cred: &Credential) -> OperationResult {
        let Some(parent) = self.pool.pick_dir(rng) else {
            return OperationResult::Benign {
                label: "rmdir_no_dir".into(),
            };
        };
        let name = self.pool.pick_name(rng);
        classify(Operation::Rmdir, self.volume.rmdir(parent, name, cred))
    }
}

fn pick_operation(rng: &mut SmallRng) -> Operation {
    let bucket = rng.gen_range(0..100);
    match bucket {
        0..=69 => Operation::Rename,
        70..=79 => Operation::Mkdir,
        80..=89 => Operation::Create,
        _ => Operation::Rmdir,
    }
}

fn classify(op: Operation, result: Result<(), RenameError>) -> OperationResult {
    match result {
        Ok(()) => OperationResult::Completed,
        Err(err) if err.is_fatal() => OperationResult::Fatal {
            label: format!("{}_{}", op.label(), err.label()),
            detail: err.to_string(),
        },
        Err(err) => OperationResult::Benign {
            label: format!("{}_{}", op.label(), err.label()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dirmove_core::{FaultErrno, FaultOp, FaultRule, Step};
    use std::io::Write;
    use tempfile::tempdir;

    fn args(threads: usize) -> RunArgs {
        RunArgs {
            threads,
            duration_ms: 100,
            dirs: 8,
            files: 24,
            seed: 7,
            config: None,
            fault_policy: None,
            json_output: None,
        }
    }

    #[test]
    fn clean_run_passes_and_keeps_tree_consistent() {
        let context = run_workload(args(4)).unwrap();
        let report = context.report;
        assert_eq!(report.status, "passed");
        assert!(report.fatal_errors.is_empty());
        assert!(report.integrity.consistent);
        assert!(report.total_ops > 0);
        assert_eq!(report.integrity.before.directories, 9);
        assert_eq!(report.integrity.before.files, 24);
        assert_eq!(report.faults_injected, 0);
    }

    #[test]
    fn seeding_is_deterministic() {
        let a = Volume::new(VolumeConfig::permissive()).unwrap();
        let b = Volume::new(VolumeConfig::permissive()).unwrap();
        seed_tree(&a, &args(1)).unwrap();
        seed_tree(&b, &args(1)).unwrap();
        assert_eq!(verify(&a).unwrap(), verify(&b).unwrap());
    }

    #[test]
    fn fault_policy_file_is_applied_after_seeding() {
        let dir = tempdir().unwrap();
        let policy_path = dir.path().join("policy.json");
        let policy = FaultPolicy::with_rules(vec![FaultRule::new(
            FaultOp::Allocate,
            FaultErrno::Enospc,
        )]);
        let mut file = File::create(&policy_path).unwrap();
        file.write_all(serde_json::to_string(&policy).unwrap().as_bytes()).unwrap();
        file.flush().unwrap();

        let mut run = args(2);
        run.fault_policy = Some(policy_path);
        let report = run_workload(run).unwrap().report;

        // no slot can be allocated, so nothing new appears
        assert_eq!(report.operations.mkdir, 0);
        assert_eq!(report.operations.create, 0);
        assert!(report.benign_errors.contains_key("rename_no_space"));
        assert!(report.fault_policy.active);
        assert!(report.faults_injected > 0);
        assert!(report.fatal_errors.is_empty());
        assert!(report.integrity.consistent);
    }

    #[test]
    fn report_is_written_as_json() {
        let dir = tempdir().unwrap();
        let out = dir.path().join("report.json");
        let context = run_workload(args(1)).unwrap();
        serde_json::to_writer_pretty(File::create(&out).unwrap(), &context.report).unwrap();

        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&out).unwrap()).unwrap();
        assert_eq!(value["phase"], "rename");
        assert_eq!(value["seed"], 7);
        assert!(value["start_time"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn classify_separates_benign_from_fatal() {
        assert_eq!(classify(Operation::Rmdir, Ok(())), OperationResult::Completed);
        assert_eq!(
            classify(Operation::Rename, Err(RenameError::DirectoryNotEmpty)),
            OperationResult::Benign {
                label: "rename_directory_not_empty".into()
            }
        );
        let fatal = classify(
            Operation::Rename,
            Err(RenameError::corrupt(Step::Genealogy, "parent chain loops")),
        );
        assert!(matches!(
            fatal,
            OperationResult::Fatal { ref label, .. } if label == "rename_inconsistent"
        ));
    }

    #[test]
    fn zero_threads_is_rejected() {
        assert!(run_workload(args(0)).is_err());
    }
}
