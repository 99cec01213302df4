//! Integration tests for the sweep pipeline.
//!
//! These tests verify that the harness correctly:
//! 1. Retries an out-of-memory run once with expanded memory and records a
//!    single successful row
//! 2. Never launches anything when a mount path is missing
//! 3. Keeps the ledger readable across sweeps and through the statistics

use std::{
    path::Path,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use afbench_config::{MemoryPolicy, Stage};
use afbench_harness::{
    classify::FailureKind,
    config::BenchConfig,
    ledger::{Ledger, RunStatus},
    plan::{ExecutionPlan, Workload},
    probe::GpuMemory,
    runner::{Executor, RunOutcome},
    stats::{self, Summary},
    sweep::{Sweep, SweepRequest},
};
use async_trait::async_trait;
use tempfile::{TempDir, tempdir};

/// Executor that OOMs on standard memory and succeeds on expanded memory.
#[derive(Default)]
struct NeedsUnifiedMemory {
    launches: AtomicUsize,
}

#[async_trait]
impl Executor for NeedsUnifiedMemory {
    async fn execute(&self, plan: &ExecutionPlan, _timeout: Duration) -> RunOutcome {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let expanded = plan.env.get("TF_FORCE_UNIFIED_MEMORY").map(String::as_str) == Some("true");
        let log_path = plan.output_dir.join("run.log");

        let (exit_code, failure, log) = if expanded {
            let job = plan.output_dir.join("promo");
            std::fs::create_dir_all(&job).unwrap();
            std::fs::write(job.join("promo_model.cif"), "data_promo\n").unwrap();
            (
                Some(0),
                FailureKind::None,
                "Total sequences: 2\nRunning model inference with seed 1\n",
            )
        } else {
            (
                Some(1),
                FailureKind::OutOfMemory,
                "jaxlib.xla_extension.XlaRuntimeError: RESOURCE_EXHAUSTED: Out of memory\n",
            )
        };
        std::fs::write(&log_path, log).unwrap();

        RunOutcome {
            exit_code,
            elapsed: Duration::from_millis(2500),
            output: log.to_string(),
            failure,
            output_dir: plan.output_dir.clone(),
            log_path,
        }
    }
}

/// Counts launches and never succeeds.
#[derive(Default)]
struct Counting {
    launches: AtomicUsize,
}

#[async_trait]
impl Executor for Counting {
    async fn execute(&self, plan: &ExecutionPlan, _timeout: Duration) -> RunOutcome {
        self.launches.fetch_add(1, Ordering::SeqCst);
        RunOutcome {
            exit_code: Some(1),
            elapsed: Duration::ZERO,
            output: String::new(),
            failure: FailureKind::Crash,
            output_dir: plan.output_dir.clone(),
            log_path: plan.output_dir.join("run.log"),
        }
    }
}

/// Scratch layout with databases, models and one input file.
fn bench_dir(db_dir: Option<&Path>) -> (TempDir, BenchConfig) {
    let dir = tempdir().unwrap();
    let root = dir.path();
    for sub in ["db", "models", "input_inference"] {
        std::fs::create_dir_all(root.join(sub)).unwrap();
    }
    std::fs::write(root.join("input_inference/promo_data.json"), "{\"name\": \"promo\"}").unwrap();

    let db_dir = db_dir.map_or_else(|| root.join("db"), Path::to_path_buf);
    let config = BenchConfig::from_toml(&format!(
        r#"
[bench]
system_name = "ci-box"
db_dir = "{db}"
model_dir = "{root}/models"
predict_input_dir = "{root}/input_inference"
predict_output_base = "{root}/output_inference"
results_dir = "{root}/results"
thread_counts = "4 8"

[bench.monitors]
gpu = false
system = false
"#,
        db = db_dir.display(),
        root = root.display()
    ))
    .unwrap();
    (dir, config)
}

fn predict_request(config: &BenchConfig) -> SweepRequest {
    let workload = Workload::resolve("promo_data.json", config.input_dir(Stage::Predict));
    SweepRequest::from_config(config, Stage::Predict, vec![workload])
}

#[tokio::test]
async fn test_oom_then_success_records_one_row_per_cell() {
    let (_dir, config) = bench_dir(None);
    let mut sweep = Sweep::new(&config, NeedsUnifiedMemory::default(), GpuMemory::Known(81_920));

    let report = sweep.run(&predict_request(&config)).await.unwrap();

    // Two thread counts, each: standard (OOM) then expanded (success).
    assert_eq!(sweep.executor().launches.load(Ordering::SeqCst), 4);
    assert_eq!(report.total, 2);
    assert_eq!(report.succeeded, 2);
    assert!(report.all_succeeded());

    let rows = Ledger::new(config.ledger_path()).read().unwrap();
    assert_eq!(rows.len(), 2);
    for row in &rows {
        assert_eq!(row.status, RunStatus::Success);
        assert_eq!(row.system_name, "ci-box");
        assert_eq!(row.input_file, "promo_data.json");
        assert_eq!(row.memory_policy, MemoryPolicy::Expanded);
        assert_eq!(row.sequence_count, 2);
        assert!(!row.config_hash.is_empty());
        let meta: serde_json::Value = serde_json::from_str(&row.run_metadata).unwrap();
        assert_eq!(meta["retried"], true);
        assert_eq!(meta["attempts"], 2);
        assert_eq!(meta["initial_policy"], "standard");
        assert_eq!(meta["gpu_memory_mb"], 81_920);
    }
    assert_ne!(rows[0].experiment_id, rows[1].experiment_id);
    assert_eq!(
        rows.iter().map(|r| r.threads).collect::<Vec<_>>(),
        [4, 8]
    );
}

#[tokio::test]
async fn test_missing_mount_path_launches_nothing() {
    let (_dir, config) = bench_dir(Some(Path::new("/nonexistent/afbench/public_databases")));
    let mut sweep = Sweep::new(&config, Counting::default(), GpuMemory::Unknown);

    let report = sweep.run(&predict_request(&config)).await.unwrap();

    assert_eq!(sweep.executor().launches.load(Ordering::SeqCst), 0);
    assert_eq!(report.failed, 2);
    assert!(!report.all_succeeded());
    for row in &report.records {
        assert_eq!(row.status, RunStatus::Failed);
        let meta: serde_json::Value = serde_json::from_str(&row.run_metadata).unwrap();
        assert_eq!(meta["failure_kind"], "preflight_validation");
        assert!(
            meta["error"]
                .as_str()
                .unwrap()
                .contains("/nonexistent/afbench/public_databases")
        );
    }
}

#[tokio::test]
async fn test_ledger_accumulates_across_sweeps() {
    let (_dir, config) = bench_dir(None);

    for _ in 0..2 {
        let mut sweep = Sweep::new(&config, NeedsUnifiedMemory::default(), GpuMemory::Unknown);
        sweep.run(&predict_request(&config)).await.unwrap();
    }
    let mut failing = Sweep::new(&config, Counting::default(), GpuMemory::Unknown);
    failing.run(&predict_request(&config)).await.unwrap();

    let rows = Ledger::new(config.ledger_path()).read().unwrap();
    assert_eq!(rows.len(), 6);

    let groups = stats::aggregate(&rows);
    assert_eq!(groups.len(), 2);
    for group in &groups {
        assert_eq!(group.key.stage, Some(Stage::Predict));
        assert_eq!((group.succeeded, group.failed), (2, 1));
        let Summary::Stats(s) = group.summary else {
            panic!("expected stats for {:?}", group.key);
        };
        assert!((s.mean - 2.5).abs() < 1e-9);
        assert!(s.std.abs() < 1e-9);
    }
}
