//! Sweep controller.
//!
//! Runs every (workload, thread count, iteration) cell of a sweep in order.
//! Each cell goes through policy selection, plan building, execution with
//! monitors attached, the out-of-memory retry loop and result parsing, and
//! ends as exactly one ledger row.

use std::{
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Duration,
};

use afbench_config::{ProfilingTool, RunPurpose, Stage, ThreadCounts};
use indicatif::{ProgressBar, ProgressStyle};
use walkdir::{DirEntry, WalkDir};

use crate::{
    classify::{Decision, FailureKind, classify_and_maybe_retry},
    config::{BenchConfig, FailurePolicy},
    ledger::{ExperimentIdGenerator, Ledger, LedgerError, ResultRecord, RunStatus, now_timestamp},
    monitor::MonitorSet,
    parser,
    plan::{self, RunSpec, Workload},
    policy::{PolicyDecision, PolicySelector},
    probe::GpuMemory,
    runner::{Executor, RunOutcome},
};

/// What to sweep over.
#[derive(Debug, Clone)]
pub struct SweepRequest {
    pub stage: Stage,
    pub workloads: Vec<Workload>,
    pub threads: ThreadCounts,
    pub iterations: u32,
    pub profiler: Option<ProfilingTool>,
    pub timeout: Duration,
}

impl SweepRequest {
    /// A request using the configured thread counts, iterations and timeout.
    #[must_use]
    pub fn from_config(config: &BenchConfig, stage: Stage, workloads: Vec<Workload>) -> Self {
        Self {
            stage,
            workloads,
            threads: config.bench.thread_counts.clone(),
            iterations: config.bench.iterations,
            profiler: None,
            timeout: config.timeout_for(stage),
        }
    }

    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.workloads.len() * self.threads.len() * self.iterations as usize
    }

    /// Reject requests that could not produce a meaningful run.
    pub fn validate(&self) -> Result<(), SweepError> {
        if self.workloads.is_empty() {
            return Err(SweepError::NoWorkloads);
        }
        if self.threads.is_empty() {
            return Err(SweepError::InvalidRequest("no thread counts given".into()));
        }
        if self.iterations == 0 {
            return Err(SweepError::InvalidRequest("iterations must be at least 1".into()));
        }
        if self.timeout.is_zero() {
            return Err(SweepError::InvalidRequest("timeout must be at least 1 second".into()));
        }
        Ok(())
    }
}

/// Summary of a finished (or aborted) sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Stopped early because of `on_failure = "abort"`.
    pub aborted: bool,
    /// Rows appended to the ledger, in order.
    pub records: Vec<ResultRecord>,
}

impl SweepReport {
    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        !self.aborted && self.failed == 0 && self.succeeded == self.total
    }
}

impl std::fmt::Display for SweepReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} cells: {} succeeded, {} failed",
            self.total, self.succeeded, self.failed
        )?;
        if self.aborted {
            write!(f, ", aborted after {} cells", self.records.len())?;
        }
        Ok(())
    }
}

/// How a cell ended.
enum CellEnd {
    /// Never launched.
    Preflight(String),
    Ran(RunOutcome, FailureKind),
}

/// Drives a sweep with a given executor.
pub struct Sweep<'a, E: Executor> {
    config: &'a BenchConfig,
    executor: E,
    selector: PolicySelector,
    capacity: GpuMemory,
    ledger: Ledger,
    ids: ExperimentIdGenerator,
    show_progress: bool,
}

impl<'a, E: Executor> Sweep<'a, E> {
    #[must_use]
    pub fn new(config: &'a BenchConfig, executor: E, capacity: GpuMemory) -> Self {
        Self {
            config,
            executor,
            selector: PolicySelector::from_settings(&config.memory),
            capacity,
            ledger: Ledger::new(config.ledger_path()),
            ids: ExperimentIdGenerator::new(),
            show_progress: false,
        }
    }

    /// Draw a progress bar while running.
    #[must_use]
    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    #[must_use]
    pub fn executor(&self) -> &E {
        &self.executor
    }

    /// Run every cell of `request`, appending one ledger row per cell.
    ///
    /// Cell failures are recorded, not returned; only ledger errors end the
    /// sweep with an error, which carries the cells finished so far.
    pub async fn run(&mut self, request: &SweepRequest) -> Result<SweepReport, SweepError> {
        request.validate()?;
        let total = request.cell_count();
        let mut report = SweepReport {
            total,
            ..SweepReport::default()
        };
        let pb = self.progress_bar(total);

        'cells: for workload in &request.workloads {
            let decision = self.selector.select_policy(workload, self.capacity);
            for threads in request.threads.iter() {
                for iteration in 0..request.iterations {
                    pb.set_message(format!("{} @ {threads} threads #{iteration}", workload.id));
                    let record = self
                        .run_cell(request, workload, threads, iteration, &decision)
                        .await;
                    if let Err(source) = self.ledger.append(&record) {
                        pb.abandon_with_message(format!("ledger write failed after {report}"));
                        return Err(SweepError::Ledger {
                            source,
                            partial: Box::new(report),
                        });
                    }
                    pb.inc(1);

                    if record.is_success() {
                        report.succeeded += 1;
                        tracing::info!(
                            "{}: {:.1}s ({threads} threads, {})",
                            record.experiment_id,
                            record.duration_sec,
                            record.memory_policy
                        );
                    } else {
                        report.failed += 1;
                        tracing::error!("{}: failed", record.experiment_id);
                    }
                    let success = record.is_success();
                    report.records.push(record);

                    if !success && self.config.bench.on_failure == FailurePolicy::Abort {
                        report.aborted = true;
                        break 'cells;
                    }
                }
            }
        }

        pb.finish_with_message(report.to_string());
        Ok(report)
    }

    fn progress_bar(&self, total: usize) -> ProgressBar {
        if !self.show_progress {
            return ProgressBar::hidden();
        }
        let pb = ProgressBar::new(total as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "[{elapsed_precise}] {msg:40} [{wide_bar:.cyan/blue}] {pos}/{len} (eta {eta})",
                )
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#*-"),
        );
        pb
    }

    async fn run_cell(
        &mut self,
        request: &SweepRequest,
        workload: &Workload,
        threads: NonZeroU32,
        iteration: u32,
        decision: &PolicyDecision,
    ) -> ResultRecord {
        let config = self.config;
        let settings = &config.bench;
        let experiment_id = self.ids.next(&settings.system_name, &workload.id);
        let timestamp = now_timestamp();
        let output_dir = config.output_base(request.stage).join(&experiment_id);

        let mut spec = RunSpec::new(
            workload.clone(),
            request.stage,
            threads,
            decision.policy,
            request.profiler,
            iteration,
            request.timeout,
            output_dir,
        );
        let mut budget = settings.retry_budget;
        let mut image = None;

        let end = loop {
            if let Err(e) = tokio::fs::create_dir_all(&spec.output_dir).await {
                tracing::warn!("Cannot create {}: {e}", spec.output_dir.display());
            }
            let plan = match plan::build(&spec, settings)
                .and_then(|plan| self.executor.preflight(&plan).map(|()| plan))
            {
                Ok(plan) => plan,
                Err(e) => {
                    tracing::error!("{experiment_id}: preflight failed: {e}");
                    break CellEnd::Preflight(e.to_string());
                }
            };
            image = Some(plan.image.clone());

            let monitors = MonitorSet::start(&settings.monitors, &spec.output_dir);
            let outcome = self.executor.execute(&plan, spec.timeout).await;
            monitors.stop().await;

            match classify_and_maybe_retry(&outcome, &spec, budget) {
                Decision::Retry {
                    spec: next,
                    remaining_budget,
                } => {
                    budget = remaining_budget;
                    spec = next;
                }
                Decision::Final(kind) => break CellEnd::Ran(outcome, kind),
            }
        };

        let mut metadata = serde_json::json!({
            "system_type": settings.system_type,
            "image": image,
            "attempts": spec.attempt,
            "retried": spec.attempt > 1,
            "initial_policy": decision.policy.to_string(),
            "final_policy": spec.memory_policy.to_string(),
            "gpu_memory_mb": self.capacity.mb(),
            "estimated_memory_mb": decision.estimate.required_mb,
            "estimate_source": decision.estimate.source.to_string(),
            "output_dir": spec.output_dir.display().to_string(),
        });

        let mut record = ResultRecord {
            experiment_id,
            system_name: settings.system_name.clone(),
            timestamp,
            input_file: workload.file_name(),
            stage: request.stage,
            threads: threads.get(),
            duration_sec: 0.0,
            status: RunStatus::Failed,
            run_purpose: RunPurpose::for_profiler(request.profiler),
            config_hash: plan::config_hash(&spec, settings),
            profiling_flags: request.profiler.map(|t| t.to_string()).unwrap_or_default(),
            run_metadata: String::new(),
            iteration,
            memory_policy: spec.memory_policy,
            sequence_count: 0,
            peak_rss_kb: 0,
        };

        match end {
            CellEnd::Preflight(message) => {
                metadata["failure_kind"] = "preflight_validation".into();
                metadata["error"] = message.into();
            }
            CellEnd::Ran(outcome, kind) => {
                let log = tokio::fs::read_to_string(&outcome.log_path)
                    .await
                    .unwrap_or_else(|_| outcome.output.clone());
                let metrics = parser::parse(request.stage, &outcome.output_dir, &log);

                record.duration_sec = round_ms(outcome.elapsed);
                record.sequence_count = metrics.sequence_count;
                record.peak_rss_kb = metrics.peak_rss_kb;

                let failure_kind = match kind {
                    FailureKind::None if metrics.completed() => {
                        record.status = RunStatus::Success;
                        kind.to_string()
                    }
                    FailureKind::None => {
                        tracing::warn!(
                            "{}: exited cleanly but produced no {} artifact",
                            record.experiment_id,
                            request.stage
                        );
                        "missing_output".to_string()
                    }
                    other => other.to_string(),
                };
                metadata["failure_kind"] = failure_kind.into();
                metadata["exit_code"] = outcome.exit_code.into();
                metadata["log_file"] = outcome.log_path.display().to_string().into();
                metadata["seeds_run"] = metrics.seeds_run.into();
                if let Some(artifact) = metrics.artifact {
                    metadata["artifact"] = artifact.display().to_string().into();
                }
            }
        }

        record.run_metadata = metadata.to_string();
        record
    }
}

fn round_ms(elapsed: Duration) -> f64 {
    (elapsed.as_secs_f64() * 1000.0).round() / 1000.0
}

/// Resolve CLI workload arguments for `stage`.
///
/// A directory stands for every `.json` file directly inside it, in name
/// order.
#[must_use]
pub fn resolve_workloads(config: &BenchConfig, stage: Stage, args: &[String]) -> Vec<Workload> {
    let input_dir = config.input_dir(stage);
    let mut workloads = Vec::new();
    for arg in args {
        let workload = Workload::resolve(arg, input_dir);
        if workload.input_file.is_dir() {
            let batch = batch_inputs(&workload.input_file);
            if batch.is_empty() {
                tracing::warn!("No .json inputs in {}", workload.input_file.display());
            }
            workloads.extend(batch);
        } else {
            workloads.push(workload);
        }
    }
    workloads
}

fn batch_inputs(dir: &Path) -> Vec<Workload> {
    let files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(DirEntry::into_path)
        .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.into_iter().map(Workload::from_path).collect()
}

/// Errors that end a sweep early.
#[derive(Debug, thiserror::Error)]
pub enum SweepError {
    #[error("ledger error: {source}")]
    Ledger {
        #[source]
        source: LedgerError,
        /// Cells recorded before the failing append.
        partial: Box<SweepReport>,
    },
    #[error("no workloads given")]
    NoWorkloads,
    #[error("invalid sweep: {0}")]
    InvalidRequest(String),
}
