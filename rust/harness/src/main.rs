//! AlphaFold 3 Benchmark Harness CLI
//!
//! Runs benchmark sweeps in containers, records them in the results ledger
//! and reports statistics over past runs.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use afbench_config::{ProfilingTool, RunPurpose, Stage, ThreadCounts};
use afbench_harness::{
    config::BenchConfig,
    ledger::{Ledger, ResultRecord, export_csv, export_json},
    lock::{LockState, RunLock},
    probe::EnvironmentProber,
    runner::DockerExecutor,
    stats,
    sweep::{Sweep, SweepError, SweepReport, SweepRequest, resolve_workloads},
};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Directory next to the ledger that `summary --save` writes to.
const ANALYSIS_DIR: &str = "analysis_results";

#[derive(Parser)]
#[command(name = "afbench", about = "AlphaFold 3 Benchmark Harness")]
struct Cli {
    /// Path to bench.toml config file
    #[arg(short, long, default_value = "bench.toml", global = true)]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct SweepArgs {
    /// Input JSON files or directories of them; bare names are looked up in
    /// the stage's input directory
    #[arg(short, long = "input", required = true, num_args = 1..)]
    inputs: Vec<String>,

    /// Thread counts: "8", "4 8 16", or the flag repeated
    #[arg(short, long)]
    threads: Vec<ThreadCounts>,

    /// Repetitions per (input, threads) cell
    #[arg(short = 'n', long)]
    iterations: Option<u32>,

    /// Run under a profiler
    #[arg(short, long, value_enum)]
    profile: Option<ProfilingTool>,

    /// Run even if another sweep holds the results directory
    #[arg(long)]
    force: bool,

    /// Per-run timeout in seconds, overriding the stage default
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Args)]
struct PredictArgs {
    #[command(flatten)]
    sweep: SweepArgs,

    /// Structures to generate per run, overriding bench.num_diffusion_samples
    #[arg(short, long)]
    models: Option<u32>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ResultType {
    All,
    Performance,
    Profiling,
}

impl ResultType {
    fn keep(self, record: &ResultRecord) -> bool {
        match self {
            Self::All => true,
            Self::Performance => record.run_purpose == RunPurpose::Performance,
            Self::Profiling => record.run_purpose == RunPurpose::Profiling,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ExportFormat {
    Csv,
    Json,
    Summary,
}

#[derive(Subcommand)]
enum Commands {
    /// Benchmark the data pipeline (MSA and template search)
    Prepare(SweepArgs),

    /// Benchmark model inference
    Predict(PredictArgs),

    /// Print statistics over the results ledger
    Summary {
        /// Ledger file (defaults to the configured one)
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Only this stage
        #[arg(long, value_enum)]
        stage: Option<Stage>,

        /// Fields to group by (default: stage, input-file, threads)
        #[arg(long, value_enum, value_delimiter = ',')]
        group_by: Vec<stats::GroupField>,

        /// Also write detailed_statistics.csv and statistical_report.txt
        /// next to the ledger
        #[arg(long)]
        save: bool,

        /// Write the analysis files here instead (implies --save)
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Show the most recent ledger rows
    Show {
        /// Ledger file (defaults to the configured one)
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Number of rows
        #[arg(short = 'n', long, default_value_t = 10)]
        count: usize,

        /// Which runs to list
        #[arg(short = 't', long = "type", value_enum, default_value_t = ResultType::All)]
        kind: ResultType,
    },

    /// Export ledger rows
    Collect {
        /// Ledger file (defaults to the configured one)
        #[arg(long)]
        ledger: Option<PathBuf>,

        /// Which runs to export
        #[arg(short = 't', long = "type", value_enum, default_value_t = ResultType::All)]
        kind: ResultType,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = ExportFormat::Csv)]
        format: ExportFormat,

        /// Output file (stdout when absent)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Report whether a sweep is running and how far the ledger has got
    Status {
        /// Ledger file (defaults to the configured one)
        #[arg(long)]
        ledger: Option<PathBuf>,
    },

    /// Print host resources and the memory policy each input would get
    Probe {
        /// Input JSON files or directories to evaluate
        #[arg(short, long = "input", num_args = 1..)]
        inputs: Vec<String>,

        /// Stage whose input directory bare names resolve against
        #[arg(long, value_enum, default_value_t = Stage::Predict)]
        stage: Stage,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // tracing needs to be initialized with indicatif_layer to not clobber progress bars
    let indicatif_layer = IndicatifLayer::new();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(indicatif_layer.get_stderr_writer()))
        .with(
            EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .with(indicatif_layer)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Prepare(args) => {
            let config = BenchConfig::load(&cli.config)?;
            if !run_sweep(config, Stage::Prepare, args).await? {
                std::process::exit(1);
            }
        }

        Commands::Predict(args) => {
            let mut config = BenchConfig::load(&cli.config)?;
            if let Some(models) = args.models {
                if models == 0 {
                    return Err("--models must be at least 1".into());
                }
                config.bench.num_diffusion_samples = models;
            }
            if !run_sweep(config, Stage::Predict, args.sweep).await? {
                std::process::exit(1);
            }
        }

        Commands::Summary {
            ledger,
            stage,
            group_by,
            save,
            output_dir,
        } => {
            let ledger = open_ledger(&cli.config, ledger)?;
            let mut records = ledger.read()?;
            if let Some(stage) = stage {
                records.retain(|r| r.stage == stage);
            }
            let groups = if group_by.is_empty() {
                stats::aggregate(&records)
            } else {
                stats::aggregate_by(&records, &group_by)
            };
            println!("=== Benchmark Summary ({}) ===", ledger.path().display());
            print!("{}", stats::render_report(&groups));

            let target = output_dir.or_else(|| save.then(|| analysis_dir(ledger.path())));
            if let Some(dir) = target {
                let files = stats::write_analysis(&groups, &dir)?;
                println!();
                println!("Statistics: {}", files.statistics.display());
                println!("Report:     {}", files.report.display());
            }
        }

        Commands::Show {
            ledger,
            count,
            kind,
        } => {
            let ledger = open_ledger(&cli.config, ledger)?;
            let mut records = ledger.read()?;
            records.retain(|r| kind.keep(r));
            let skip = records.len().saturating_sub(count);
            let records = records.split_off(skip);
            if records.is_empty() {
                println!("No results in {}.", ledger.path().display());
                return Ok(());
            }

            println!("=== Last {} runs ===", records.len());
            if matches!(kind, ResultType::Profiling) {
                print_profiling_rows(&records);
            } else {
                print_rows(&records);
            }
        }

        Commands::Collect {
            ledger,
            kind,
            format,
            output,
        } => {
            let ledger = open_ledger(&cli.config, ledger)?;
            let mut records = ledger.read()?;
            records.retain(|r| kind.keep(r));
            let text = match format {
                ExportFormat::Csv => export_csv(&records),
                ExportFormat::Json => export_json(&records)? + "\n",
                ExportFormat::Summary => stats::render_report(&stats::aggregate(&records)),
            };
            match output {
                Some(path) => {
                    std::fs::write(&path, text)?;
                    eprintln!("Wrote {} rows to {}", records.len(), path.display());
                }
                None => print!("{text}"),
            }
        }

        Commands::Status { ledger } => {
            let config = BenchConfig::load(&cli.config)?;
            let ledger = match ledger {
                Some(path) => Ledger::new(path),
                None => Ledger::new(config.ledger_path()),
            };

            println!("=== Benchmark Status ===");
            match RunLock::inspect(config.lock_path())? {
                LockState::Free => println!("Sweep:      not running"),
                LockState::Held { pid } => println!(
                    "Sweep:      running (pid {})",
                    pid.map_or_else(|| "unknown".to_string(), |p| p.to_string())
                ),
            }
            let prober = EnvironmentProber::new(&config.bench);
            match prober.running_containers("afbench-") {
                Some(names) if names.is_empty() => println!("Containers: none"),
                Some(names) => println!("Containers: {}", names.join(", ")),
                None => println!("Containers: unknown ({} unavailable)", config.bench.docker_program),
            }

            let records = ledger.read()?;
            let succeeded = records.iter().filter(|r| r.is_success()).count();
            println!(
                "Ledger:     {} rows ({succeeded} succeeded, {} failed) in {}",
                records.len(),
                records.len() - succeeded,
                ledger.path().display()
            );
            if let Some(last) = records.last() {
                println!(
                    "Last run:   {} {} {} @ {} threads, {} in {:.1}s",
                    last.timestamp,
                    last.stage,
                    last.input_file,
                    last.threads,
                    last.status,
                    last.duration_sec
                );
            }
        }

        Commands::Probe { inputs, stage } => {
            let config = BenchConfig::load(&cli.config)?;
            let prober = EnvironmentProber::new(&config.bench);
            let host = prober.probe_host();

            println!("=== Host Resources ===");
            println!("GPU memory:  {}", host.gpu_memory);
            println!("CPUs:        {}", host.cpu_count);
            println!(
                "Host memory: {}",
                host.host_memory_mb
                    .map_or_else(|| "unknown".to_string(), |mb| format!("{mb} MB"))
            );

            if !inputs.is_empty() {
                let selector = afbench_harness::PolicySelector::from_settings(&config.memory);
                println!();
                println!("=== Memory Policy ===");
                for workload in resolve_workloads(&config, stage, &inputs) {
                    let decision = selector.select_policy(&workload, host.gpu_memory);
                    println!(
                        "{}: {} MB ({}), {} MB with margin -> {}",
                        workload.id,
                        decision.estimate.required_mb,
                        decision.estimate.source,
                        decision.required_with_margin_mb,
                        decision.policy
                    );
                }
            }
        }
    }

    Ok(())
}

/// Run one sweep. Returns whether every cell succeeded.
async fn run_sweep(
    config: BenchConfig,
    stage: Stage,
    args: SweepArgs,
) -> Result<bool, Box<dyn std::error::Error>> {
    let workloads = resolve_workloads(&config, stage, &args.inputs);
    let mut request = SweepRequest::from_config(&config, stage, workloads);
    if !args.threads.is_empty() {
        request.threads = ThreadCounts::concat(args.threads);
    }
    if let Some(n) = args.iterations {
        request.iterations = n;
    }
    request.profiler = args.profile;
    if let Some(secs) = args.timeout_secs {
        request.timeout = Duration::from_secs(secs);
    }
    request.validate()?;

    let _lock = if args.force {
        tracing::warn!("--force given, not checking for other sweeps");
        None
    } else {
        Some(RunLock::acquire(config.lock_path())?)
    };

    let host = EnvironmentProber::new(&config.bench).probe_host();
    tracing::info!(
        "GPU memory: {}, {} CPUs",
        host.gpu_memory,
        host.cpu_count
    );

    println!(
        "Starting {stage} sweep: {} inputs x threads [{}] x {} iterations",
        request.workloads.len(),
        request.threads,
        request.iterations
    );

    let executor = DockerExecutor::new(config.bench.max_capture_bytes);
    let mut sweep = Sweep::new(&config, executor, host.gpu_memory).with_progress(true);
    match sweep.run(&request).await {
        Ok(report) => {
            print_sweep_report(&config, &report);
            Ok(report.all_succeeded())
        }
        Err(SweepError::Ledger { source, partial }) => {
            print_sweep_report(&config, &partial);
            println!("Sweep stopped: the ledger could not be written");
            Err(source.into())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_sweep_report(config: &BenchConfig, report: &SweepReport) {
    println!();
    println!("=== Sweep Complete ===");
    println!("Total: {}", report.total);
    println!("Succeeded: {}", report.succeeded);
    println!("Failed: {}", report.failed);
    if report.aborted {
        println!("Aborted after {} cells (on_failure = abort)", report.records.len());
    }
    println!("Ledger: {}", config.ledger_path().display());
    println!();
    print!("{}", stats::render_report(&stats::aggregate(&report.records)));
}

fn print_rows(records: &[ResultRecord]) {
    println!(
        "{:<19}  {:<8} {:<32} {:>7} {:>10}  {:<8} {:<9} {}",
        "timestamp", "stage", "input_file", "threads", "duration", "status", "memory", "id"
    );
    for r in records {
        println!(
            "{:<19}  {:<8} {:<32} {:>7} {:>9.1}s  {:<8} {:<9} {}",
            r.timestamp,
            r.stage,
            r.input_file,
            r.threads,
            r.duration_sec,
            r.status,
            r.memory_policy,
            r.experiment_id
        );
    }
}

fn print_profiling_rows(records: &[ResultRecord]) {
    println!(
        "{:<19}  {:<8} {:<32} {:<12} {:>7}  {:<8} {}",
        "timestamp", "stage", "input_file", "tool", "threads", "status", "output_dir"
    );
    for r in records {
        let output_dir = serde_json::from_str::<serde_json::Value>(&r.run_metadata)
            .ok()
            .and_then(|m| m["output_dir"].as_str().map(str::to_string))
            .unwrap_or_default();
        println!(
            "{:<19}  {:<8} {:<32} {:<12} {:>7}  {:<8} {}",
            r.timestamp, r.stage, r.input_file, r.profiling_flags, r.threads, r.status, output_dir
        );
    }
}

fn analysis_dir(ledger_path: &Path) -> PathBuf {
    ledger_path
        .parent()
        .map_or_else(|| PathBuf::from(ANALYSIS_DIR), |p| p.join(ANALYSIS_DIR))
}

fn open_ledger(
    config_path: &str,
    explicit: Option<PathBuf>,
) -> Result<Ledger, Box<dyn std::error::Error>> {
    let path = match explicit {
        Some(path) => path,
        None => BenchConfig::load(config_path)?.ledger_path(),
    };
    Ok(Ledger::new(path))
}
