//! Configuration parsing for the benchmark harness.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use afbench_config::{Stage, ThreadCounts};
use serde::{Deserialize, Serialize};

/// Top-level configuration loaded from TOML.
///
/// Loaded once at startup and passed by reference to every component.
#[derive(Debug, Clone, Deserialize)]
pub struct BenchConfig {
    pub bench: BenchSettings,
    #[serde(default)]
    pub memory: MemorySettings,
}

/// Harness-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchSettings {
    /// Name of the machine under test, recorded in every ledger row.
    #[serde(default = "default_system_name")]
    pub system_name: String,
    /// Free-form machine class (workstation, server, cloud, ...).
    #[serde(default = "default_system_type")]
    pub system_type: String,
    /// Container runtime CLI.
    #[serde(default = "default_docker_program")]
    pub docker_program: String,
    /// Image used for plain timing runs.
    #[serde(default = "default_docker_image")]
    pub docker_image: String,
    /// Image variant that ships the profilers.
    #[serde(default = "default_profiling_image")]
    pub profiling_image: String,
    /// Minimal CUDA image used by the GPU memory probe fallback.
    #[serde(default = "default_probe_image")]
    pub probe_image: String,
    /// Genetic database directory, mounted read-only.
    pub db_dir: PathBuf,
    /// Model parameter directory, mounted read-only.
    pub model_dir: PathBuf,
    #[serde(default = "default_prepare_input_dir")]
    pub prepare_input_dir: PathBuf,
    #[serde(default = "default_predict_input_dir")]
    pub predict_input_dir: PathBuf,
    #[serde(default = "default_prepare_output_base")]
    pub prepare_output_base: PathBuf,
    #[serde(default = "default_predict_output_base")]
    pub predict_output_base: PathBuf,
    /// Directory holding the ledger and the run lock.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    /// Ledger file, defaults to `<results_dir>/master_results.csv`.
    #[serde(default)]
    pub ledger_file: Option<PathBuf>,
    /// Thread counts swept when the CLI gives none.
    #[serde(default)]
    pub thread_counts: ThreadCounts,
    /// Repetitions of every (workload, threads) cell.
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_prepare_timeout")]
    pub prepare_timeout_secs: u64,
    #[serde(default = "default_predict_timeout")]
    pub predict_timeout_secs: u64,
    /// `docker run --memory`.
    #[serde(default = "default_docker_memory")]
    pub docker_memory: String,
    /// `docker run --shm-size`.
    #[serde(default = "default_docker_shm_size")]
    pub docker_shm_size: String,
    /// `docker run --cpus`, unlimited when absent.
    #[serde(default)]
    pub docker_cpus: Option<u32>,
    /// Diffusion samples per seed for the predict stage.
    #[serde(default = "default_num_diffusion_samples")]
    pub num_diffusion_samples: u32,
    /// Out-of-memory retries allowed per cell.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
    /// What to do when a cell finally fails.
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Whether privileged containers may be started (required by profilers).
    #[serde(default = "default_allow_privileged")]
    pub allow_privileged: bool,
    /// Size of the in-memory output tail kept per run.
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: usize,
    #[serde(default)]
    pub monitors: MonitorSettings,
}

/// What to do when a sweep cell fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Record the failure and move on to the next cell.
    #[default]
    Continue,
    /// Record the failure and stop the sweep.
    Abort,
}

/// Background resource samplers run alongside each execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorSettings {
    /// Sample GPU utilization and memory with `nvidia-smi`.
    #[serde(default = "default_true")]
    pub gpu: bool,
    /// Sample CPU/memory/IO with `vmstat`.
    #[serde(default = "default_true")]
    pub system: bool,
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            gpu: true,
            system: true,
            interval_secs: default_monitor_interval(),
        }
    }
}

/// Memory policy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySettings {
    /// Multiplier applied to a workload's estimated requirement.
    #[serde(default = "default_safety_factor")]
    pub safety_factor: f64,
    /// Request expanded memory for every run regardless of estimates.
    #[serde(default)]
    pub force_expanded: bool,
    /// Estimated MB needed per workload id, merged over the built-in table.
    #[serde(default)]
    pub requirements: BTreeMap<String, u64>,
    /// MB of requirement per MB of input file for unknown workloads.
    #[serde(default = "default_size_multiplier")]
    pub size_multiplier: f64,
    /// Requirement assumed when nothing else is known.
    #[serde(default = "default_requirement_mb")]
    pub default_requirement_mb: u64,
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            safety_factor: default_safety_factor(),
            force_expanded: false,
            requirements: BTreeMap::new(),
            size_multiplier: default_size_multiplier(),
            default_requirement_mb: default_requirement_mb(),
        }
    }
}

fn default_system_name() -> String {
    "my_system".to_string()
}

fn default_system_type() -> String {
    "workstation".to_string()
}

fn default_docker_program() -> String {
    "docker".to_string()
}

fn default_docker_image() -> String {
    "alphafold3".to_string()
}

fn default_profiling_image() -> String {
    "alphafold3-profiling".to_string()
}

fn default_probe_image() -> String {
    "nvidia/cuda:12.2.0-base-ubuntu22.04".to_string()
}

fn default_prepare_input_dir() -> PathBuf {
    PathBuf::from("input_msa")
}

fn default_predict_input_dir() -> PathBuf {
    PathBuf::from("input_inference")
}

fn default_prepare_output_base() -> PathBuf {
    PathBuf::from("output_msa")
}

fn default_predict_output_base() -> PathBuf {
    PathBuf::from("output_inference")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_iterations() -> u32 {
    1
}

fn default_prepare_timeout() -> u64 {
    3600
}

fn default_predict_timeout() -> u64 {
    7200
}

fn default_docker_memory() -> String {
    "32g".to_string()
}

fn default_docker_shm_size() -> String {
    "8g".to_string()
}

fn default_num_diffusion_samples() -> u32 {
    5
}

fn default_retry_budget() -> u32 {
    1
}

fn default_allow_privileged() -> bool {
    true
}

fn default_max_capture_bytes() -> usize {
    256 * 1024
}

fn default_true() -> bool {
    true
}

fn default_monitor_interval() -> u64 {
    1
}

fn default_safety_factor() -> f64 {
    1.2
}

fn default_size_multiplier() -> f64 {
    1000.0
}

fn default_requirement_mb() -> u64 {
    8000
}

impl BenchConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().display().to_string(), e))?;
        Self::from_toml(&content)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let b = &self.bench;
        if b.system_name.trim().is_empty() {
            return Err(ConfigError::Invalid("bench.system_name is empty".into()));
        }
        if b.db_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("bench.db_dir is empty".into()));
        }
        if b.model_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("bench.model_dir is empty".into()));
        }
        if b.iterations == 0 {
            return Err(ConfigError::Invalid("bench.iterations must be at least 1".into()));
        }
        if b.prepare_timeout_secs == 0 || b.predict_timeout_secs == 0 {
            return Err(ConfigError::Invalid("stage timeouts must be positive".into()));
        }
        if b.max_capture_bytes == 0 {
            return Err(ConfigError::Invalid("bench.max_capture_bytes must be positive".into()));
        }
        let m = &self.memory;
        if !(m.safety_factor.is_finite() && m.safety_factor > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "memory.safety_factor must be positive, got {}",
                m.safety_factor
            )));
        }
        if !(m.size_multiplier.is_finite() && m.size_multiplier > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "memory.size_multiplier must be positive, got {}",
                m.size_multiplier
            )));
        }
        Ok(())
    }

    /// Timeout applied to a single run of the given stage.
    #[must_use]
    pub fn timeout_for(&self, stage: Stage) -> Duration {
        Duration::from_secs(match stage {
            Stage::Prepare => self.bench.prepare_timeout_secs,
            Stage::Predict => self.bench.predict_timeout_secs,
        })
    }

    /// Directory bare workload file names are resolved against.
    #[must_use]
    pub fn input_dir(&self, stage: Stage) -> &Path {
        match stage {
            Stage::Prepare => &self.bench.prepare_input_dir,
            Stage::Predict => &self.bench.predict_input_dir,
        }
    }

    /// Parent of the per-run output directories.
    #[must_use]
    pub fn output_base(&self, stage: Stage) -> &Path {
        match stage {
            Stage::Prepare => &self.bench.prepare_output_base,
            Stage::Predict => &self.bench.predict_output_base,
        }
    }

    #[must_use]
    pub fn ledger_path(&self) -> PathBuf {
        self.bench
            .ledger_file
            .clone()
            .unwrap_or_else(|| self.bench.results_dir.join("master_results.csv"))
    }

    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.bench.results_dir.join(".afbench.lock")
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {0}: {1}")]
    Io(String, std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
}
