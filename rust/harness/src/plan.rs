//! Run specifications and container execution plans.
//!
//! [`build`] turns an immutable [`RunSpec`] into a fully resolved
//! `docker run` invocation. It only reads the filesystem (to validate mount
//! sources) so identical inputs always give identical plans. Retries never
//! reuse a plan; they build a fresh one from a fresh spec.

use std::{
    collections::BTreeMap,
    num::NonZeroU32,
    path::{Path, PathBuf},
    time::Duration,
};

use afbench_config::{MemoryPolicy, ProfilingTool, Stage};
use sha2::{Digest, Sha256};

use crate::config::BenchSettings;

pub const CONTAINER_INPUT_DIR: &str = "/root/af_input";
pub const CONTAINER_OUTPUT_DIR: &str = "/root/af_output";
pub const CONTAINER_MODEL_DIR: &str = "/root/models";
pub const CONTAINER_DB_DIR: &str = "/root/public_databases";

/// Variables honoured by the compute libraries inside the image. All of them
/// get the same value so no library silently runs with its own default.
const THREAD_ENV_VARS: [&str; 5] = [
    "OMP_NUM_THREADS",
    "MKL_NUM_THREADS",
    "OPENBLAS_NUM_THREADS",
    "NUMEXPR_NUM_THREADS",
    "VECLIB_MAXIMUM_THREADS",
];

/// Runtime settings that let XLA address host memory through unified memory.
const EXPANDED_MEMORY_ENV: [(&str, &str); 3] = [
    ("XLA_PYTHON_CLIENT_PREALLOCATE", "false"),
    ("TF_FORCE_UNIFIED_MEMORY", "true"),
    ("XLA_CLIENT_MEM_FRACTION", "3.2"),
];

/// One benchmark input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workload {
    /// Identifier derived from the input file stem.
    pub id: String,
    /// Input description file.
    pub input_file: PathBuf,
}

impl Workload {
    /// Resolve a workload argument. Bare names that do not exist relative
    /// to the working directory are looked up in `input_dir`.
    #[must_use]
    pub fn resolve(arg: &str, input_dir: &Path) -> Self {
        let given = PathBuf::from(arg);
        let input_file = if given.is_absolute() || given.exists() {
            given
        } else {
            input_dir.join(given)
        };
        Self::from_path(input_file)
    }

    #[must_use]
    pub fn from_path(input_file: PathBuf) -> Self {
        let id = input_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self { id, input_file }
    }

    /// File name as recorded in the ledger.
    #[must_use]
    pub fn file_name(&self) -> String {
        self.input_file
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.clone())
    }
}

/// Immutable description of one execution attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub workload: Workload,
    pub stage: Stage,
    threads: NonZeroU32,
    pub memory_policy: MemoryPolicy,
    pub profiler: Option<ProfilingTool>,
    /// Zero-based repetition index within the sweep cell.
    pub iteration: u32,
    /// One-based attempt number; retries increment it.
    pub attempt: u32,
    pub timeout: Duration,
    /// Host directory receiving this attempt's artifacts and log.
    pub output_dir: PathBuf,
    /// Output directory of the first attempt; retries are named after it.
    first_output_dir: PathBuf,
}

impl RunSpec {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workload: Workload,
        stage: Stage,
        threads: NonZeroU32,
        memory_policy: MemoryPolicy,
        profiler: Option<ProfilingTool>,
        iteration: u32,
        timeout: Duration,
        output_dir: PathBuf,
    ) -> Self {
        Self {
            workload,
            stage,
            threads,
            memory_policy,
            profiler,
            iteration,
            attempt: 1,
            timeout,
            first_output_dir: output_dir.clone(),
            output_dir,
        }
    }

    #[must_use]
    pub fn threads(&self) -> NonZeroU32 {
        self.threads
    }

    /// The run for the next attempt under `policy`. Artifacts go to a
    /// sibling directory so the failed attempt's log is kept.
    #[must_use]
    pub fn next_attempt(&self, policy: MemoryPolicy) -> Self {
        let attempt = self.attempt + 1;
        let base = self
            .first_output_dir
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let output_dir = self
            .first_output_dir
            .with_file_name(format!("{base}_attempt{attempt}"));
        Self {
            memory_policy: policy,
            attempt,
            output_dir,
            ..self.clone()
        }
    }
}

/// A bind mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    fn to_arg(&self) -> String {
        let mut arg = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            arg.push_str(":ro");
        }
        arg
    }
}

/// Fully resolved container invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    /// Container runtime CLI.
    pub program: String,
    pub container_name: String,
    pub image: String,
    pub mounts: Vec<Mount>,
    pub env: BTreeMap<String, String>,
    pub resource_flags: Vec<String>,
    pub privileged: bool,
    /// Command run inside the container, profiler wrapper included.
    pub command: Vec<String>,
    /// Host directory for the run log.
    pub output_dir: PathBuf,
}

impl ExecutionPlan {
    /// Arguments passed to [`Self::program`].
    #[must_use]
    pub fn argv(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--name".to_string(),
            self.container_name.clone(),
        ];
        if self.privileged {
            args.push("--privileged".to_string());
        }
        args.extend(self.resource_flags.iter().cloned());
        for mount in &self.mounts {
            args.push("-v".to_string());
            args.push(mount.to_arg());
        }
        for (key, value) in &self.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }

    /// Command line for logs.
    #[must_use]
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.argv().join(" "))
    }
}

/// Build the execution plan for `spec`.
///
/// Every mount source is resolved to an absolute path first; a missing or
/// unreadable one fails before anything is launched.
pub fn build(spec: &RunSpec, settings: &BenchSettings) -> Result<ExecutionPlan, PreflightError> {
    if let Some(tool) = spec.profiler
        && !settings.allow_privileged
    {
        return Err(PreflightError::PrivilegesUnavailable(tool));
    }

    let input_file = resolve_path("input file", &spec.workload.input_file)?;
    if !input_file.is_file() {
        return Err(PreflightError::InputNotAFile(input_file));
    }
    let input_dir = input_file
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| PreflightError::InputNotAFile(input_file.clone()))?;
    let input_name = input_file
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    let mounts = vec![
        Mount {
            host: input_dir,
            container: CONTAINER_INPUT_DIR.to_string(),
            read_only: true,
        },
        Mount {
            host: resolve_dir("output directory", &spec.output_dir)?,
            container: CONTAINER_OUTPUT_DIR.to_string(),
            read_only: false,
        },
        Mount {
            host: resolve_dir("model directory", &settings.model_dir)?,
            container: CONTAINER_MODEL_DIR.to_string(),
            read_only: true,
        },
        Mount {
            host: resolve_dir("database directory", &settings.db_dir)?,
            container: CONTAINER_DB_DIR.to_string(),
            read_only: true,
        },
    ];

    let threads = spec.threads().get();
    let mut env = BTreeMap::new();
    for var in THREAD_ENV_VARS {
        env.insert(var.to_string(), threads.to_string());
    }
    env.insert(
        "XLA_FLAGS".to_string(),
        format!("--xla_cpu_multi_thread_eigen=false intra_op_parallelism_threads={threads}"),
    );
    if spec.memory_policy == MemoryPolicy::Expanded {
        for (key, value) in EXPANDED_MEMORY_ENV {
            env.insert(key.to_string(), value.to_string());
        }
    }

    let mut resource_flags = vec![
        "--memory".to_string(),
        settings.docker_memory.clone(),
        "--shm-size".to_string(),
        settings.docker_shm_size.clone(),
    ];
    if let Some(cpus) = settings.docker_cpus {
        resource_flags.extend(["--cpus".to_string(), cpus.to_string()]);
    }
    if spec.stage.needs_gpu() || spec.profiler.is_some_and(ProfilingTool::needs_gpu) {
        resource_flags.extend(["--gpus".to_string(), "all".to_string()]);
    }

    let mut command = spec.profiler.map(profiler_wrapper).unwrap_or_default();
    command.extend(workload_command(spec, settings, &input_name));
    check_stage_flags(&command)?;

    let image = if spec.profiler.is_some() {
        settings.profiling_image.clone()
    } else {
        settings.docker_image.clone()
    };

    Ok(ExecutionPlan {
        program: settings.docker_program.clone(),
        container_name: container_name(spec),
        image,
        mounts,
        env,
        resource_flags,
        privileged: spec.profiler.is_some(),
        command,
        output_dir: spec.output_dir.clone(),
    })
}

fn workload_command(spec: &RunSpec, settings: &BenchSettings, input_name: &str) -> Vec<String> {
    let threads = spec.threads().get();
    let (data_pipeline, inference) = match spec.stage {
        Stage::Prepare => (true, false),
        Stage::Predict => (false, true),
    };
    let mut command = vec![
        "python".to_string(),
        "run_alphafold.py".to_string(),
        format!("--json_path={CONTAINER_INPUT_DIR}/{input_name}"),
        format!("--model_dir={CONTAINER_MODEL_DIR}"),
        format!("--db_dir={CONTAINER_DB_DIR}"),
        format!("--output_dir={CONTAINER_OUTPUT_DIR}"),
        format!("--run_data_pipeline={data_pipeline}"),
        format!("--run_inference={inference}"),
    ];
    match spec.stage {
        Stage::Prepare => {
            command.push(format!("--jackhmmer_n_cpu={threads}"));
            command.push(format!("--nhmmer_n_cpu={threads}"));
        }
        Stage::Predict => {
            command.push(format!(
                "--num_diffusion_samples={}",
                settings.num_diffusion_samples
            ));
        }
    }
    command
}

/// Instrumentation prefix for `tool`. Reports land in the output mount.
fn profiler_wrapper(tool: ProfilingTool) -> Vec<String> {
    let out = CONTAINER_OUTPUT_DIR;
    match tool {
        ProfilingTool::PerfStat => vec![
            "perf".into(),
            "stat".into(),
            "-d".into(),
            "-o".into(),
            format!("{out}/perf_stat.txt"),
            "--".into(),
        ],
        ProfilingTool::PerfRecord => vec![
            "perf".into(),
            "record".into(),
            "-g".into(),
            "-o".into(),
            format!("{out}/perf.data"),
            "--".into(),
        ],
        ProfilingTool::Nsys => vec![
            "nsys".into(),
            "profile".into(),
            "--trace=cuda,nvtx,osrt".into(),
            "--force-overwrite=true".into(),
            "-o".into(),
            format!("{out}/nsys_profile"),
        ],
        ProfilingTool::Uprof => vec![
            "AMDuProfCLI".into(),
            "collect".into(),
            "--config".into(),
            "tbp".into(),
            "-o".into(),
            format!("{out}/uprof"),
        ],
        ProfilingTool::MemoryPeak => vec!["/usr/bin/time".into(), "-v".into()],
    }
}

fn check_stage_flags(command: &[String]) -> Result<(), PreflightError> {
    let enabled = command
        .iter()
        .filter(|arg| *arg == "--run_data_pipeline=true" || *arg == "--run_inference=true")
        .count();
    if enabled == 1 {
        Ok(())
    } else {
        Err(PreflightError::ConflictingStageFlags)
    }
}

/// Deterministic container name for a spec.
fn container_name(spec: &RunSpec) -> String {
    let dir = spec
        .output_dir
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| spec.workload.id.clone());
    let sanitized: String = dir
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("afbench-{}-{sanitized}", spec.stage)
}

fn resolve_path(role: &'static str, path: &Path) -> Result<PathBuf, PreflightError> {
    path.canonicalize()
        .map_err(|source| PreflightError::MissingPath {
            role,
            path: path.to_path_buf(),
            source,
        })
}

fn resolve_dir(role: &'static str, path: &Path) -> Result<PathBuf, PreflightError> {
    let resolved = resolve_path(role, path)?;
    if !resolved.is_dir() {
        return Err(PreflightError::NotADirectory {
            role,
            path: resolved,
        });
    }
    std::fs::read_dir(&resolved).map_err(|source| PreflightError::Unreadable {
        role,
        path: resolved.clone(),
        source,
    })?;
    Ok(resolved)
}

/// Locate an executable the way the shell would: paths containing a
/// separator are taken as given, bare names are searched on `PATH`.
#[must_use]
pub fn find_program(program: &str) -> Option<PathBuf> {
    let given = Path::new(program);
    if given.components().count() > 1 {
        return is_executable(given).then(|| given.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .is_ok_and(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
}

/// Short hash identifying the benchmark configuration of a run.
///
/// Covers everything that changes what is being measured, not where the
/// artifacts go.
#[must_use]
pub fn config_hash(spec: &RunSpec, settings: &BenchSettings) -> String {
    let image = if spec.profiler.is_some() {
        &settings.profiling_image
    } else {
        &settings.docker_image
    };
    let mut hasher = Sha256::new();
    hasher.update(b"afbench-config-v1\n");
    for (key, value) in [
        ("image", image.clone()),
        ("stage", spec.stage.to_string()),
        ("threads", spec.threads().to_string()),
        ("memory_policy", spec.memory_policy.to_string()),
        (
            "profiler",
            spec.profiler.map_or_else(|| "none".to_string(), |t| t.to_string()),
        ),
        ("docker_memory", settings.docker_memory.clone()),
        ("docker_shm_size", settings.docker_shm_size.clone()),
        (
            "docker_cpus",
            settings.docker_cpus.map(|c| c.to_string()).unwrap_or_default(),
        ),
        (
            "num_diffusion_samples",
            settings.num_diffusion_samples.to_string(),
        ),
    ] {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(&hasher.finalize()[..6])
}

/// Problems detected before launch.
#[derive(Debug, thiserror::Error)]
pub enum PreflightError {
    #[error("{role} {path} cannot be resolved: {source}")]
    MissingPath {
        role: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{role} {path} is not a directory")]
    NotADirectory { role: &'static str, path: PathBuf },
    #[error("{role} {path} is not readable: {source}")]
    Unreadable {
        role: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("input {0} is not a regular file")]
    InputNotAFile(PathBuf),
    #[error("profiling with {0} needs a privileged container but bench.allow_privileged is false")]
    PrivilegesUnavailable(ProfilingTool),
    #[error("plan would enable both pipeline stages")]
    ConflictingStageFlags,
    #[error("{0} not found on PATH")]
    ToolNotFound(String),
}

#[cfg(test)]
mod tests {
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::config::BenchConfig;

    struct Fixture {
        _dir: TempDir,
        settings: BenchSettings,
        spec: RunSpec,
    }

    fn fixture(stage: Stage) -> Fixture {
        let dir = tempdir().unwrap();
        let root = dir.path();
        for sub in ["db", "models", "input", "out/run1"] {
            std::fs::create_dir_all(root.join(sub)).unwrap();
        }
        std::fs::write(root.join("input/2pv7_data.json"), "{}").unwrap();

        let config = BenchConfig::from_toml(&format!(
            "[bench]\ndb_dir = \"{}\"\nmodel_dir = \"{}\"\n",
            root.join("db").display(),
            root.join("models").display()
        ))
        .unwrap();

        let spec = RunSpec::new(
            Workload::from_path(root.join("input/2pv7_data.json")),
            stage,
            NonZeroU32::new(8).unwrap(),
            MemoryPolicy::Standard,
            None,
            0,
            Duration::from_secs(60),
            root.join("out/run1"),
        );
        Fixture {
            _dir: dir,
            settings: config.bench,
            spec,
        }
    }

    #[test]
    fn test_build_is_deterministic() {
        let f = fixture(Stage::Predict);
        let a = build(&f.spec, &f.settings).unwrap();
        let b = build(&f.spec, &f.settings).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.argv(), b.argv());
    }

    #[test]
    fn test_thread_env_set_for_every_library() {
        let f = fixture(Stage::Prepare);
        let plan = build(&f.spec, &f.settings).unwrap();
        for var in THREAD_ENV_VARS {
            assert_eq!(plan.env.get(var).map(String::as_str), Some("8"), "{var}");
        }
        assert!(plan.env["XLA_FLAGS"].contains("intra_op_parallelism_threads=8"));
        assert!(plan.command.contains(&"--jackhmmer_n_cpu=8".to_string()));
        assert!(plan.command.contains(&"--nhmmer_n_cpu=8".to_string()));
    }

    #[test]
    fn test_stage_flags() {
        let f = fixture(Stage::Prepare);
        let prepare = build(&f.spec, &f.settings).unwrap();
        assert!(prepare.command.contains(&"--run_data_pipeline=true".to_string()));
        assert!(prepare.command.contains(&"--run_inference=false".to_string()));
        assert!(!prepare.resource_flags.contains(&"--gpus".to_string()));

        let f = fixture(Stage::Predict);
        let predict = build(&f.spec, &f.settings).unwrap();
        assert!(predict.command.contains(&"--run_data_pipeline=false".to_string()));
        assert!(predict.command.contains(&"--run_inference=true".to_string()));
        assert!(predict.resource_flags.contains(&"--gpus".to_string()));
        assert!(check_stage_flags(&predict.command).is_ok());
    }

    #[test]
    fn test_conflicting_stage_flags_rejected() {
        let command = vec![
            "--run_data_pipeline=true".to_string(),
            "--run_inference=true".to_string(),
        ];
        assert!(matches!(
            check_stage_flags(&command),
            Err(PreflightError::ConflictingStageFlags)
        ));
    }

    #[test]
    fn test_expanded_memory_env() {
        let f = fixture(Stage::Predict);
        let standard = build(&f.spec, &f.settings).unwrap();
        assert!(!standard.env.contains_key("TF_FORCE_UNIFIED_MEMORY"));

        let spec = RunSpec {
            memory_policy: MemoryPolicy::Expanded,
            ..f.spec.clone()
        };
        let expanded = build(&spec, &f.settings).unwrap();
        assert_eq!(expanded.env["XLA_PYTHON_CLIENT_PREALLOCATE"], "false");
        assert_eq!(expanded.env["TF_FORCE_UNIFIED_MEMORY"], "true");
        let fraction: f64 = expanded.env["XLA_CLIENT_MEM_FRACTION"].parse().unwrap();
        assert!(fraction > 1.0);
    }

    #[test]
    fn test_mounts_are_absolute_and_flagged() {
        let f = fixture(Stage::Predict);
        let plan = build(&f.spec, &f.settings).unwrap();
        assert_eq!(plan.mounts.len(), 4);
        assert!(plan.mounts.iter().all(|m| m.host.is_absolute()));
        let output = plan
            .mounts
            .iter()
            .find(|m| m.container == CONTAINER_OUTPUT_DIR)
            .unwrap();
        assert!(!output.read_only);
        assert!(
            plan.mounts
                .iter()
                .filter(|m| m.container != CONTAINER_OUTPUT_DIR)
                .all(|m| m.read_only)
        );
        assert!(
            plan.argv()
                .contains(&format!("--json_path={CONTAINER_INPUT_DIR}/2pv7_data.json"))
        );
    }

    #[test]
    fn test_missing_paths_fail_preflight() {
        let f = fixture(Stage::Predict);
        let mut settings = f.settings.clone();
        settings.db_dir = PathBuf::from("/nonexistent/afbench/db");
        let err = build(&f.spec, &settings).unwrap_err();
        assert!(
            matches!(err, PreflightError::MissingPath { role: "database directory", .. }),
            "{err}"
        );

        let spec = RunSpec {
            output_dir: PathBuf::from("/nonexistent/afbench/out"),
            ..f.spec.clone()
        };
        assert!(matches!(
            build(&spec, &f.settings),
            Err(PreflightError::MissingPath { role: "output directory", .. })
        ));
    }

    #[test]
    fn test_profiling_switches_image_and_privileges() {
        let f = fixture(Stage::Prepare);
        let spec = RunSpec {
            profiler: Some(ProfilingTool::PerfStat),
            ..f.spec.clone()
        };
        let plan = build(&spec, &f.settings).unwrap();
        assert_eq!(plan.image, f.settings.profiling_image);
        assert!(plan.privileged);
        assert!(plan.argv().contains(&"--privileged".to_string()));
        assert_eq!(plan.command[0], "perf");
        assert!(plan.command.contains(&"python".to_string()));
    }

    #[test]
    fn test_profiling_without_privileges_is_preflight_error() {
        let f = fixture(Stage::Prepare);
        let mut settings = f.settings.clone();
        settings.allow_privileged = false;
        let spec = RunSpec {
            profiler: Some(ProfilingTool::Nsys),
            ..f.spec.clone()
        };
        assert!(matches!(
            build(&spec, &settings),
            Err(PreflightError::PrivilegesUnavailable(ProfilingTool::Nsys))
        ));
    }

    #[test]
    fn test_next_attempt() {
        let f = fixture(Stage::Predict);
        let retry = f.spec.next_attempt(MemoryPolicy::Expanded);
        assert_eq!(retry.attempt, 2);
        assert_eq!(retry.memory_policy, MemoryPolicy::Expanded);
        assert_eq!(retry.output_dir.file_name().unwrap(), "run1_attempt2");
        assert_eq!(f.spec.memory_policy, MemoryPolicy::Standard);
        let third = retry.next_attempt(MemoryPolicy::Expanded);
        assert_eq!(third.output_dir.file_name().unwrap(), "run1_attempt3");
    }

    #[test]
    fn test_next_attempt_with_attempt_in_workload_id() {
        let spec_for = |dir: &str| {
            RunSpec::new(
                Workload::from_path(PathBuf::from("/in/fold.json")),
                Stage::Predict,
                NonZeroU32::new(4).unwrap(),
                MemoryPolicy::Standard,
                None,
                0,
                Duration::from_secs(60),
                PathBuf::from("/out").join(dir),
            )
        };
        let a = spec_for("sys_fold_attempt_a_1700000000000").next_attempt(MemoryPolicy::Expanded);
        let b = spec_for("sys_fold_attempt_b_1700000000000").next_attempt(MemoryPolicy::Expanded);
        assert_ne!(a.output_dir, b.output_dir);
        assert_eq!(
            a.output_dir,
            PathBuf::from("/out/sys_fold_attempt_a_1700000000000_attempt2")
        );
        assert_eq!(
            a.next_attempt(MemoryPolicy::Expanded).output_dir,
            PathBuf::from("/out/sys_fold_attempt_a_1700000000000_attempt3")
        );
    }

    #[test]
    fn test_config_hash() {
        let f = fixture(Stage::Predict);
        let a = config_hash(&f.spec, &f.settings);
        assert_eq!(a.len(), 12);
        assert_eq!(a, config_hash(&f.spec, &f.settings));

        let spec = RunSpec {
            memory_policy: MemoryPolicy::Expanded,
            ..f.spec.clone()
        };
        assert_ne!(a, config_hash(&spec, &f.settings));

        let spec = RunSpec {
            output_dir: PathBuf::from("/elsewhere"),
            ..f.spec.clone()
        };
        assert_eq!(a, config_hash(&spec, &f.settings));
    }

    #[test]
    fn test_find_program() {
        assert!(find_program("sh").is_some());
        assert!(find_program("afbench-no-such-tool").is_none());

        let dir = tempdir().unwrap();
        let script = dir.path().join("tool");
        std::fs::write(&script, "#!/bin/sh\n").unwrap();
        let path = script.to_string_lossy().into_owned();
        assert!(find_program(&path).is_none());
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        assert_eq!(find_program(&path), Some(script));
    }

    #[test]
    fn test_workload_resolve() {
        let dir = tempdir().unwrap();
        let w = Workload::resolve("promo_data.json", dir.path());
        assert_eq!(w.id, "promo_data");
        assert_eq!(w.input_file, dir.path().join("promo_data.json"));
        assert_eq!(w.file_name(), "promo_data.json");
    }
}
