//! Host resource detection.
//!
//! GPU memory is read with `nvidia-smi` on the host first. When the host has
//! no usable `nvidia-smi` (common when drivers only live inside the container
//! toolkit) the same query runs inside a throwaway CUDA container. If both
//! fail the capacity is [`GpuMemory::Unknown`], which callers must treat as
//! "assume sufficient" rather than zero.

use std::{
    process::{Command, Stdio},
    sync::OnceLock,
};

use crate::config::BenchSettings;

const GPU_QUERY_ARGS: [&str; 3] = [
    "--query-gpu=memory.total",
    "--format=csv,noheader,nounits",
    "--id=0",
];

/// Probed accelerator memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuMemory {
    /// Total memory of the first GPU in MiB.
    Known(u64),
    /// Neither probe path produced an answer.
    Unknown,
}

impl GpuMemory {
    #[must_use]
    pub fn mb(self) -> Option<u64> {
        match self {
            Self::Known(mb) => Some(mb),
            Self::Unknown => None,
        }
    }
}

impl std::fmt::Display for GpuMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known(mb) => write!(f, "{mb} MB"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Resource limits queryable from the host.
#[derive(Debug, Clone)]
pub struct HostResources {
    pub gpu_memory: GpuMemory,
    pub cpu_count: usize,
    pub host_memory_mb: Option<u64>,
}

/// Detects GPU memory and other host limits. Results are cached.
pub struct EnvironmentProber {
    nvidia_smi: String,
    docker: String,
    probe_image: String,
    gpu_cache: OnceLock<GpuMemory>,
}

impl EnvironmentProber {
    #[must_use]
    pub fn new(settings: &BenchSettings) -> Self {
        Self::with_programs("nvidia-smi", &settings.docker_program, &settings.probe_image)
    }

    /// Create a prober with explicit program names (used by tests).
    #[must_use]
    pub fn with_programs(
        nvidia_smi: impl Into<String>,
        docker: impl Into<String>,
        probe_image: impl Into<String>,
    ) -> Self {
        Self {
            nvidia_smi: nvidia_smi.into(),
            docker: docker.into(),
            probe_image: probe_image.into(),
            gpu_cache: OnceLock::new(),
        }
    }

    /// Probe total GPU memory, host first, then through the container runtime.
    pub fn probe_gpu_memory(&self) -> GpuMemory {
        *self.gpu_cache.get_or_init(|| {
            if let Some(mb) = self.query_host() {
                tracing::debug!("GPU memory from host nvidia-smi: {mb} MB");
                return GpuMemory::Known(mb);
            }
            if let Some(mb) = self.query_container() {
                tracing::debug!("GPU memory from diagnostic container: {mb} MB");
                return GpuMemory::Known(mb);
            }
            tracing::warn!("Unable to detect GPU memory, assuming it is sufficient");
            GpuMemory::Unknown
        })
    }

    /// Probe everything the harness cares about.
    pub fn probe_host(&self) -> HostResources {
        HostResources {
            gpu_memory: self.probe_gpu_memory(),
            cpu_count: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            host_memory_mb: std::fs::read_to_string("/proc/meminfo")
                .ok()
                .and_then(|s| parse_meminfo_total_mb(&s)),
        }
    }

    fn query_host(&self) -> Option<u64> {
        let output = Command::new(&self.nvidia_smi)
            .args(GPU_QUERY_ARGS)
            .stdin(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_memory_total(&String::from_utf8_lossy(&output.stdout))
    }

    fn query_container(&self) -> Option<u64> {
        let container = DiagnosticContainer {
            docker: &self.docker,
            name: format!("afbench-probe-{}", std::process::id()),
        };
        let output = Command::new(&self.docker)
            .args(["run", "--rm", "--name", &container.name, "--gpus", "all"])
            .arg(&self.probe_image)
            .arg("nvidia-smi")
            .args(GPU_QUERY_ARGS)
            .stdin(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        parse_memory_total(&String::from_utf8_lossy(&output.stdout))
    }

    /// Names of running containers whose name starts with `prefix`. `None`
    /// when the container runtime cannot be queried.
    #[must_use]
    pub fn running_containers(&self, prefix: &str) -> Option<Vec<String>> {
        let output = Command::new(&self.docker)
            .args(["ps", "--filter", &format!("name={prefix}"), "--format", "{{.Names}}"])
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        Some(
            String::from_utf8_lossy(&output.stdout)
                .lines()
                .map(str::trim)
                .filter(|name| name.starts_with(prefix))
                .map(str::to_string)
                .collect(),
        )
    }
}

/// A diagnostic container that is force-removed when dropped, whatever
/// happened to the probe.
struct DiagnosticContainer<'a> {
    docker: &'a str,
    name: String,
}

impl Drop for DiagnosticContainer<'_> {
    fn drop(&mut self) {
        let _ = Command::new(self.docker)
            .args(["rm", "-f", &self.name])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
    }
}

/// Parse `nvidia-smi` memory output. Only the first GPU is considered.
fn parse_memory_total(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

fn parse_meminfo_total_mb(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemTotal:"))?;
    let kb: u64 = line
        .trim_start_matches("MemTotal:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_memory_total() {
        assert_eq!(parse_memory_total("81920\n"), Some(81920));
        assert_eq!(parse_memory_total("\n  24576 MiB\n16384\n"), Some(24576));
        assert_eq!(parse_memory_total(""), None);
        assert_eq!(parse_memory_total("No devices were found"), None);
    }

    #[test]
    fn test_parse_meminfo() {
        let meminfo = "MemTotal:       65843828 kB\nMemFree:         1234 kB\n";
        assert_eq!(parse_meminfo_total_mb(meminfo), Some(64300));
        assert_eq!(parse_meminfo_total_mb("MemFree: 1 kB"), None);
    }

    #[test]
    fn test_unknown_when_both_probes_fail() {
        let prober = EnvironmentProber::with_programs(
            "/nonexistent/nvidia-smi",
            "/nonexistent/docker",
            "cuda",
        );
        assert_eq!(prober.probe_gpu_memory(), GpuMemory::Unknown);
        assert_eq!(prober.probe_gpu_memory().mb(), None);
    }

    #[cfg(unix)]
    #[test]
    fn test_host_probe_with_fake_nvidia_smi() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("nvidia-smi");
        std::fs::write(&fake, "#!/bin/sh\necho 40960\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        let prober =
            EnvironmentProber::with_programs(fake.to_str().unwrap(), "/nonexistent/docker", "cuda");
        assert_eq!(prober.probe_gpu_memory(), GpuMemory::Known(40960));
        assert!(prober.probe_host().cpu_count >= 1);
    }

    /// A fake container runtime that records every invocation and runs
    /// `run_body` for `run`.
    #[cfg(unix)]
    fn recording_docker(dir: &std::path::Path, run_body: &str) -> (String, std::path::PathBuf) {
        use std::os::unix::fs::PermissionsExt;

        let calls = dir.join("calls.txt");
        let fake = dir.join("docker");
        std::fs::write(
            &fake,
            format!(
                "#!/bin/sh\necho \"$*\" >> '{}'\nif [ \"$1\" = run ]; then {run_body}; fi\nexit 0\n",
                calls.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();
        (fake.to_string_lossy().into_owned(), calls)
    }

    #[cfg(unix)]
    #[test]
    fn test_diagnostic_container_removed_when_run_fails() {
        let dir = tempfile::tempdir().unwrap();
        let (docker, calls) = recording_docker(dir.path(), "exit 125");

        let prober = EnvironmentProber::with_programs("/nonexistent/nvidia-smi", docker, "cuda");
        assert_eq!(prober.probe_gpu_memory(), GpuMemory::Unknown);

        let name = format!("afbench-probe-{}", std::process::id());
        let calls = std::fs::read_to_string(calls).unwrap();
        let lines: Vec<&str> = calls.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with(&format!("run --rm --name {name} --gpus all cuda nvidia-smi")));
        assert_eq!(lines[1], format!("rm -f {name}"));
    }

    #[cfg(unix)]
    #[test]
    fn test_diagnostic_container_removed_after_success() {
        let dir = tempfile::tempdir().unwrap();
        let (docker, calls) = recording_docker(dir.path(), "echo 24576; exit 0");

        let prober = EnvironmentProber::with_programs("/nonexistent/nvidia-smi", docker, "cuda");
        assert_eq!(prober.probe_gpu_memory(), GpuMemory::Known(24576));

        let calls = std::fs::read_to_string(calls).unwrap();
        assert!(
            calls
                .lines()
                .last()
                .unwrap()
                .starts_with("rm -f afbench-probe-")
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_running_containers() {
        let dir = tempfile::tempdir().unwrap();
        let (docker, _) = recording_docker(dir.path(), "true");
        let script = std::fs::read_to_string(&docker).unwrap().replace(
            "exit 0\n",
            "[ \"$1\" = ps ] && printf 'afbench-predict-a\\nafbench-prepare-b\\n'\nexit 0\n",
        );
        std::fs::write(&docker, script).unwrap();

        let prober = EnvironmentProber::with_programs("nvidia-smi", docker, "cuda");
        assert_eq!(
            prober.running_containers("afbench-"),
            Some(vec!["afbench-predict-a".to_string(), "afbench-prepare-b".to_string()])
        );
        let missing = EnvironmentProber::with_programs("nvidia-smi", "/nonexistent/docker", "cuda");
        assert_eq!(missing.running_containers("afbench-"), None);
    }
}
