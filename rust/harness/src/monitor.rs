//! Background resource samplers run alongside each execution.
//!
//! Each sampler is a child process in its own process group writing straight
//! into a file in the run's output directory. [`MonitorSet::stop`] signals the
//! groups and awaits every child, so nothing outlives the run it observed.

use std::{
    path::Path,
    process::Stdio,
    time::Duration,
};

use tokio::process::{Child, Command};

use crate::config::MonitorSettings;

const STOP_GRACE: Duration = Duration::from_secs(2);

/// A running sampler.
struct Monitor {
    name: &'static str,
    child: Child,
}

/// The samplers attached to one run.
#[derive(Default)]
pub struct MonitorSet {
    monitors: Vec<Monitor>,
}

impl MonitorSet {
    /// Start the enabled samplers, writing into `output_dir`.
    ///
    /// A sampler that cannot be started is skipped with a warning.
    pub fn start(settings: &MonitorSettings, output_dir: &Path) -> Self {
        let interval = settings.interval_secs.max(1).to_string();
        let mut set = Self::default();
        if settings.gpu {
            set.spawn(
                "gpu",
                "nvidia-smi",
                &[
                    "--query-gpu=timestamp,utilization.gpu,memory.used,memory.total",
                    "--format=csv",
                    "-l",
                    &interval,
                ],
                &output_dir.join("gpu_monitor.csv"),
            );
        }
        if settings.system {
            set.spawn(
                "system",
                "vmstat",
                &["-t", &interval],
                &output_dir.join("system_monitor.log"),
            );
        }
        set
    }

    fn spawn(&mut self, name: &'static str, program: &str, args: &[&str], path: &Path) {
        let file = match std::fs::File::create(path) {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!("Not starting {name} monitor, cannot create {}: {e}", path.display());
                return;
            }
        };
        match Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(file))
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => {
                tracing::debug!("Started {name} monitor");
                self.monitors.push(Monitor { name, child });
            }
            Err(e) => tracing::warn!("Not starting {name} monitor: {e}"),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.monitors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.monitors.is_empty()
    }

    /// Stop every sampler and wait for it to exit.
    pub async fn stop(self) {
        for mut monitor in self.monitors {
            if let Some(pid) = monitor.child.id() {
                // SAFETY: the group was created for this child via process_group(0).
                unsafe {
                    libc::killpg(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            let waited = tokio::time::timeout(STOP_GRACE, monitor.child.wait()).await;
            if waited.is_err() {
                tracing::debug!("{} monitor ignored SIGTERM, killing", monitor.name);
                let _ = monitor.child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_disabled_monitors_start_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = MonitorSettings {
            gpu: false,
            system: false,
            interval_secs: 1,
        };
        let set = MonitorSet::start(&settings, dir.path());
        assert!(set.is_empty());
        set.stop().await;
    }

    #[tokio::test]
    #[ignore = "spawns subprocesses"]
    async fn test_system_monitor_stops() {
        let dir = tempfile::tempdir().unwrap();
        let settings = MonitorSettings {
            gpu: false,
            system: true,
            interval_secs: 1,
        };
        let set = MonitorSet::start(&settings, dir.path());
        assert_eq!(set.len(), 1);
        tokio::time::sleep(Duration::from_millis(1500)).await;
        set.stop().await;
        assert!(dir.path().join("system_monitor.log").exists());
    }
}
