//! Container execution for benchmark runs.

use std::{
    collections::VecDeque,
    path::{Path, PathBuf},
    process::Stdio,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{Child, Command},
    sync::mpsc,
};

use crate::{
    classify::{FailureKind, classify_parts, find_oom_signature},
    plan::{ExecutionPlan, PreflightError, find_program},
};

/// Grace period between SIGTERM and SIGKILL on timeout.
const KILL_GRACE: Duration = Duration::from_secs(10);
/// How long to wait for the output readers once the child is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub const RUN_LOG: &str = "run.log";

/// Result of one execution attempt.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Absent for signal termination and spawn failures.
    pub exit_code: Option<i32>,
    /// Wall time from just before spawn to just after exit.
    pub elapsed: Duration,
    /// Tail of the combined output.
    pub output: String,
    pub failure: FailureKind,
    /// Artifact directory of the attempt.
    pub output_dir: PathBuf,
    pub log_path: PathBuf,
}

impl RunOutcome {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.failure == FailureKind::None
    }
}

/// Launches execution plans.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Checks that must pass before `plan` is launched. Nothing is spawned.
    fn preflight(&self, _plan: &ExecutionPlan) -> Result<(), PreflightError> {
        Ok(())
    }

    async fn execute(&self, plan: &ExecutionPlan, timeout: Duration) -> RunOutcome;
}

/// Runs plans with the container runtime CLI.
pub struct DockerExecutor {
    max_capture_bytes: usize,
}

impl DockerExecutor {
    #[must_use]
    pub fn new(max_capture_bytes: usize) -> Self {
        Self { max_capture_bytes }
    }
}

#[async_trait]
impl Executor for DockerExecutor {
    fn preflight(&self, plan: &ExecutionPlan) -> Result<(), PreflightError> {
        match find_program(&plan.program) {
            Some(_) => Ok(()),
            None => Err(PreflightError::ToolNotFound(plan.program.clone())),
        }
    }

    async fn execute(&self, plan: &ExecutionPlan, timeout: Duration) -> RunOutcome {
        let log_path = plan.output_dir.join(RUN_LOG);
        if let Err(e) = tokio::fs::create_dir_all(&plan.output_dir).await {
            tracing::warn!("Failed to create {}: {e}", plan.output_dir.display());
        }
        let mut log = RunLog::create(&log_path).await;
        log.write(&format!("# {}\n", plan.display())).await;

        tracing::debug!("Spawning: {}", plan.display());
        let started = Instant::now();
        let mut child = match Command::new(&plan.program)
            .args(plan.argv())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                let message = format!("failed to spawn {}: {e}", plan.program);
                tracing::error!("{message}");
                log.write(&format!("{message}\n")).await;
                return RunOutcome {
                    exit_code: None,
                    elapsed: started.elapsed(),
                    output: message,
                    failure: FailureKind::Unknown,
                    output_dir: plan.output_dir.clone(),
                    log_path,
                };
            }
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);
        let collector = tokio::spawn(collect_output(rx, log, self.max_capture_bytes));

        let waited = tokio::time::timeout(timeout, child.wait()).await;
        let (status, timed_out) = match waited {
            Ok(status) => (status.ok(), false),
            Err(_) => {
                tracing::warn!(
                    "{} exceeded {}s, terminating",
                    plan.container_name,
                    timeout.as_secs()
                );
                (terminate(&plan.program, &plan.container_name, &mut child).await, true)
            }
        };
        let elapsed = started.elapsed();
        let exit_code = status.and_then(|s| s.code());

        let (mut log, tail, oom_seen) =
            match tokio::time::timeout(DRAIN_TIMEOUT, collector).await {
                Ok(Ok(collected)) => collected,
                _ => {
                    tracing::warn!("Output of {} did not drain", plan.container_name);
                    (RunLog::detached(&log_path), CappedBuffer::new(0), false)
                }
            };
        let failure = classify_parts(exit_code, timed_out, oom_seen);
        let trailer = match exit_code {
            Some(code) => format!("# exit {code} after {:.1}s ({failure})\n", elapsed.as_secs_f64()),
            None => format!("# no exit code after {:.1}s ({failure})\n", elapsed.as_secs_f64()),
        };
        log.write(&trailer).await;
        log.flush().await;

        RunOutcome {
            exit_code,
            elapsed,
            output: tail.text(),
            failure,
            output_dir: plan.output_dir.clone(),
            log_path,
        }
    }
}

/// The per-attempt log file. Write failures are warned about once and do
/// not affect the run.
struct RunLog {
    file: Option<File>,
    path: PathBuf,
    failed: bool,
}

impl RunLog {
    async fn create(path: &Path) -> Self {
        let file = File::create(path)
            .await
            .map_err(|e| tracing::warn!("Failed to create {}: {e}", path.display()))
            .ok();
        Self {
            failed: file.is_none(),
            file,
            path: path.to_path_buf(),
        }
    }

    /// Stands in for a log that was lost with the collector task.
    fn detached(path: &Path) -> Self {
        Self {
            file: None,
            path: path.to_path_buf(),
            failed: true,
        }
    }

    async fn write(&mut self, text: &str) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        if let Err(e) = file.write_all(text.as_bytes()).await
            && !self.failed
        {
            self.failed = true;
            tracing::warn!("Writing {} failed, log is incomplete: {e}", self.path.display());
        }
    }

    async fn flush(&mut self) {
        if let Some(file) = self.file.as_mut()
            && let Err(e) = file.flush().await
            && !self.failed
        {
            self.failed = true;
            tracing::warn!("Flushing {} failed: {e}", self.path.display());
        }
    }
}

/// Forward output lines. Bytes that are not UTF-8 are replaced rather than
/// ending the stream, so the pipe is always drained to EOF.
async fn forward_lines(stream: impl AsyncRead + Unpin, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut receiver_gone = false;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Reading child output failed: {e}");
                break;
            }
        }
        if receiver_gone {
            continue;
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        receiver_gone = tx.send(line).is_err();
    }
}

/// Write every line to the log and keep a bounded tail in memory.
async fn collect_output(
    mut rx: mpsc::UnboundedReceiver<String>,
    mut log: RunLog,
    max_bytes: usize,
) -> (RunLog, CappedBuffer, bool) {
    let mut tail = CappedBuffer::new(max_bytes);
    let mut oom_seen = false;
    while let Some(mut line) = rx.recv().await {
        oom_seen |= find_oom_signature(&line).is_some();
        line.push('\n');
        log.write(&line).await;
        line.pop();
        tail.push(line);
    }
    log.flush().await;
    (log, tail, oom_seen)
}

/// Stop a timed-out run: container first, then the local process group.
async fn terminate(
    program: &str,
    container_name: &str,
    child: &mut Child,
) -> Option<std::process::ExitStatus> {
    let _ = Command::new(program)
        .args(["kill", container_name])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await;

    let Some(pid) = child.id() else {
        return child.wait().await.ok();
    };
    let pgid = pid as libc::pid_t;
    // SAFETY: pgid is the group created for our own child via process_group(0).
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }
    if let Ok(status) = tokio::time::timeout(KILL_GRACE, child.wait()).await {
        return status.ok();
    }
    // SAFETY: as above.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
    child.wait().await.ok()
}

/// Keeps the most recent lines of output within a byte limit.
#[derive(Debug)]
pub struct CappedBuffer {
    lines: VecDeque<String>,
    bytes: usize,
    max_bytes: usize,
    truncated: bool,
}

impl CappedBuffer {
    #[must_use]
    pub fn new(max_bytes: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            max_bytes,
            truncated: false,
        }
    }

    pub fn push(&mut self, mut line: String) {
        if line.len() > self.max_bytes {
            let mut cut = line.len() - self.max_bytes;
            while !line.is_char_boundary(cut) {
                cut += 1;
            }
            line.drain(..cut);
            self.truncated = true;
        }
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > self.max_bytes + 1 {
            let Some(old) = self.lines.pop_front() else {
                break;
            };
            self.bytes -= old.len() + 1;
            self.truncated = true;
        }
    }

    /// Whether anything was dropped.
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    #[must_use]
    pub fn text(&self) -> String {
        let mut out = String::with_capacity(self.bytes);
        for line in &self.lines {
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}
