//! Failure classification and the out-of-memory retry decision.

use afbench_config::MemoryPolicy;

use crate::{plan::RunSpec, runner::RunOutcome};

/// Output fragments that identify an accelerator out-of-memory failure.
/// Matched case-sensitively.
pub const OOM_SIGNATURES: [&str; 6] = [
    "CUDA_ERROR_OUT_OF_MEMORY",
    "CUDA out of memory",
    "OOM when allocating tensor",
    "ResourceExhaustedError",
    "RESOURCE_EXHAUSTED: Out of memory",
    "GPU memory allocation failed",
];

/// Why a run did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureKind {
    /// Exited cleanly.
    #[default]
    None,
    OutOfMemory,
    Timeout,
    /// Nonzero exit without a recognized signature.
    Crash,
    /// Could not be launched, or ended without an exit code.
    Unknown,
}

impl FailureKind {
    #[must_use]
    pub fn is_failure(self) -> bool {
        self != Self::None
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::OutOfMemory => write!(f, "out_of_memory"),
            Self::Timeout => write!(f, "timeout"),
            Self::Crash => write!(f, "crash"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// First OOM signature contained in `text`.
#[must_use]
pub fn find_oom_signature(text: &str) -> Option<&'static str> {
    OOM_SIGNATURES.into_iter().find(|sig| text.contains(sig))
}

/// Classify a finished run from its exit code and captured output.
#[must_use]
pub fn classify(exit_code: Option<i32>, timed_out: bool, output: &str) -> FailureKind {
    classify_parts(exit_code, timed_out, find_oom_signature(output).is_some())
}

/// Classification when signature detection already happened while streaming.
pub(crate) fn classify_parts(exit_code: Option<i32>, timed_out: bool, oom_seen: bool) -> FailureKind {
    if timed_out {
        return FailureKind::Timeout;
    }
    match exit_code {
        Some(0) => FailureKind::None,
        _ if oom_seen => FailureKind::OutOfMemory,
        Some(_) => FailureKind::Crash,
        None => FailureKind::Unknown,
    }
}

/// What to do after an attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Run again with `spec`.
    Retry { spec: RunSpec, remaining_budget: u32 },
    /// No further attempts; the cell ends with this kind.
    Final(FailureKind),
}

/// Decide whether `outcome` warrants another attempt.
///
/// Only an out-of-memory failure under the standard policy with budget left
/// is retried, and always with expanded memory.
#[must_use]
pub fn classify_and_maybe_retry(outcome: &RunOutcome, spec: &RunSpec, retry_budget: u32) -> Decision {
    match outcome.failure {
        FailureKind::OutOfMemory
            if spec.memory_policy == MemoryPolicy::Standard && retry_budget > 0 =>
        {
            tracing::warn!(
                "{}: out of memory with standard policy, retrying with expanded memory",
                spec.workload.id
            );
            Decision::Retry {
                spec: spec.next_attempt(MemoryPolicy::Expanded),
                remaining_budget: retry_budget - 1,
            }
        }
        kind => Decision::Final(kind),
    }
}
