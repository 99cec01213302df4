#![warn(clippy::pedantic)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_possible_wrap,
    clippy::too_many_lines
)]

//! AlphaFold 3 Benchmark Harness
//!
//! Sweeps structure-prediction runs over inputs and thread counts inside
//! containers, picks a memory policy per workload, retries out-of-memory
//! failures with unified memory and records every run in a CSV ledger.

pub mod classify;
pub mod config;
pub mod ledger;
pub mod lock;
pub mod monitor;
pub mod parser;
pub mod plan;
pub mod policy;
pub mod probe;
pub mod runner;
pub mod stats;
pub mod sweep;

pub use config::BenchConfig;
pub use ledger::{Ledger, ResultRecord, RunStatus};
pub use plan::{ExecutionPlan, RunSpec, Workload};
pub use policy::PolicySelector;
pub use probe::EnvironmentProber;
pub use runner::{DockerExecutor, Executor, RunOutcome};
pub use sweep::{Sweep, SweepReport, SweepRequest};
