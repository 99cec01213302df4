//! Memory policy selection.
//!
//! A workload's accelerator memory requirement is estimated by a chain of
//! [`MemoryEstimator`]s. The selector pads the estimate with a safety factor
//! and requests expanded (unified) memory only when the padded figure exceeds
//! the probed device capacity:
//!
//! - known workloads: measured figures from [`KnownTableEstimator`]
//! - unknown workloads: input size × multiplier from [`LinearSizeEstimator`],
//!   an approximation only
//! - nothing usable: the configured default requirement

use std::{collections::BTreeMap, path::Path};

use afbench_config::MemoryPolicy;

use crate::{config::MemorySettings, plan::Workload, probe::GpuMemory};

/// Measured requirements (MB) for the standard benchmark inputs.
const KNOWN_REQUIREMENTS: [(&str, u64); 8] = [
    ("6QNR_subset_data", 24_000),
    ("7k00_subset_data", 28_000),
    ("promo_data", 8_000),
    ("promo_data_seed1", 8_000),
    ("1yy9_data", 6_000),
    ("rcsb_pdb_7rce_data", 6_000),
    ("2pv7_data", 4_000),
    ("2PV7", 3_000),
];

/// Where an estimate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EstimateSource {
    /// Looked up from measured figures.
    Known,
    /// Derived from the input size. Not ground truth.
    Approximate,
    /// Nothing was known; the configured default was used.
    Default,
}

impl std::fmt::Display for EstimateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Known => write!(f, "known"),
            Self::Approximate => write!(f, "approximate"),
            Self::Default => write!(f, "default"),
        }
    }
}

/// Estimated accelerator memory requirement of a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryEstimate {
    pub required_mb: u64,
    pub source: EstimateSource,
}

/// Strategy for estimating a workload's memory requirement.
pub trait MemoryEstimator: Send + Sync {
    /// Returns `None` when this estimator knows nothing about the workload.
    fn estimate(&self, workload: &Workload) -> Option<MemoryEstimate>;
}

/// Fixed lookup table keyed by workload id.
#[derive(Debug, Clone)]
pub struct KnownTableEstimator {
    table: BTreeMap<String, u64>,
}

impl KnownTableEstimator {
    /// The built-in table with `overrides` taking precedence.
    #[must_use]
    pub fn with_overrides(overrides: &BTreeMap<String, u64>) -> Self {
        let mut table: BTreeMap<String, u64> = KNOWN_REQUIREMENTS
            .iter()
            .map(|(k, v)| ((*k).to_string(), *v))
            .collect();
        table.extend(overrides.iter().map(|(k, v)| (k.clone(), *v)));
        Self { table }
    }
}

impl Default for KnownTableEstimator {
    fn default() -> Self {
        Self::with_overrides(&BTreeMap::new())
    }
}

impl MemoryEstimator for KnownTableEstimator {
    fn estimate(&self, workload: &Workload) -> Option<MemoryEstimate> {
        self.table.get(&workload.id).map(|&mb| MemoryEstimate {
            required_mb: mb,
            source: EstimateSource::Known,
        })
    }
}

/// Linear estimate from the input file's size.
#[derive(Debug, Clone)]
pub struct LinearSizeEstimator {
    /// MB of requirement per MB of input.
    pub multiplier: f64,
}

impl Default for LinearSizeEstimator {
    fn default() -> Self {
        Self { multiplier: 1000.0 }
    }
}

impl LinearSizeEstimator {
    fn estimate_from_bytes(&self, bytes: u64) -> MemoryEstimate {
        let size_mb = bytes as f64 / (1024.0 * 1024.0);
        MemoryEstimate {
            required_mb: (size_mb * self.multiplier).round() as u64,
            source: EstimateSource::Approximate,
        }
    }

    fn file_size(path: &Path) -> Option<u64> {
        std::fs::metadata(path).ok().map(|m| m.len())
    }
}

impl MemoryEstimator for LinearSizeEstimator {
    fn estimate(&self, workload: &Workload) -> Option<MemoryEstimate> {
        Self::file_size(&workload.input_file).map(|bytes| self.estimate_from_bytes(bytes))
    }
}

/// Outcome of a policy decision, kept for logging and run metadata.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PolicyDecision {
    pub policy: MemoryPolicy,
    pub estimate: MemoryEstimate,
    pub required_with_margin_mb: u64,
    pub capacity: GpuMemory,
}

/// Chooses the memory policy for each run.
pub struct PolicySelector {
    estimators: Vec<Box<dyn MemoryEstimator>>,
    safety_factor: f64,
    default_requirement_mb: u64,
    force_expanded: bool,
}

impl PolicySelector {
    /// Table lookup first, then the size-based approximation.
    #[must_use]
    pub fn from_settings(settings: &MemorySettings) -> Self {
        Self {
            estimators: vec![
                Box::new(KnownTableEstimator::with_overrides(&settings.requirements)),
                Box::new(LinearSizeEstimator {
                    multiplier: settings.size_multiplier,
                }),
            ],
            safety_factor: settings.safety_factor,
            default_requirement_mb: settings.default_requirement_mb,
            force_expanded: settings.force_expanded,
        }
    }

    /// A selector over an explicit estimator chain.
    #[must_use]
    pub fn new(estimators: Vec<Box<dyn MemoryEstimator>>, safety_factor: f64) -> Self {
        Self {
            estimators,
            safety_factor,
            default_requirement_mb: MemorySettings::default().default_requirement_mb,
            force_expanded: false,
        }
    }

    /// Estimate a workload's requirement through the estimator chain.
    #[must_use]
    pub fn estimate(&self, workload: &Workload) -> MemoryEstimate {
        self.estimators
            .iter()
            .find_map(|e| e.estimate(workload))
            .unwrap_or(MemoryEstimate {
                required_mb: self.default_requirement_mb,
                source: EstimateSource::Default,
            })
    }

    /// Pick the memory policy for `workload` given the probed capacity.
    ///
    /// Unknown capacity always yields [`MemoryPolicy::Standard`].
    #[must_use]
    pub fn select_policy(&self, workload: &Workload, capacity: GpuMemory) -> PolicyDecision {
        let estimate = self.estimate(workload);
        let required_with_margin_mb =
            (estimate.required_mb as f64 * self.safety_factor).ceil() as u64;

        let policy = if self.force_expanded {
            MemoryPolicy::Expanded
        } else {
            decide(required_with_margin_mb, capacity)
        };

        if estimate.source == EstimateSource::Approximate {
            tracing::debug!(
                "{}: memory requirement {} MB is a size-based approximation",
                workload.id,
                estimate.required_mb
            );
        }
        match (policy, capacity) {
            (MemoryPolicy::Expanded, GpuMemory::Known(cap)) if !self.force_expanded => {
                tracing::info!(
                    "{}: expanded memory required ({required_with_margin_mb} MB > {cap} MB GPU)",
                    workload.id
                );
            }
            (MemoryPolicy::Standard, GpuMemory::Known(cap)) => {
                tracing::debug!(
                    "{}: expanded memory not needed ({required_with_margin_mb} MB <= {cap} MB GPU)",
                    workload.id
                );
            }
            _ => {}
        }

        PolicyDecision {
            policy,
            estimate,
            required_with_margin_mb,
            capacity,
        }
    }
}

fn decide(required_with_margin_mb: u64, capacity: GpuMemory) -> MemoryPolicy {
    match capacity {
        GpuMemory::Unknown => MemoryPolicy::Standard,
        GpuMemory::Known(cap) if required_with_margin_mb > cap => MemoryPolicy::Expanded,
        GpuMemory::Known(_) => MemoryPolicy::Standard,
    }
}
