//! Stage, memory policy, profiler and thread-list types.

use std::num::NonZeroU32;

use serde::{Deserialize, Serialize};

/// Pipeline stage of the wrapped structure-prediction binary.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Data preparation (genetic search / MSA construction). CPU bound.
    #[default]
    Prepare,
    /// Compute inference (structure prediction). Needs the accelerator.
    Predict,
}

impl Stage {
    /// Whether this stage needs a GPU attached to the container.
    #[must_use]
    pub fn needs_gpu(self) -> bool {
        matches!(self, Self::Predict)
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Prepare => write!(f, "prepare"),
            Self::Predict => write!(f, "predict"),
        }
    }
}

impl std::str::FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "prepare" | "msa" | "data" | "data-pipeline" => Ok(Self::Prepare),
            "predict" | "inference" => Ok(Self::Predict),
            _ => Err(format!("unknown stage '{s}'. Use: prepare, predict")),
        }
    }
}

/// Accelerator memory mode requested from the workload's runtime.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum MemoryPolicy {
    /// Device memory only, runtime defaults.
    #[default]
    Standard,
    /// Unified memory: the device may page into host memory.
    Expanded,
}

impl std::fmt::Display for MemoryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Standard => write!(f, "standard"),
            Self::Expanded => write!(f, "expanded"),
        }
    }
}

impl std::str::FromStr for MemoryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "standard" => Ok(Self::Standard),
            "expanded" | "unified" => Ok(Self::Expanded),
            _ => Err(format!("unknown memory policy '{s}'. Use: standard, expanded")),
        }
    }
}

/// Profiling instrumentation wrapped around the workload command.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "snake_case")]
pub enum ProfilingTool {
    #[cfg_attr(feature = "clap", value(name = "perf_stat", alias = "perf-stat"))]
    PerfStat,
    #[cfg_attr(feature = "clap", value(name = "perf_record", alias = "perf-record"))]
    PerfRecord,
    #[cfg_attr(feature = "clap", value(name = "nsys"))]
    Nsys,
    #[cfg_attr(feature = "clap", value(name = "uprof"))]
    Uprof,
    #[cfg_attr(feature = "clap", value(name = "memory_peak", alias = "memory-peak"))]
    MemoryPeak,
}

impl ProfilingTool {
    pub const ALL: [Self; 5] = [
        Self::PerfStat,
        Self::PerfRecord,
        Self::Nsys,
        Self::Uprof,
        Self::MemoryPeak,
    ];

    /// Whether the tool samples the accelerator and so needs `--gpus`.
    #[must_use]
    pub fn needs_gpu(self) -> bool {
        matches!(self, Self::Nsys)
    }
}

impl std::fmt::Display for ProfilingTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PerfStat => write!(f, "perf_stat"),
            Self::PerfRecord => write!(f, "perf_record"),
            Self::Nsys => write!(f, "nsys"),
            Self::Uprof => write!(f, "uprof"),
            Self::MemoryPeak => write!(f, "memory_peak"),
        }
    }
}

impl std::str::FromStr for ProfilingTool {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "perf_stat" | "perf" => Ok(Self::PerfStat),
            "perf_record" => Ok(Self::PerfRecord),
            "nsys" => Ok(Self::Nsys),
            "uprof" => Ok(Self::Uprof),
            "memory_peak" | "time" => Ok(Self::MemoryPeak),
            _ => Err(format!(
                "unknown profiling tool '{s}'. Use: perf_stat, perf_record, nsys, uprof, memory_peak"
            )),
        }
    }
}

/// Why a run was made. Profiled runs carry instrumentation overhead and
/// are kept apart from plain timing runs in the ledger.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RunPurpose {
    #[default]
    Performance,
    Profiling,
}

impl RunPurpose {
    #[must_use]
    pub fn for_profiler(tool: Option<ProfilingTool>) -> Self {
        if tool.is_some() {
            Self::Profiling
        } else {
            Self::Performance
        }
    }
}

impl std::fmt::Display for RunPurpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Performance => write!(f, "performance"),
            Self::Profiling => write!(f, "profiling"),
        }
    }
}

impl std::str::FromStr for RunPurpose {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "performance" => Ok(Self::Performance),
            "profiling" => Ok(Self::Profiling),
            _ => Err(format!("unknown run purpose '{s}'. Use: performance, profiling")),
        }
    }
}

/// An ordered list of thread counts to sweep over.
///
/// Accepts a single value (`"8"`), a space separated list (`"4 8 16"`) or a
/// comma separated one (`"4,8,16"`). Zero is rejected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ThreadCounts(pub Vec<NonZeroU32>);

impl ThreadCounts {
    /// A list holding one thread count.
    #[must_use]
    pub fn single(threads: NonZeroU32) -> Self {
        Self(vec![threads])
    }

    pub fn iter(&self) -> impl Iterator<Item = NonZeroU32> + '_ {
        self.0.iter().copied()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Concatenate several lists, e.g. from a repeated `-t` flag.
    #[must_use]
    pub fn concat(lists: impl IntoIterator<Item = Self>) -> Self {
        Self(lists.into_iter().flat_map(|l| l.0).collect())
    }
}

impl Default for ThreadCounts {
    fn default() -> Self {
        Self([4, 8, 16].into_iter().filter_map(NonZeroU32::new).collect())
    }
}

impl std::str::FromStr for ThreadCounts {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut counts = Vec::new();
        for part in s.split(|c: char| c.is_whitespace() || c == ',') {
            if part.is_empty() {
                continue;
            }
            let n: u32 = part
                .parse()
                .map_err(|_| format!("invalid thread count '{part}'"))?;
            let n = NonZeroU32::new(n).ok_or_else(|| "thread count must be at least 1".to_string())?;
            counts.push(n);
        }
        if counts.is_empty() {
            return Err("empty thread count list".to_string());
        }
        Ok(Self(counts))
    }
}

impl std::fmt::Display for ThreadCounts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "{}", parts.join(" "))
    }
}

impl Serialize for ThreadCounts {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let raw: Vec<u32> = self.0.iter().map(|n| n.get()).collect();
        raw.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ThreadCounts {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            List(Vec<u32>),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::List(values) => {
                let counts = values
                    .into_iter()
                    .map(|n| {
                        NonZeroU32::new(n).ok_or_else(|| {
                            serde::de::Error::custom("thread count must be at least 1")
                        })
                    })
                    .collect::<Result<Vec<_>, D::Error>>()?;
                if counts.is_empty() {
                    return Err(serde::de::Error::custom("empty thread count list"));
                }
                Ok(Self(counts))
            }
            Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
        }
    }
}
