//! Descriptive statistics over ledger records.

use std::{
    collections::BTreeMap,
    fmt::Write as _,
    path::{Path, PathBuf},
};

use afbench_config::Stage;

use crate::ledger::ResultRecord;

/// Record fields that can be grouped on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum GroupField {
    Stage,
    InputFile,
    Threads,
}

/// Grouping used by the summary report.
pub const DEFAULT_GROUPING: [GroupField; 3] =
    [GroupField::Stage, GroupField::InputFile, GroupField::Threads];

/// Grouping key of the aggregate. Fields not grouped on are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupKey {
    pub stage: Option<Stage>,
    pub input_file: Option<String>,
    pub threads: Option<u32>,
}

impl GroupKey {
    fn of(record: &ResultRecord, fields: &[GroupField]) -> Self {
        let mut key = Self::default();
        for field in fields {
            match field {
                GroupField::Stage => key.stage = Some(record.stage),
                GroupField::InputFile => key.input_file = Some(record.input_file.clone()),
                GroupField::Threads => key.threads = Some(record.threads),
            }
        }
        key
    }

    fn input_label(&self) -> &str {
        self.input_file.as_deref().unwrap_or("*")
    }

    fn threads_label(&self) -> String {
        self.threads.map_or_else(|| "*".to_string(), |t| t.to_string())
    }

    fn stage_label(&self) -> String {
        self.stage.map_or_else(|| "all stages".to_string(), |s| s.to_string())
    }
}

/// Two-sided 95% quantile of the standard normal distribution.
const Z_95: f64 = 1.96;

pub const DETAILED_STATISTICS_FILE: &str = "detailed_statistics.csv";
pub const STATISTICAL_REPORT_FILE: &str = "statistical_report.txt";

/// Statistics over successful durations (seconds).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Descriptive {
    pub count: usize,
    pub mean: f64,
    /// Population standard deviation.
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub median: f64,
    pub range: f64,
    /// Coefficient of variation in percent, 0 when the mean is 0.
    pub cv: f64,
    /// Half-width of the normal-approximation 95% confidence interval of
    /// the mean.
    pub ci95: f64,
}

impl Descriptive {
    #[must_use]
    pub fn ci95_bounds(&self) -> (f64, f64) {
        (self.mean - self.ci95, self.mean + self.ci95)
    }
}

/// A group's durations, or nothing when no run succeeded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Summary {
    Stats(Descriptive),
    NoData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupStats {
    pub key: GroupKey,
    pub succeeded: usize,
    pub failed: usize,
    pub summary: Summary,
}

/// Describe a sample. `None` for an empty one.
#[must_use]
pub fn describe(values: &[f64]) -> Option<Descriptive> {
    if values.is_empty() {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();

    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let min = sorted[0];
    let max = sorted[sorted.len() - 1];
    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };
    let cv = if mean == 0.0 { 0.0 } else { std / mean * 100.0 };
    let ci95 = Z_95 * std / n.sqrt();

    Some(Descriptive {
        count: values.len(),
        mean,
        std,
        min,
        max,
        median,
        range: max - min,
        cv,
        ci95,
    })
}

/// Group records by (stage, input file, threads) and describe each group.
#[must_use]
pub fn aggregate(records: &[ResultRecord]) -> Vec<GroupStats> {
    aggregate_by(records, &DEFAULT_GROUPING)
}

/// Group records by `fields` and describe each group.
///
/// Only successful runs contribute durations; failed runs are counted.
#[must_use]
pub fn aggregate_by(records: &[ResultRecord], fields: &[GroupField]) -> Vec<GroupStats> {
    let mut groups: BTreeMap<GroupKey, (Vec<f64>, usize)> = BTreeMap::new();
    for record in records {
        let entry = groups.entry(GroupKey::of(record, fields)).or_default();
        if record.is_success() {
            entry.0.push(record.duration_sec);
        } else {
            entry.1 += 1;
        }
    }

    groups
        .into_iter()
        .map(|(key, (durations, failed))| GroupStats {
            key,
            succeeded: durations.len(),
            failed,
            summary: describe(&durations).map_or(Summary::NoData, Summary::Stats),
        })
        .collect()
}

/// Human-readable report: one table per stage plus stability extremes.
#[must_use]
pub fn render_report(groups: &[GroupStats]) -> String {
    let mut out = String::new();
    if groups.is_empty() {
        out.push_str("No results recorded.\n");
        return out;
    }

    let succeeded: usize = groups.iter().map(|g| g.succeeded).sum();
    let failed: usize = groups.iter().map(|g| g.failed).sum();
    let _ = writeln!(
        out,
        "Total runs: {} ({succeeded} succeeded, {failed} failed)",
        succeeded + failed
    );

    let mut stages: Vec<Option<Stage>> = groups.iter().map(|g| g.key.stage).collect();
    stages.dedup();
    for stage in stages {
        let label = GroupKey {
            stage,
            ..GroupKey::default()
        }
        .stage_label();
        let _ = writeln!(out, "\n== {label} ==");
        let in_stage: Vec<&GroupStats> = groups.iter().filter(|g| g.key.stage == stage).collect();
        let cvs: Vec<f64> = in_stage
            .iter()
            .filter_map(|g| match g.summary {
                Summary::Stats(s) => Some(s.cv),
                Summary::NoData => None,
            })
            .collect();
        let _ = writeln!(out, "Configurations tested: {}", in_stage.len());
        if !cvs.is_empty() {
            let avg = cvs.iter().sum::<f64>() / cvs.len() as f64;
            let best = cvs.iter().copied().fold(f64::INFINITY, f64::min);
            let worst = cvs.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            let _ = writeln!(
                out,
                "Average CV: {avg:.2}% (best {best:.2}%, worst {worst:.2}%)"
            );
        }
        let _ = writeln!(
            out,
            "{:<32} {:>7} {:>10} {:>9} {:>10} {:>10} {:>9} {:>5} {:>7}",
            "input_file", "threads", "mean(s)", "std(s)", "min(s)", "max(s)", "ci95(s)", "runs", "cv(%)"
        );
        for group in in_stage {
            match group.summary {
                Summary::Stats(s) => {
                    let _ = writeln!(
                        out,
                        "{:<32} {:>7} {:>10.2} {:>9.2} {:>10.2} {:>10.2} {:>9.2} {:>5} {:>7.2}",
                        group.key.input_label(),
                        group.key.threads_label(),
                        s.mean,
                        s.std,
                        s.min,
                        s.max,
                        s.ci95,
                        s.count,
                        s.cv
                    );
                }
                Summary::NoData => {
                    let _ = writeln!(
                        out,
                        "{:<32} {:>7} {:>10} {:>9} {:>10} {:>10} {:>9} {:>5} {:>7}",
                        group.key.input_label(),
                        group.key.threads_label(),
                        "-",
                        "-",
                        "-",
                        "-",
                        "-",
                        0,
                        "-"
                    );
                }
            }
            if group.failed > 0 {
                let _ = writeln!(out, "{:<32} ({} failed)", "", group.failed);
            }
        }
    }

    let with_stats: Vec<(&GroupStats, Descriptive)> = groups
        .iter()
        .filter_map(|g| match g.summary {
            Summary::Stats(s) => Some((g, s)),
            Summary::NoData => None,
        })
        .collect();
    let most = with_stats.iter().min_by(|a, b| a.1.cv.total_cmp(&b.1.cv));
    let least = with_stats.iter().max_by(|a, b| a.1.cv.total_cmp(&b.1.cv));
    if let (Some((most_g, most_s)), Some((least_g, least_s))) = (most, least) {
        out.push('\n');
        let _ = writeln!(
            out,
            "Most stable:  {} {} @ {} threads (CV {:.2}%)",
            most_g.key.stage_label(),
            most_g.key.input_label(),
            most_g.key.threads_label(),
            most_s.cv
        );
        let _ = writeln!(
            out,
            "Least stable: {} {} @ {} threads (CV {:.2}%)",
            least_g.key.stage_label(),
            least_g.key.input_label(),
            least_g.key.threads_label(),
            least_s.cv
        );
    }
    out
}

/// One row per group, for spreadsheets and plotting tools.
#[must_use]
pub fn detailed_csv(groups: &[GroupStats]) -> String {
    let mut out = String::from(
        "stage,input_file,threads,count,failed,mean,std,min,max,median,cv_percent,ci_95_lower,ci_95_upper,range_sec\n",
    );
    for group in groups {
        let key = &group.key;
        let stage = key.stage.map(|s| s.to_string()).unwrap_or_default();
        let input = key.input_file.as_deref().unwrap_or_default();
        let threads = key.threads.map(|t| t.to_string()).unwrap_or_default();
        let _ = write!(
            out,
            "{stage},{},{threads},{},{}",
            csv_field(input),
            group.succeeded,
            group.failed
        );
        match group.summary {
            Summary::Stats(s) => {
                let (lower, upper) = s.ci95_bounds();
                let _ = writeln!(
                    out,
                    ",{:.3},{:.3},{:.3},{:.3},{:.3},{:.2},{:.3},{:.3},{:.3}",
                    s.mean, s.std, s.min, s.max, s.median, s.cv, lower, upper, s.range
                );
            }
            Summary::NoData => out.push_str(",,,,,,,,,\n"),
        }
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// Files written by [`write_analysis`].
#[derive(Debug, Clone)]
pub struct AnalysisFiles {
    pub statistics: PathBuf,
    pub report: PathBuf,
}

/// Persist the per-group statistics and the text report under `dir`.
pub fn write_analysis(groups: &[GroupStats], dir: &Path) -> std::io::Result<AnalysisFiles> {
    std::fs::create_dir_all(dir)?;
    let statistics = dir.join(DETAILED_STATISTICS_FILE);
    std::fs::write(&statistics, detailed_csv(groups))?;

    let report = dir.join(STATISTICAL_REPORT_FILE);
    let text = format!(
        "afbench statistical report\nGenerated: {}\nConfigurations analyzed: {}\n\n{}",
        chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
        groups.len(),
        render_report(groups)
    );
    std::fs::write(&report, text)?;
    Ok(AnalysisFiles { statistics, report })
}
