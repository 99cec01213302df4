//! Artifact-based success detection and log metric extraction.
//!
//! Success is decided by the presence of the stage's completion artifact,
//! never by the log. Metrics scraped from the log are best effort: anything
//! missing is reported as 0 with a warning.

use std::path::{Path, PathBuf};

use afbench_config::Stage;
use walkdir::WalkDir;

/// How deep below the output directory artifacts are searched for.
const MAX_ARTIFACT_DEPTH: usize = 3;

/// Metrics extracted from one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkloadMetrics {
    /// The stage's completion artifact, if found.
    pub artifact: Option<PathBuf>,
    pub sequence_count: u64,
    pub peak_rss_kb: u64,
    pub seeds_run: u64,
}

impl WorkloadMetrics {
    #[must_use]
    pub fn completed(&self) -> bool {
        self.artifact.is_some()
    }
}

/// Parse the artifacts in `output_dir` and the run `log`.
#[must_use]
pub fn parse(stage: Stage, output_dir: &Path, log: &str) -> WorkloadMetrics {
    let artifact = find_artifact(stage, output_dir);
    if artifact.is_none() {
        tracing::debug!(
            "No {stage} completion artifact under {}",
            output_dir.display()
        );
    }

    let sequence_count = sequence_count(log).unwrap_or_else(|| {
        tracing::warn!("Sequence count not found in log of {}", output_dir.display());
        0
    });
    let peak_rss_kb = last_number_after(log, "Maximum resident set size (kbytes):").unwrap_or(0);
    let seeds_run = count_lines(log, &["Running model inference with seed"]);

    WorkloadMetrics {
        artifact,
        sequence_count,
        peak_rss_kb,
        seeds_run,
    }
}

/// File name suffix marking a completed stage.
fn artifact_suffix(stage: Stage) -> &'static str {
    match stage {
        Stage::Prepare => "_data.json",
        Stage::Predict => "_model.cif",
    }
}

fn find_artifact(stage: Stage, output_dir: &Path) -> Option<PathBuf> {
    let suffix = artifact_suffix(stage);
    WalkDir::new(output_dir)
        .max_depth(MAX_ARTIFACT_DEPTH)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .find(|entry| {
            entry.file_type().is_file() && entry.file_name().to_string_lossy().ends_with(suffix)
        })
        .map(walkdir::DirEntry::into_path)
}

/// Sequence count, first matching rule wins:
/// last `Total sequences: N`, then last `Found N sequences`, then the number
/// of per-sequence MSA lines.
fn sequence_count(log: &str) -> Option<u64> {
    if let Some(n) = last_number_after(log, "Total sequences:") {
        return Some(n);
    }
    if let Some(n) = log.lines().rev().find_map(found_n_sequences) {
        return Some(n);
    }
    let per_sequence = count_lines(
        log,
        &[
            "Getting protein MSAs for sequence",
            "Getting RNA MSAs for sequence",
        ],
    );
    (per_sequence > 0).then_some(per_sequence)
}

fn found_n_sequences(line: &str) -> Option<u64> {
    let idx = line.find("Found ")?;
    let rest = &line[idx + "Found ".len()..];
    let (number, tail) = rest.split_once(' ')?;
    if !tail.starts_with("sequences") {
        return None;
    }
    number.parse().ok()
}

/// The integer following `key` on the last line containing it.
fn last_number_after(log: &str, key: &str) -> Option<u64> {
    log.lines().rev().find_map(|line| {
        let idx = line.find(key)?;
        line[idx + key.len()..]
            .trim_start()
            .split(|c: char| !c.is_ascii_digit())
            .next()?
            .parse()
            .ok()
    })
}

fn count_lines(log: &str, needles: &[&str]) -> u64 {
    log.lines()
        .filter(|line| needles.iter().any(|n| line.contains(n)))
        .count() as u64
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test_case("Total sequences: 12\nFound 3 sequences\n", Some(12) ; "total wins")]
    #[test_case("Total sequences: 2\nfoo\nTotal sequences: 5\n", Some(5) ; "last total")]
    #[test_case("Found 3 sequences in chain A\nFound 7 sequences in chain B\n", Some(7) ; "last found")]
    #[test_case("Getting protein MSAs for sequence A\nGetting RNA MSAs for sequence B\nGetting protein MSAs for sequence C\n", Some(3) ; "counted")]
    #[test_case("Found 2 sequences\nGetting protein MSAs for sequence A\n", Some(2) ; "found before count")]
    #[test_case("nothing useful\n", None ; "absent")]
    #[test_case("Found many sequences\n", None ; "non numeric")]
    fn test_sequence_count(log: &str, expected: Option<u64>) {
        assert_eq!(sequence_count(log), expected);
    }

    #[test]
    fn test_peak_rss_and_seeds() {
        let log = "\
Running model inference with seed 1
Running model inference with seed 2
\tMaximum resident set size (kbytes): 123456
";
        let dir = tempfile::tempdir().unwrap();
        let metrics = parse(Stage::Predict, dir.path(), log);
        assert_eq!(metrics.peak_rss_kb, 123_456);
        assert_eq!(metrics.seeds_run, 2);
        assert_eq!(metrics.sequence_count, 0);
        assert!(!metrics.completed());
    }

    #[test]
    fn test_artifact_detection() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("promo/seed-1_sample-0");
        std::fs::create_dir_all(&nested).unwrap();

        std::fs::write(dir.path().join("promo/promo_data.json"), "{}").unwrap();
        assert!(parse(Stage::Prepare, dir.path(), "").completed());
        assert!(!parse(Stage::Predict, dir.path(), "").completed());

        std::fs::write(dir.path().join("promo/promo_model.cif"), "").unwrap();
        let metrics = parse(Stage::Predict, dir.path(), "");
        assert_eq!(
            metrics.artifact.as_deref(),
            Some(dir.path().join("promo/promo_model.cif").as_path())
        );
    }

    #[test]
    fn test_artifact_depth_limit() {
        let dir = tempfile::tempdir().unwrap();
        let deep = dir.path().join("a/b/c/d");
        std::fs::create_dir_all(&deep).unwrap();
        std::fs::write(deep.join("x_model.cif"), "").unwrap();
        assert!(!parse(Stage::Predict, dir.path(), "").completed());
    }

    #[test]
    fn test_missing_output_dir() {
        let metrics = parse(Stage::Prepare, Path::new("/nonexistent/afbench"), "");
        assert!(!metrics.completed());
    }
}
