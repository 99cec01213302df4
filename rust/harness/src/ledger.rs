//! Append-only CSV ledger of benchmark results.
//!
//! The file starts with a `#` comment naming the schema version, then a
//! header row. Later schema versions only ever append columns, and readers
//! map fields by header name so older files keep loading.

use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::{Path, PathBuf},
};

use afbench_config::{MemoryPolicy, RunPurpose, Stage};
use fs2::FileExt;
use serde::Serialize;

pub const SCHEMA_VERSION: u32 = 2;

/// Column order of the current schema.
pub const COLUMNS: [&str; 16] = [
    "experiment_id",
    "system_name",
    "timestamp",
    "input_file",
    "stage",
    "threads",
    "duration_sec",
    "status",
    "run_purpose",
    "config_hash",
    "profiling_flags",
    "run_metadata",
    "iteration",
    "memory_policy",
    "sequence_count",
    "peak_rss_kb",
];

/// Final status of a sweep cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    #[default]
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "success" | "completed" => Ok(Self::Success),
            "failed" | "failure" | "error" | "timeout" => Ok(Self::Failed),
            _ => Err(format!("unknown run status: {s}")),
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ResultRecord {
    pub experiment_id: String,
    pub system_name: String,
    pub timestamp: String,
    pub input_file: String,
    pub stage: Stage,
    pub threads: u32,
    pub duration_sec: f64,
    pub status: RunStatus,
    pub run_purpose: RunPurpose,
    pub config_hash: String,
    /// Profiling tool name, empty for plain timing runs.
    pub profiling_flags: String,
    /// JSON object text.
    pub run_metadata: String,
    pub iteration: u32,
    pub memory_policy: MemoryPolicy,
    pub sequence_count: u64,
    pub peak_rss_kb: u64,
}

impl ResultRecord {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Success
    }

    fn fields(&self) -> [String; 16] {
        [
            self.experiment_id.clone(),
            self.system_name.clone(),
            self.timestamp.clone(),
            self.input_file.clone(),
            self.stage.to_string(),
            self.threads.to_string(),
            self.duration_sec.to_string(),
            self.status.to_string(),
            self.run_purpose.to_string(),
            self.config_hash.clone(),
            self.profiling_flags.clone(),
            self.run_metadata.clone(),
            self.iteration.to_string(),
            self.memory_policy.to_string(),
            self.sequence_count.to_string(),
            self.peak_rss_kb.to_string(),
        ]
    }

    /// The row as one CSV line, newline included.
    #[must_use]
    pub fn to_csv_line(&self) -> String {
        let mut line = self
            .fields()
            .iter()
            .map(|f| quote(f))
            .collect::<Vec<_>>()
            .join(",");
        line.push('\n');
        line
    }

    /// Build a record from a header and a row. Missing columns keep defaults.
    fn from_row(header: &[String], row: &[String]) -> Result<Self, String> {
        let mut record = Self::default();
        for (name, value) in header.iter().zip(row) {
            match name.as_str() {
                "experiment_id" => record.experiment_id.clone_from(value),
                "system_name" => record.system_name.clone_from(value),
                "timestamp" => record.timestamp.clone_from(value),
                "input_file" => record.input_file.clone_from(value),
                "stage" => record.stage = value.parse()?,
                "threads" => record.threads = parse_num(name, value)?,
                "duration_sec" => record.duration_sec = parse_num(name, value)?,
                "status" => record.status = value.parse()?,
                "run_purpose" => record.run_purpose = value.parse()?,
                "config_hash" => record.config_hash.clone_from(value),
                "profiling_flags" => record.profiling_flags.clone_from(value),
                "run_metadata" => record.run_metadata.clone_from(value),
                "iteration" => record.iteration = parse_num(name, value)?,
                "memory_policy" => record.memory_policy = value.parse()?,
                "sequence_count" => record.sequence_count = parse_num(name, value)?,
                "peak_rss_kb" => record.peak_rss_kb = parse_num(name, value)?,
                _ => {}
            }
        }
        Ok(record)
    }
}

fn parse_num<T: std::str::FromStr + Default>(name: &str, value: &str) -> Result<T, String> {
    if value.is_empty() {
        return Ok(T::default());
    }
    value
        .parse()
        .map_err(|_| format!("invalid {name}: {value:?}"))
}

/// Quote a field if it contains a delimiter, quote or line break, or if it
/// starts with `#` and would read back as a comment line.
fn quote(field: &str) -> String {
    if field.contains([',', '"', '\r', '\n']) || field.starts_with('#') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// Split CSV text into rows, honouring quoted fields with embedded line
/// breaks. Lines starting with `#` outside quotes are skipped.
fn parse_csv(text: &str) -> Vec<Vec<String>> {
    let mut rows = Vec::new();
    let mut row = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    let mut at_row_start = true;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if at_row_start && c == '#' {
            for c in chars.by_ref() {
                if c == '\n' {
                    break;
                }
            }
            continue;
        }
        at_row_start = false;
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    field.push('"');
                    chars.next();
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' => in_quotes = true,
            ',' => row.push(std::mem::take(&mut field)),
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                row.push(std::mem::take(&mut field));
                rows.push(std::mem::take(&mut row));
                at_row_start = true;
            }
            _ => field.push(c),
        }
    }
    if !at_row_start {
        row.push(field);
        rows.push(row);
    }
    rows.retain(|r| !(r.len() == 1 && r[0].is_empty()));
    rows
}

fn header_line() -> String {
    format!(
        "# afbench results schema v{SCHEMA_VERSION}\n{}\n",
        COLUMNS.join(",")
    )
}

/// The append-only results file.
pub struct Ledger {
    path: PathBuf,
}

impl Ledger {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record under an exclusive lock.
    ///
    /// Writes the header into an empty file. An existing file whose header
    /// differs from the current schema is left untouched.
    pub fn append(&self, record: &ResultRecord) -> Result<(), LedgerError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| LedgerError::Io(parent.to_path_buf(), e))?;
        }

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(&self.path)
            .map_err(|e| LedgerError::Io(self.path.clone(), e))?;
        FileExt::lock_exclusive(&file)
            .map_err(|e| LedgerError::Lock(self.path.clone(), e))?;

        let result = self.append_locked(&file, record);

        FileExt::unlock(&file)
            .map_err(|e| LedgerError::Lock(self.path.clone(), e))?;
        result
    }

    fn append_locked(&self, file: &File, record: &ResultRecord) -> Result<(), LedgerError> {
        let len = file
            .metadata()
            .map_err(|e| LedgerError::Io(self.path.clone(), e))?
            .len();
        let mut out = String::new();
        if len == 0 {
            out.push_str(&header_line());
        } else {
            let found = Self::read_header(file).map_err(|e| LedgerError::Io(self.path.clone(), e))?;
            let expected = COLUMNS.join(",");
            if found.as_deref() != Some(expected.as_str()) {
                return Err(LedgerError::SchemaMismatch {
                    path: self.path.clone(),
                    found: found.unwrap_or_default(),
                });
            }
        }
        out.push_str(&record.to_csv_line());

        let mut writer = file;
        writer
            .write_all(out.as_bytes())
            .map_err(|e| LedgerError::Io(self.path.clone(), e))?;
        writer
            .flush()
            .map_err(|e| LedgerError::Io(self.path.clone(), e))
    }

    /// First non-comment line.
    fn read_header(file: &File) -> std::io::Result<Option<String>> {
        for line in BufReader::new(file).lines() {
            let line = line?;
            if !line.starts_with('#') {
                return Ok(Some(line.trim_end_matches('\r').to_string()));
            }
        }
        Ok(None)
    }

    /// Read every record. A missing file is an empty ledger.
    ///
    /// Rows that cannot be interpreted are skipped with a warning.
    pub fn read(&self) -> Result<Vec<ResultRecord>, LedgerError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(&self.path).map_err(|e| LedgerError::Io(self.path.clone(), e))?;
        FileExt::lock_shared(&file)
            .map_err(|e| LedgerError::Lock(self.path.clone(), e))?;
        let text = std::fs::read_to_string(&self.path);
        FileExt::unlock(&file)
            .map_err(|e| LedgerError::Lock(self.path.clone(), e))?;
        let text = text.map_err(|e| LedgerError::Io(self.path.clone(), e))?;

        let mut rows = parse_csv(&text).into_iter();
        let Some(header) = rows.next() else {
            return Ok(Vec::new());
        };
        let mut records = Vec::new();
        for (i, row) in rows.enumerate() {
            match ResultRecord::from_row(&header, &row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping ledger row {}: {e}", i + 1),
            }
        }
        Ok(records)
    }

    /// The last `n` records.
    pub fn recent(&self, n: usize) -> Result<Vec<ResultRecord>, LedgerError> {
        let mut records = self.read()?;
        let skip = records.len().saturating_sub(n);
        Ok(records.split_off(skip))
    }
}

/// Records as standalone CSV: header row plus one line per record.
#[must_use]
pub fn export_csv(records: &[ResultRecord]) -> String {
    let mut out = COLUMNS.join(",");
    out.push('\n');
    for record in records {
        out.push_str(&record.to_csv_line());
    }
    out
}

/// Records as a JSON array. `run_metadata` is embedded as an object when it
/// parses, otherwise kept as text.
pub fn export_json(records: &[ResultRecord]) -> serde_json::Result<String> {
    let mut rows = Vec::with_capacity(records.len());
    for record in records {
        let mut row = serde_json::to_value(record)?;
        if let Ok(metadata) = serde_json::from_str::<serde_json::Value>(&record.run_metadata) {
            row["run_metadata"] = metadata;
        }
        rows.push(row);
    }
    serde_json::to_string_pretty(&rows)
}

/// Issues experiment ids from millisecond timestamps that never repeat.
#[derive(Debug, Default)]
pub struct ExperimentIdGenerator {
    last_ms: i64,
}

impl ExperimentIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `{system}_{workload}_{ms}`.
    pub fn next(&mut self, system: &str, workload: &str) -> String {
        self.next_at(system, workload, chrono::Utc::now().timestamp_millis())
    }

    fn next_at(&mut self, system: &str, workload: &str, now_ms: i64) -> String {
        let ms = if now_ms > self.last_ms {
            now_ms
        } else {
            self.last_ms + 1
        };
        self.last_ms = ms;
        format!("{system}_{workload}_{ms}")
    }
}

/// Timestamp format used in ledger rows.
#[must_use]
pub fn now_timestamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Errors that can occur when reading or writing the ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, std::io::Error),
    #[error("failed to lock {0}: {1}")]
    Lock(PathBuf, std::io::Error),
    #[error("{path} has an incompatible header ({found:?}); move it aside to start a new ledger")]
    SchemaMismatch { path: PathBuf, found: String },
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use tempfile::tempdir;

    use super::*;

    fn record(id: &str, metadata: &str) -> ResultRecord {
        ResultRecord {
            experiment_id: id.to_string(),
            system_name: "dgx".to_string(),
            timestamp: "2026-01-02 03:04:05".to_string(),
            input_file: "promo_data.json".to_string(),
            stage: Stage::Predict,
            threads: 8,
            duration_sec: 123.456,
            status: RunStatus::Success,
            run_purpose: RunPurpose::Performance,
            config_hash: "abcdef012345".to_string(),
            profiling_flags: String::new(),
            run_metadata: metadata.to_string(),
            iteration: 2,
            memory_policy: MemoryPolicy::Expanded,
            sequence_count: 4,
            peak_rss_kb: 0,
        }
    }

    #[test]
    fn test_roundtrip_with_delimiters() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("results/master_results.csv"));
        let nasty = "{\"note\":\"a, b\",\"quote\":\"say \\\"hi\\\"\",\"multi\":\"line1\nline2\",\"cr\":\"x\r\ny\"}";
        let records = vec![
            record("dgx_promo_1", nasty),
            record("dgx_promo_2", "{}"),
            ResultRecord {
                status: RunStatus::Failed,
                stage: Stage::Prepare,
                input_file: "comma,name.json".to_string(),
                ..record("dgx_promo_3", "{\"failure_kind\":\"timeout\"}")
            },
        ];
        for r in &records {
            ledger.append(r).unwrap();
        }
        assert_eq!(ledger.read().unwrap(), records);

        let text = std::fs::read_to_string(ledger.path()).unwrap();
        assert!(text.starts_with("# afbench results schema v2\nexperiment_id,"));
        assert_eq!(text.matches("experiment_id,system_name").count(), 1);
    }

    #[test]
    fn test_missing_ledger_is_empty() {
        let ledger = Ledger::new("/nonexistent/afbench/ledger.csv");
        assert!(ledger.read().unwrap().is_empty());
    }

    #[test]
    fn test_reads_legacy_twelve_columns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.csv");
        std::fs::write(
            &path,
            "# legacy\n\
experiment_id,system_name,timestamp,input_file,stage,threads,duration_sec,status,run_purpose,config_hash,profiling_flags,run_metadata\n\
sys_a_1,sys,2024-01-01 00:00:00,a.json,msa,4,10.5,success,performance,h,,\"{\"\"k\"\": 1}\"\n",
        )
        .unwrap();
        let records = Ledger::new(&path).read().unwrap();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.stage, Stage::Prepare);
        assert_eq!(r.threads, 4);
        assert!((r.duration_sec - 10.5).abs() < 1e-9);
        assert_eq!(r.run_metadata, "{\"k\": 1}");
        assert_eq!(r.memory_policy, MemoryPolicy::Standard);
        assert_eq!(r.sequence_count, 0);
    }

    #[test]
    fn test_append_refuses_other_schema() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.csv");
        let original = "experiment_id,system_name,timestamp\nx,y,z\n";
        std::fs::write(&path, original).unwrap();
        let err = Ledger::new(&path).append(&record("id", "{}")).unwrap_err();
        assert!(matches!(err, LedgerError::SchemaMismatch { .. }));
        assert_eq!(std::fs::read_to_string(&path).unwrap(), original);
    }

    #[test]
    fn test_malformed_rows_skipped() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("l.csv"));
        ledger.append(&record("good", "{}")).unwrap();
        let mut text = std::fs::read_to_string(ledger.path()).unwrap();
        text.push_str("bad,sys,ts,f.json,predict,notanumber,1,success,performance,h,,{},0,standard,0,0\n");
        std::fs::write(ledger.path(), text).unwrap();
        let records = ledger.read().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].experiment_id, "good");
    }

    #[test]
    fn test_recent() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("l.csv"));
        for i in 0..5 {
            ledger.append(&record(&format!("id{i}"), "{}")).unwrap();
        }
        let recent = ledger.recent(2).unwrap();
        let ids: Vec<_> = recent.iter().map(|r| r.experiment_id.as_str()).collect();
        assert_eq!(ids, ["id3", "id4"]);
        assert_eq!(ledger.recent(10).unwrap().len(), 5);
    }

    #[test]
    fn test_quote() {
        assert_eq!(quote("plain"), "plain");
        assert_eq!(quote("a,b"), "\"a,b\"");
        assert_eq!(quote("say \"x\""), "\"say \"\"x\"\"\"");
        assert_eq!(quote("a\nb"), "\"a\nb\"");
        assert_eq!(quote("#lab"), "\"#lab\"");
        assert_eq!(quote("lab#1"), "lab#1");
    }

    #[test]
    fn test_roundtrip_leading_hash() {
        let dir = tempdir().unwrap();
        let ledger = Ledger::new(dir.path().join("l.csv"));
        let records = vec![
            ResultRecord {
                system_name: "#lab".to_string(),
                ..record("#lab_w_1", "{}")
            },
            record("after", "{}"),
        ];
        for r in &records {
            ledger.append(r).unwrap();
        }
        assert_eq!(ledger.read().unwrap(), records);
    }

    #[test]
    fn test_export() {
        let records = vec![
            record("a", "{\"failure_kind\":\"none\"}"),
            record("b", "not json"),
        ];
        let csv = export_csv(&records);
        assert!(csv.starts_with("experiment_id,system_name,"));
        assert_eq!(csv.lines().count(), 3);
        assert_eq!(parse_csv(&csv).len(), 3);

        let json: serde_json::Value = serde_json::from_str(&export_json(&records).unwrap()).unwrap();
        assert_eq!(json[0]["experiment_id"], "a");
        assert_eq!(json[0]["stage"], "predict");
        assert_eq!(json[0]["status"], "success");
        assert_eq!(json[0]["memory_policy"], "expanded");
        assert_eq!(json[0]["run_metadata"]["failure_kind"], "none");
        assert_eq!(json[1]["run_metadata"], "not json");
    }

    #[test]
    fn test_experiment_ids_unique_and_monotonic() {
        let mut ids = ExperimentIdGenerator::new();
        let a = ids.next_at("sys", "w", 1_000);
        let b = ids.next_at("sys", "w", 1_000);
        let c = ids.next_at("sys", "w", 999);
        let d = ids.next_at("sys", "w", 5_000);
        assert_eq!(a, "sys_w_1000");
        assert_eq!(b, "sys_w_1001");
        assert_eq!(c, "sys_w_1002");
        assert_eq!(d, "sys_w_5000");

        let mut live = ExperimentIdGenerator::new();
        let issued: HashSet<_> = (0..1000).map(|_| live.next("sys", "w")).collect();
        assert_eq!(issued.len(), 1000);
    }
}
