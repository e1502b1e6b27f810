use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

/// Stage log semantics - defines file layout only, not pipeline logic.
/// Keeps the worker, the merge engine and the CLI agreeing on where every
/// stage's records live: `{results_dir}/{stage}/{task_name}.ndjson`.

pub const MERGED_DIR: &str = "merged";
pub const MERGED_FILE: &str = "merged_results.ndjson";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    Generation,
    Execution,
    TestResults,
    StaticAnalysis,
    Hallucination,
}

impl Stage {
    /// Directory name, also used as the field prefix on merge collisions.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Stage::Generation => "generation",
            Stage::Execution => "execution",
            Stage::TestResults => "test_results",
            Stage::StaticAnalysis => "static_analysis",
            Stage::Hallucination => "hallucination",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Deterministic log path for a (stage, task) pair
pub fn stage_log_path(results_dir: &Path, stage: Stage, task_name: &str) -> PathBuf {
    results_dir.join(stage.dir_name()).join(format!("{}.ndjson", task_name))
}

pub fn merged_path(results_dir: &Path) -> PathBuf {
    results_dir.join(MERGED_DIR).join(MERGED_FILE)
}

/// Append-only writer for one stage.
///
/// Appends are serialized by an async mutex and each record is written as a
/// single complete line, so concurrent candidates never interleave output.
pub struct StageRecorder {
    results_dir: PathBuf,
    stage: Stage,
    lock: Mutex<()>,
}

impl StageRecorder {
    pub fn new(results_dir: impl Into<PathBuf>, stage: Stage) -> Self {
        Self {
            results_dir: results_dir.into(),
            stage,
            lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, task_name: &str) -> PathBuf {
        stage_log_path(&self.results_dir, self.stage, task_name)
    }

    pub async fn append<T: Serialize>(&self, task_name: &str, record: &T) -> Result<()> {
        let mut line = serde_json::to_string(record)
            .with_context(|| format!("Failed to serialize {} record", self.stage))?;
        line.push('\n');

        let path = self.path_for(task_name);
        let _guard = self.lock.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("Failed to append to {}", path.display()))?;
        file.flush().await?;
        Ok(())
    }
}

/// One recorder per pipeline stage, sharing a results directory.
pub struct Recorders {
    pub generation: StageRecorder,
    pub execution: StageRecorder,
    pub test_results: StageRecorder,
    pub static_analysis: StageRecorder,
    pub hallucination: StageRecorder,
}

impl Recorders {
    pub fn new(results_dir: &Path) -> Self {
        Self {
            generation: StageRecorder::new(results_dir, Stage::Generation),
            execution: StageRecorder::new(results_dir, Stage::Execution),
            test_results: StageRecorder::new(results_dir, Stage::TestResults),
            static_analysis: StageRecorder::new(results_dir, Stage::StaticAnalysis),
            hallucination: StageRecorder::new(results_dir, Stage::Hallucination),
        }
    }
}

/// Read every line of an NDJSON log as a JSON object, in file order.
///
/// A missing file is an empty stream. Lines that are not JSON objects are
/// skipped with a warning so one torn line cannot hide the rest of the log.
pub fn read_rows(path: &Path) -> Result<Vec<Map<String, Value>>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let file = fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut rows = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(&line) {
            Ok(Value::Object(map)) => rows.push(map),
            Ok(_) => warn!(path = %path.display(), line = idx + 1, "Skipping non-object log line"),
            Err(e) => warn!(path = %path.display(), line = idx + 1, error = %e, "Skipping invalid JSON line"),
        }
    }
    Ok(rows)
}

/// Typed variant of [`read_rows`]; rows that do not fit `T` are skipped with a warning.
pub fn read_records<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut out = Vec::new();
    for row in read_rows(path)? {
        match serde_json::from_value::<T>(Value::Object(row)) {
            Ok(record) => out.push(record),
            Err(e) => warn!(path = %path.display(), error = %e, "Skipping malformed record"),
        }
    }
    Ok(out)
}

/// Write `rows` as NDJSON, replacing any previous file.
pub fn write_ndjson<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let file = fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for row in rows {
        serde_json::to_writer(&mut writer, row)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_stage_log_naming() {
        let root = Path::new("results");
        assert_eq!(
            stage_log_path(root, Stage::TestResults, "task_2"),
            PathBuf::from("results/test_results/task_2.ndjson")
        );
        assert_eq!(
            stage_log_path(root, Stage::StaticAnalysis, "task_1"),
            PathBuf::from("results/static_analysis/task_1.ndjson")
        );
        assert_eq!(merged_path(root), PathBuf::from("results/merged/merged_results.ndjson"));
    }

    #[test]
    fn test_missing_log_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let rows = read_rows(&dir.path().join("nope.ndjson")).unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn test_bad_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.ndjson");
        fs::write(&path, "{\"task_id\":\"a\"}\nnot json\n[1,2]\n\n{\"task_id\":\"b\"}\n").unwrap();
        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1]["task_id"], "b");
    }

    #[tokio::test]
    async fn test_concurrent_appends_stay_line_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(StageRecorder::new(dir.path(), Stage::Execution));

        let mut handles = Vec::new();
        for i in 0..32 {
            let recorder = Arc::clone(&recorder);
            handles.push(tokio::spawn(async move {
                let record = json!({"task_id": format!("id_{}", i), "payload": "x".repeat(4096)});
                recorder.append("task_1", &record).await.unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        let rows = read_rows(&recorder.path_for("task_1")).unwrap();
        assert_eq!(rows.len(), 32);
        assert!(rows.iter().all(|r| r["payload"].as_str().unwrap().len() == 4096));
    }

    #[test]
    fn test_write_ndjson_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/merged.ndjson");
        write_ndjson(&path, &[json!({"a": 1}), json!({"a": 2})]).unwrap();
        write_ndjson(&path, &[json!({"a": 3})]).unwrap();
        let rows = read_rows(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["a"], 3);
    }
}
