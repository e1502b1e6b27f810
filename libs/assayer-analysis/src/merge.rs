//! Merge Engine: joins per-stage logs into one row per candidate identity.
//!
//! The generation log defines which candidates exist. Every other required
//! stage contributes exactly one winning row per candidate; a candidate missing
//! any of them is still emitted, marked `invalid`.

use anyhow::{bail, Result};
use assayer_common::store::{merged_path, read_rows, stage_log_path, write_ndjson, Stage};
use assayer_common::types::{numeric, CandidateId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub type Row = Map<String, Value>;

/// Stages joined onto the generation base, in merge order.
pub const REQUIRED_STAGES: [Stage; 3] = [Stage::Execution, Stage::StaticAnalysis, Stage::Hallucination];

/// Identity dimensions: never prefixed, must agree across stages.
pub const IDENTITY_FIELDS: [&str; 4] = ["language", "model", "completeness", "task_name"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordStatus {
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedRecord {
    pub task_id: String,
    pub status: RecordStatus,
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl MergedRecord {
    pub fn is_valid(&self) -> bool {
        self.status == RecordStatus::Valid
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key).filter(|v| !v.is_null())
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(numeric)
    }

    fn has_field(&self, key: &str) -> bool {
        key == "task_id" || key == "status" || self.fields.contains_key(key)
    }
}

/// Timestamps and timings never survive the merge.
fn is_skipped_field(key: &str) -> bool {
    key == "task_id" || key == "timestamp" || key.ends_with("_timestamp") || key.ends_with("_time")
}

fn row_task_id<'a>(stage: Stage, row: &'a Row) -> Result<&'a str> {
    match row.get("task_id").and_then(Value::as_str) {
        Some(id) => Ok(id),
        None => bail!("{} row without a task_id", stage),
    }
}

/// Fail unless the row's task_id is exactly the key derived from its own dimensions.
fn check_row_identity(stage: Stage, row: &Row) -> Result<()> {
    let task_id = row_task_id(stage, row)?;
    let id: CandidateId = match serde_json::from_value(Value::Object(row.clone())) {
        Ok(id) => id,
        Err(e) => bail!("Identity conflict in {} for {}: {}", stage, task_id, e),
    };
    if !id.is_consistent() {
        bail!(
            "Identity conflict in {} for {}: dimensions derive '{}'",
            stage,
            task_id,
            CandidateId::compose_key(id.language, &id.model, &id.completeness, &id.task_name)
        );
    }
    Ok(())
}

/// Pick one row per task_id: the last one in log order.
///
/// Attempts are appended in order and a re-run appends after the previous
/// run, so for execution the last row is the final attempt of the latest run.
fn winners(stage: Stage, rows: &[Row]) -> Result<HashMap<String, Row>> {
    let mut out: HashMap<String, Row> = HashMap::new();
    for row in rows {
        check_row_identity(stage, row)?;
        let task_id = row_task_id(stage, row)?.to_string();
        out.insert(task_id, row.clone());
    }
    Ok(out)
}

/// Merge one task's stage streams. Pure: same rows in, same records out.
///
/// `secondary` holds the rows of every non-generation stage that takes part in
/// the join; a required stage absent from it contributes no rows.
pub fn merge_stage_rows(generation: &[Row], secondary: &[(Stage, Vec<Row>)]) -> Result<Vec<MergedRecord>> {
    // Base set: last generation row per task_id, in order of first appearance.
    let mut order: Vec<String> = Vec::new();
    let mut base: HashMap<String, Row> = HashMap::new();
    for row in generation {
        check_row_identity(Stage::Generation, row)?;
        let task_id = row_task_id(Stage::Generation, row)?.to_string();
        if base.insert(task_id.clone(), row.clone()).is_none() {
            order.push(task_id);
        }
    }

    let mut stage_winners = Vec::with_capacity(REQUIRED_STAGES.len());
    for stage in REQUIRED_STAGES {
        let rows = secondary
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, rows)| rows.as_slice())
            .unwrap_or(&[]);
        stage_winners.push((stage, winners(stage, rows)?));
    }

    let mut merged = Vec::with_capacity(order.len());
    for task_id in order {
        let generation_row = &base[&task_id];
        let mut record = MergedRecord {
            task_id: task_id.clone(),
            status: RecordStatus::Valid,
            fields: BTreeMap::new(),
        };
        for (key, value) in generation_row {
            if !is_skipped_field(key) {
                record.fields.insert(key.clone(), value.clone());
            }
        }

        for (stage, by_id) in &stage_winners {
            let row = match by_id.get(&task_id) {
                Some(row) => row,
                None => {
                    record.status = RecordStatus::Invalid;
                    continue;
                }
            };
            for key in IDENTITY_FIELDS {
                if row.get(key) != generation_row.get(key) {
                    bail!("Identity conflict in {} for {}: '{}' disagrees with generation", stage, task_id, key);
                }
            }
            for (key, value) in row {
                if is_skipped_field(key) || IDENTITY_FIELDS.contains(&key.as_str()) {
                    continue;
                }
                let name = if record.has_field(key) {
                    format!("{}_{}", stage.dir_name(), key)
                } else {
                    key.clone()
                };
                record.fields.insert(name, value.clone());
            }
        }
        merged.push(record);
    }
    Ok(merged)
}

/// Read and merge one task's logs from the results directory.
pub fn merge_task(results_dir: &Path, task_name: &str) -> Result<Vec<MergedRecord>> {
    let generation = read_rows(&stage_log_path(results_dir, Stage::Generation, task_name))?;
    if generation.is_empty() {
        warn!(task = %task_name, "No generation records - nothing to merge");
    }
    let mut secondary = Vec::with_capacity(REQUIRED_STAGES.len());
    for stage in REQUIRED_STAGES {
        secondary.push((stage, read_rows(&stage_log_path(results_dir, stage, task_name))?));
    }
    merge_stage_rows(&generation, &secondary)
}

/// Merge every task in order and write `merged/merged_results.ndjson`.
pub fn merge_tasks(results_dir: &Path, tasks: &[String]) -> Result<(PathBuf, Vec<MergedRecord>)> {
    let mut all = Vec::new();
    for task in tasks {
        let records = merge_task(results_dir, task)?;
        let invalid = records.iter().filter(|r| !r.is_valid()).count();
        info!(task = %task, records = records.len(), invalid, "Merged task");
        all.extend(records);
    }
    let path = merged_path(results_dir);
    write_ndjson(&path, &all)?;
    Ok((path, all))
}

/// Load a previously written merged file.
pub fn load_merged(results_dir: &Path) -> Result<Vec<MergedRecord>> {
    assayer_common::store::read_records(&merged_path(results_dir))
}
