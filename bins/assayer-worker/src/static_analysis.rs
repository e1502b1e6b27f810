// Static-analysis import: raw analyzer measurements in, StaticAnalysisRecord out
use anyhow::{Context, Result};
use assayer_common::types::CandidateId;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Source of raw static-analysis measurement vectors for candidates.
pub trait MeasurementProvider: Send + Sync {
    /// Raw measures for `id`, keyed by analyzer metric name, or `None` if not analyzed.
    fn measures(&self, id: &CandidateId) -> Option<Map<String, Value>>;
}

/// Provider used when no analyzer output is configured.
pub struct NoMeasurements;

impl MeasurementProvider for NoMeasurements {
    fn measures(&self, _id: &CandidateId) -> Option<Map<String, Value>> {
        None
    }
}

/// Measurements exported ahead of time as `{task_id: {metric: value}}`.
#[derive(Debug, Default)]
pub struct JsonMeasurementProvider {
    by_task_id: HashMap<String, Map<String, Value>>,
}

impl JsonMeasurementProvider {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read measurements file {}", path.display()))?;
        Self::from_json(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let raw: Map<String, Value> = serde_json::from_str(content)?;
        let by_task_id = raw
            .into_iter()
            .filter_map(|(task_id, value)| match value {
                Value::Object(measures) => Some((task_id, measures)),
                _ => {
                    tracing::warn!(task_id = %task_id, "Ignoring non-object measurement entry");
                    None
                }
            })
            .collect();
        Ok(Self { by_task_id })
    }

    pub fn len(&self) -> usize {
        self.by_task_id.len()
    }
}

impl MeasurementProvider for JsonMeasurementProvider {
    fn measures(&self, id: &CandidateId) -> Option<Map<String, Value>> {
        self.by_task_id.get(&id.task_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assayer_common::types::Language;

    #[test]
    fn test_lookup_by_task_id() {
        let provider = JsonMeasurementProvider::from_json(
            r#"{
                "python_gpt_complete_task_1": {"complexity": "4", "ncloc": 52},
                "broken": 7
            }"#,
        )
        .unwrap();
        assert_eq!(provider.len(), 1);

        let hit = CandidateId::new(Language::Python, "GPT", "complete", "task_1");
        let measures = provider.measures(&hit).unwrap();
        assert_eq!(measures["ncloc"], 52);

        let miss = CandidateId::new(Language::Go, "gpt", "complete", "task_1");
        assert!(provider.measures(&miss).is_none());
        assert!(NoMeasurements.measures(&hit).is_none());
    }
}
