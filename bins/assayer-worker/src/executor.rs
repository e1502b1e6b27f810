/// Candidate Executor - High-Level Orchestration
///
/// **Responsibility:**
/// Drive every candidate through execution, testing, static-analysis import and
/// hallucination detection, appending one record per event to the stage logs.
///
/// **Architecture:**
/// 1. ProcessEngine runs the program (engine.rs)
/// 2. Evaluator judges each test case (evaluator.rs)
/// 3. MeasurementProvider supplies static-analysis vectors (static_analysis.rs)
/// 4. Hallucination flags come from the final attempt (hallucination.rs)
///
/// This module is the glue layer. Candidates run concurrently up to
/// `max_parallel`; a failure inside one candidate is logged and never stops
/// the others.

use crate::engine::{extract_key_error, ExecutionOutcome, ProcessEngine};
use crate::evaluator::{build_payload, evaluate_case};
use crate::hallucination;
use crate::static_analysis::MeasurementProvider;
use anyhow::Result;
use assayer_common::config::{EvalConfig, TaskSpec};
use assayer_common::store::{read_records, Recorders};
use assayer_common::types::{
    CandidateId, ExecutionRecord, ExecutionStatus, GenerationRecord, StaticAnalysisRecord,
    TestResultRecord,
};
use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Knobs that shape one pipeline run
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub codes_dir: PathBuf,
    pub timeout: Duration,
    pub max_attempts: u32,
    pub retry_delay: Duration,
    pub strict_stderr: bool,
    pub max_parallel: usize,
}

impl RunSettings {
    pub fn from_config(config: &EvalConfig) -> Self {
        Self {
            codes_dir: config.codes_dir.clone(),
            timeout: config.timeout(),
            max_attempts: config.max_attempts.max(1),
            retry_delay: config.retry_delay(),
            strict_stderr: config.strict_stderr,
            max_parallel: config.max_parallel.max(1),
        }
    }
}

/// What happened to one candidate
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateSummary {
    pub task_id: String,
    pub attempts: u32,
    pub succeeded: bool,
    pub tests_passed: usize,
    pub tests_total: usize,
}

/// Totals for a whole matrix run
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RunSummary {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub tests_passed: usize,
    pub tests_total: usize,
}

pub struct Pipeline {
    engine: ProcessEngine,
    recorders: Recorders,
    measurements: Box<dyn MeasurementProvider>,
    settings: RunSettings,
}

impl Pipeline {
    pub fn new(
        engine: ProcessEngine,
        recorders: Recorders,
        measurements: Box<dyn MeasurementProvider>,
        settings: RunSettings,
    ) -> Self {
        Self {
            engine,
            recorders,
            measurements,
            settings,
        }
    }

    /// Bounded attempt loop. Every attempt is appended to the execution log
    /// before the loop continues; the loop stops at the first success.
    ///
    /// Returns the final attempt's outcome and record.
    pub async fn execute_with_retry(
        &self,
        id: &CandidateId,
        path: &Path,
        payload: &Value,
    ) -> Result<(ExecutionOutcome, ExecutionRecord)> {
        let mut attempt = 0u32;
        loop {
            let outcome = self
                .engine
                .run(path, id.language, payload, self.settings.timeout)
                .await;
            let record = execution_record(id, &outcome, attempt);
            self.recorders.execution.append(&id.task_name, &record).await?;

            if outcome.success {
                info!(task_id = %id, attempt, duration_ms = outcome.duration.as_millis() as u64, "Execution succeeded");
            } else {
                warn!(
                    task_id = %id,
                    attempt,
                    error_type = ?outcome.error_type,
                    exit_code = outcome.exit_code,
                    "Execution failed"
                );
            }

            attempt += 1;
            if outcome.success || attempt >= self.settings.max_attempts {
                return Ok((outcome, record));
            }
            tokio::time::sleep(self.settings.retry_delay).await;
        }
    }

    /// Run every test case of the task in declared order, one record per case.
    pub async fn run_tests(
        &self,
        id: &CandidateId,
        path: &Path,
        task: &TaskSpec,
    ) -> Result<Vec<TestResultRecord>> {
        let mut results = Vec::with_capacity(task.cases.len());
        for case in &task.cases {
            let payload = build_payload(&task.input_template, case, &task.document);
            let outcome = self
                .engine
                .run(path, id.language, &payload, self.settings.timeout)
                .await;
            let verdict = evaluate_case(&outcome, &case.expected, self.settings.strict_stderr);

            debug!(
                task_id = %id,
                test_case = %case.id_string(),
                passed = verdict.passed,
                "Test case evaluated"
            );

            let record = TestResultRecord {
                id: id.clone(),
                test_case_id: case.id_string(),
                expected_output: case.expected.clone(),
                actual_output: verdict.actual,
                test_passed: verdict.passed,
                execution_duration: outcome.duration_secs(),
                memory_usage: outcome.resources.peak_memory_usage,
                cpu_time: outcome.resources.cpu_time,
                timestamp: Utc::now(),
            };
            self.recorders.test_results.append(&id.task_name, &record).await?;
            results.push(record);
        }
        Ok(results)
    }

    /// Full per-candidate pipeline: execute, test, import static analysis,
    /// detect hallucinations. Returns `None` if the candidate has no program on disk.
    #[tracing::instrument(skip(self, id, task), fields(task_id = %id))]
    pub async fn process_candidate(
        &self,
        id: &CandidateId,
        task: &TaskSpec,
        has_generation: bool,
    ) -> Result<Option<CandidateSummary>> {
        let extension = self.engine.languages().file_extension(&id.language);
        let path = id.solution_path(&self.settings.codes_dir, &extension);
        if !path.exists() {
            debug!(path = %path.display(), "No solution on disk - skipping");
            return Ok(None);
        }

        let first_case = match task.cases.first() {
            Some(case) => build_payload(&task.input_template, case, &task.document),
            None => Value::Object(Map::new()),
        };
        let (_, final_attempt) = self.execute_with_retry(id, &path, &first_case).await?;

        let results = self.run_tests(id, &path, task).await?;

        match self.measurements.measures(id) {
            Some(measures) => {
                let record = StaticAnalysisRecord::from_measures(
                    id.clone(),
                    Some(path.display().to_string()),
                    &measures,
                );
                self.recorders.static_analysis.append(&id.task_name, &record).await?;
            }
            None => warn!("No static-analysis measurements - candidate will merge as invalid"),
        }

        if has_generation {
            let record = hallucination::build_record(id, &final_attempt, &results);
            self.recorders.hallucination.append(&id.task_name, &record).await?;
        } else {
            warn!("No generation record - skipping hallucination stage");
        }

        Ok(Some(CandidateSummary {
            task_id: id.task_id.clone(),
            attempts: final_attempt.retry_count + 1,
            succeeded: final_attempt.execution_status == ExecutionStatus::Success,
            tests_passed: results.iter().filter(|r| r.test_passed).count(),
            tests_total: results.len(),
        }))
    }

    /// Process every configured candidate with bounded concurrency.
    #[tracing::instrument(skip(self, config), fields(tasks = config.tasks.len(), max_parallel = self.settings.max_parallel))]
    pub async fn run_matrix(&self, config: &EvalConfig) -> Result<RunSummary> {
        let mut jobs = Vec::new();
        for task_name in &config.tasks {
            let task = match TaskSpec::load(&config.test_cases_dir, task_name) {
                Ok(task) => Arc::new(task),
                Err(e) => {
                    error!(task = %task_name, error = %format!("{:#}", e), "Cannot load test cases - skipping task");
                    continue;
                }
            };
            let generated = self.generated_ids(task_name)?;
            for id in config.candidates().into_iter().filter(|id| &id.task_name == task_name) {
                let has_generation = generated.contains(&id.task_id);
                jobs.push((id, Arc::clone(&task), has_generation));
            }
        }

        info!(candidates = jobs.len(), "Starting evaluation run");

        let outcomes: Vec<(String, Result<Option<CandidateSummary>>)> = stream::iter(jobs)
            .map(|(id, task, has_generation)| async move {
                let result = self.process_candidate(&id, &task, has_generation).await;
                (id.task_id, result)
            })
            .buffer_unordered(self.settings.max_parallel)
            .collect()
            .await;

        let mut summary = RunSummary::default();
        for (task_id, outcome) in outcomes {
            match outcome {
                Ok(Some(candidate)) => {
                    summary.processed += 1;
                    summary.tests_passed += candidate.tests_passed;
                    summary.tests_total += candidate.tests_total;
                }
                Ok(None) => summary.skipped += 1,
                Err(e) => {
                    summary.failed += 1;
                    error!(task_id = %task_id, error = %format!("{:#}", e), "Candidate pipeline failed");
                }
            }
        }

        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            tests_passed = summary.tests_passed,
            tests_total = summary.tests_total,
            "Evaluation run complete"
        );
        Ok(summary)
    }

    fn generated_ids(&self, task_name: &str) -> Result<HashSet<String>> {
        let path = self.recorders.generation.path_for(task_name);
        let records: Vec<GenerationRecord> = read_records(&path)?;
        Ok(records.into_iter().map(|r| r.id.task_id).collect())
    }
}

/// Execution-log row for one attempt; the stored message is the key error line.
pub fn execution_record(id: &CandidateId, outcome: &ExecutionOutcome, attempt: u32) -> ExecutionRecord {
    let error_message = if outcome.success {
        None
    } else {
        outcome
            .error_message
            .as_deref()
            .map(extract_key_error)
            .filter(|line| !line.is_empty())
    };
    ExecutionRecord {
        id: id.clone(),
        execution_status: if outcome.success {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failure
        },
        error_type: outcome.error_type,
        error_message,
        exit_code: outcome.exit_code,
        retry_count: attempt,
        duration: outcome.duration_secs(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assayer_common::types::{ErrorType, Language, ResourceUsage};

    #[test]
    fn test_execution_record_from_failure() {
        let id = CandidateId::new(Language::Python, "gpt", "minimal", "task_2");
        let outcome = ExecutionOutcome {
            success: false,
            error_type: Some(ErrorType::NameError),
            error_message: Some("Traceback (most recent call last):\n  File \"Solution.py\", line 1\nNameError: name 'x' is not defined\n".to_string()),
            duration: Duration::from_millis(250),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 1,
            resources: ResourceUsage::default(),
        };
        let record = execution_record(&id, &outcome, 2);
        assert_eq!(record.execution_status, ExecutionStatus::Failure);
        assert_eq!(record.error_message.as_deref(), Some("NameError: name 'x' is not defined"));
        assert_eq!(record.retry_count, 2);
        assert_eq!(record.exit_code, 1);
        assert!((record.duration - 0.25).abs() < 1e-9);
    }

    #[test]
    fn test_execution_record_from_success() {
        let id = CandidateId::new(Language::Go, "gpt", "minimal", "task_2");
        let outcome = ExecutionOutcome {
            success: true,
            error_type: None,
            error_message: None,
            duration: Duration::from_millis(5),
            stdout: "{}".to_string(),
            stderr: String::new(),
            exit_code: 0,
            resources: ResourceUsage::default(),
        };
        let record = execution_record(&id, &outcome, 0);
        assert_eq!(record.execution_status, ExecutionStatus::Success);
        assert!(record.error_type.is_none());
        assert!(record.error_message.is_none());
    }

    #[test]
    fn test_settings_clamp_to_one() {
        let mut config: EvalConfig = serde_json::from_value(serde_json::json!({
            "languages": ["python"],
            "tasks": ["task_1"],
            "models": ["gpt"],
            "completeness_levels": ["complete"]
        }))
        .unwrap();
        config.max_parallel = 0;
        let settings = RunSettings::from_config(&config);
        assert_eq!(settings.max_parallel, 1);
        assert_eq!(settings.max_attempts, 1);
        assert_eq!(settings.timeout, Duration::from_secs(30));
    }
}
