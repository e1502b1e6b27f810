// CLI commands: register candidates, merge stage logs, score, summarize
use crate::output::{self, fmt_score, print_section, print_success, print_warning, OutputFormat};
use anyhow::{Context, Result};
use assayer_analysis::merge::{load_merged, merge_tasks, MergedRecord};
use assayer_analysis::metrics::{compute_metrics, MetricRecord, MetricsOptions};
use assayer_analysis::tables::{
    correlation_csv, dimension_means, error_type_distribution, pivot_mean, CorrelationRow, CountTable, Dimension,
    MetricField, PivotTable,
};
use assayer_common::config::EvalConfig;
use assayer_common::store::{read_records, write_ndjson, StageRecorder, Stage};
use assayer_common::types::{CandidateId, GenerationRecord, GenerationStatus};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tabled::Tabled;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Every `Solution.*` file below `codes_dir`, in file-name order.
pub fn find_solutions(codes_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in WalkDir::new(codes_dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", codes_dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let is_solution = entry.path().file_stem().and_then(|s| s.to_str()) == Some("Solution")
            && entry.path().extension().is_some();
        if is_solution {
            found.push(entry.into_path());
        }
    }
    Ok(found)
}

/// Record a generation row for every candidate program on disk that the
/// configured matrix covers and that is not registered yet.
pub async fn register(config: &EvalConfig) -> Result<usize> {
    if !config.codes_dir.exists() {
        print_warning(&format!("Codes directory not found: {}", config.codes_dir.display()));
        return Ok(0);
    }

    let matrix: HashSet<String> = config.candidates().into_iter().map(|id| id.task_id).collect();
    let recorder = StageRecorder::new(&config.results_dir, Stage::Generation);
    let mut known: HashSet<String> = HashSet::new();
    for task in &config.tasks {
        let existing: Vec<GenerationRecord> = read_records(&recorder.path_for(task))?;
        known.extend(existing.into_iter().map(|r| r.id.task_id));
    }

    let mut registered = 0;
    for path in find_solutions(&config.codes_dir)? {
        let Some(id) = CandidateId::from_solution_path(&config.codes_dir, &path) else {
            debug!(path = %path.display(), "Not a candidate path - ignoring");
            continue;
        };
        if !matrix.contains(&id.task_id) || known.contains(&id.task_id) {
            continue;
        }

        let source = fs::read_to_string(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        let (generation_status, generation_error) = if source.trim().is_empty() {
            (GenerationStatus::Error, Some("Empty solution file".to_string()))
        } else {
            (GenerationStatus::Success, None)
        };
        let record = GenerationRecord {
            id: id.clone(),
            generation_status,
            generation_error,
            timestamp: Utc::now(),
        };
        recorder.append(&id.task_name, &record).await?;
        known.insert(id.task_id.clone());
        registered += 1;
        info!(task_id = %id, "Registered candidate");
    }

    print_success(&format!("Registered {} candidate(s)", registered));
    Ok(registered)
}

/// Rebuild `merged/merged_results.ndjson` from the stage logs.
pub fn merge(config: &EvalConfig) -> Result<Vec<MergedRecord>> {
    let (path, records) = merge_tasks(&config.results_dir, &config.tasks)?;
    let invalid = records.iter().filter(|r| !r.is_valid()).count();
    print_success(&format!(
        "Merged {} record(s) ({} invalid) into {}",
        records.len(),
        invalid,
        path.display()
    ));
    Ok(records)
}

fn load_or_merge(config: &EvalConfig) -> Result<Vec<MergedRecord>> {
    let records = load_merged(&config.results_dir)?;
    if records.is_empty() {
        info!("No merged results on disk - merging stage logs first");
        return merge(config);
    }
    Ok(records)
}

/// Table row for metric display
#[derive(Debug, Serialize, Tabled)]
struct MetricRow {
    task_id: String,
    #[tabled(rename = "FC")]
    fc: String,
    #[tabled(rename = "R")]
    r: String,
    #[tabled(rename = "RB")]
    rb: String,
    #[tabled(rename = "M")]
    m: String,
    #[tabled(rename = "S")]
    s: String,
    #[tabled(rename = "HR")]
    hr: String,
    #[tabled(rename = "CQS")]
    cqs: String,
}

impl From<&MetricRecord> for MetricRow {
    fn from(record: &MetricRecord) -> Self {
        let score = |field: MetricField| fmt_score(field.value(record));
        Self {
            task_id: record.task_id.clone(),
            fc: score(MetricField::FunctionalCorrectness),
            r: score(MetricField::Readability),
            rb: score(MetricField::Robustness),
            m: score(MetricField::Maintainability),
            s: score(MetricField::Security),
            hr: record
                .hallucination
                .as_ref()
                .map(|h| format!("{:.3}", h.hallucination_rate))
                .unwrap_or_else(|| "-".to_string()),
            cqs: score(MetricField::Cqs),
        }
    }
}

/// Score merged records, optionally persisting the full metric records.
pub fn metrics(
    config: &EvalConfig,
    include_invalid: bool,
    format: OutputFormat,
    save_to: Option<&Path>,
) -> Result<Vec<MetricRecord>> {
    let merged = load_or_merge(config)?;
    let scores = compute_metrics(&merged, MetricsOptions { include_invalid });

    if let Some(path) = save_to {
        write_ndjson(path, &scores)?;
        print_success(&format!("Wrote {} metric record(s) to {}", scores.len(), path.display()));
    }

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&scores)?),
        OutputFormat::Table => {
            let rows: Vec<MetricRow> = scores.iter().map(MetricRow::from).collect();
            output::print_output(rows, format)?;
        }
    }
    Ok(scores)
}

fn count_grid(table: &CountTable) -> String {
    let mut header = vec![table.row_header.clone()];
    header.extend(table.columns.iter().cloned());
    let body = table
        .rows
        .iter()
        .map(|(label, cells)| {
            let mut row = vec![label.clone()];
            row.extend(cells.iter().map(|c| c.to_string()));
            row
        })
        .collect();
    output::render_grid(header, body)
}

fn pivot_grid(table: &PivotTable) -> String {
    let mut header = vec![table.row_header.clone()];
    header.extend(table.columns.iter().cloned());
    let body = table
        .rows
        .iter()
        .map(|(label, cells)| {
            let mut row = vec![label.clone()];
            row.extend(cells.iter().map(|c| fmt_score(*c)));
            row
        })
        .collect();
    output::render_grid(header, body)
}

/// Error-type distributions plus one metric pivot.
pub fn tables(config: &EvalConfig, metric: MetricField, by: Dimension, include_invalid: bool) -> Result<()> {
    let merged = load_or_merge(config)?;

    print_section("Error types by language");
    println!("{}", count_grid(&error_type_distribution(&merged, Dimension::Language)));

    print_section("Error types by task");
    println!("{}", count_grid(&error_type_distribution(&merged, Dimension::Task)));

    let scores = compute_metrics(&merged, MetricsOptions { include_invalid });
    print_section(&format!("Mean {} by {} and task", metric, by));
    if scores.is_empty() {
        print_warning("No scored records");
    } else {
        println!("{}", pivot_grid(&pivot_mean(&scores, by, metric, 1)));
    }
    Ok(())
}

fn correlation_grid(rows: &[CorrelationRow]) -> String {
    let header = ["Metric", "Task Complexity", "Language Impact", "Prompt Completeness"]
        .iter()
        .map(|h| h.to_string())
        .collect();
    let fmt = |v: Option<f64>| v.map(|v| format!("{:.2}", v)).unwrap_or_else(|| "-".to_string());
    let body = rows
        .iter()
        .map(|row| {
            vec![
                row.metric.label().to_string(),
                fmt(row.task_complexity),
                fmt(row.language_impact),
                fmt(row.prompt_completeness),
            ]
        })
        .collect();
    output::render_grid(header, body)
}

/// Correlation of each metric with task complexity, language and prompt
/// completeness. With `export_dir`, also writes per-dimension metric means and
/// the correlation table as CSV files.
pub fn correlation(config: &EvalConfig, include_invalid: bool, export_dir: Option<&Path>) -> Result<Vec<CorrelationRow>> {
    let merged = load_or_merge(config)?;
    let scores = compute_metrics(&merged, MetricsOptions { include_invalid });
    if scores.is_empty() {
        print_warning("No scored records");
        return Ok(Vec::new());
    }

    let rows = assayer_analysis::tables::correlation(&scores);
    print_section("Metric correlations");
    println!("{}", correlation_grid(&rows));

    if let Some(dir) = export_dir {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let exports = [
            ("task_metrics.csv", Dimension::Task),
            ("language_metrics.csv", Dimension::Language),
            ("completeness_metrics.csv", Dimension::Completeness),
            ("model_metrics.csv", Dimension::Model),
        ];
        for (file, by) in exports {
            let path = dir.join(file);
            fs::write(&path, dimension_means(&scores, by).to_csv())
                .with_context(|| format!("Failed to write {}", path.display()))?;
        }
        let path = dir.join("correlation.csv");
        fs::write(&path, correlation_csv(&rows)).with_context(|| format!("Failed to write {}", path.display()))?;
        print_success(&format!("Exported metric tables to {}", dir.display()));
    }
    Ok(rows)
}
