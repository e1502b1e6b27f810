//! Summary tables over merged records and metric records.

use crate::merge::MergedRecord;
use crate::metrics::MetricRecord;
use crate::stats::{mean, pearson, round_to, sample_std};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub const AVERAGE_LABEL: &str = "Average";

/// Completeness levels from least to most complete prompt.
pub const COMPLETENESS_ORDER: [&str; 3] = ["minimal", "partial", "complete"];

/// Identity dimension a table can be broken down by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    Model,
    Language,
    Completeness,
    Task,
}

impl Dimension {
    pub fn field(&self) -> &'static str {
        match self {
            Dimension::Model => "model",
            Dimension::Language => "language",
            Dimension::Completeness => "completeness",
            Dimension::Task => "task_name",
        }
    }

    fn of_metric<'a>(&self, record: &'a MetricRecord) -> &'a str {
        match self {
            Dimension::Model => &record.model,
            Dimension::Language => &record.language,
            Dimension::Completeness => &record.completeness,
            Dimension::Task => &record.task_name,
        }
    }
}

impl FromStr for Dimension {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "model" => Ok(Dimension::Model),
            "language" => Ok(Dimension::Language),
            "completeness" => Ok(Dimension::Completeness),
            "task" | "task_name" => Ok(Dimension::Task),
            other => Err(format!("unknown dimension '{}'", other)),
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.field())
    }
}

/// Score that a pivot table can aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricField {
    FunctionalCorrectness,
    Readability,
    Robustness,
    Maintainability,
    Security,
    HallucinationRate,
    Cqs,
}

impl MetricField {
    pub const ALL: [MetricField; 7] = [
        MetricField::FunctionalCorrectness,
        MetricField::Readability,
        MetricField::Robustness,
        MetricField::Maintainability,
        MetricField::Security,
        MetricField::HallucinationRate,
        MetricField::Cqs,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MetricField::FunctionalCorrectness => "functional_correctness",
            MetricField::Readability => "readability",
            MetricField::Robustness => "robustness",
            MetricField::Maintainability => "maintainability",
            MetricField::Security => "security",
            MetricField::HallucinationRate => "hallucination_rate",
            MetricField::Cqs => "cqs",
        }
    }

    /// Column label used in exported tables.
    pub fn label(&self) -> &'static str {
        match self {
            MetricField::FunctionalCorrectness => "FC",
            MetricField::Readability => "R",
            MetricField::Robustness => "RB",
            MetricField::Maintainability => "M",
            MetricField::Security => "S",
            MetricField::HallucinationRate => "HR",
            MetricField::Cqs => "CQS",
        }
    }

    pub fn value(&self, record: &MetricRecord) -> Option<f64> {
        match self {
            MetricField::FunctionalCorrectness => Some(record.fc.functional_correctness),
            MetricField::Readability => record.readability.as_ref().map(|r| r.readability),
            MetricField::Robustness => Some(record.robustness.robustness),
            MetricField::Maintainability => record.maintainability.as_ref().map(|m| m.maintainability),
            MetricField::Security => record.security.as_ref().map(|s| s.security),
            MetricField::HallucinationRate => record.hallucination.as_ref().map(|h| h.hallucination_rate),
            MetricField::Cqs => Some(record.cqs),
        }
    }
}

impl FromStr for MetricField {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_lowercase();
        let alias = match lowered.as_str() {
            "fc" => "functional_correctness",
            "r" => "readability",
            "rb" => "robustness",
            "m" => "maintainability",
            "s" => "security",
            "hr" => "hallucination_rate",
            other => other,
        };
        MetricField::ALL
            .into_iter()
            .find(|field| field.name() == alias)
            .ok_or_else(|| format!("unknown metric '{}'", s))
    }
}

impl fmt::Display for MetricField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Integer counts with labelled rows and columns.
#[derive(Debug, Clone, PartialEq)]
pub struct CountTable {
    pub row_header: String,
    pub columns: Vec<String>,
    pub rows: Vec<(String, Vec<usize>)>,
}

/// Count `error_type` values per value of `by` over merged records.
///
/// Every dimension value seen in the data gets a row, even with no errors;
/// rows and columns are sorted.
pub fn error_type_distribution(records: &[MergedRecord], by: Dimension) -> CountTable {
    let mut counts: BTreeMap<String, BTreeMap<String, usize>> = BTreeMap::new();
    let mut columns: BTreeSet<String> = BTreeSet::new();
    for record in records {
        let Some(label) = record.get_str(by.field()) else {
            continue;
        };
        let row = counts.entry(label.to_string()).or_default();
        if let Some(error_type) = record.get_str("error_type") {
            *row.entry(error_type.to_string()).or_default() += 1;
            columns.insert(error_type.to_string());
        }
    }
    let columns: Vec<String> = columns.into_iter().collect();
    let rows = counts
        .into_iter()
        .map(|(label, row)| {
            let cells = columns.iter().map(|c| row.get(c).copied().unwrap_or(0)).collect();
            (label, cells)
        })
        .collect();
    CountTable {
        row_header: by.field().to_string(),
        columns,
        rows,
    }
}

/// Mean of one metric by a dimension × task, with optional Average row and column.
#[derive(Debug, Clone, PartialEq)]
pub struct PivotTable {
    pub row_header: String,
    pub columns: Vec<String>,
    pub rows: Vec<(String, Vec<Option<f64>>)>,
}

impl PivotTable {
    pub fn cell(&self, row: &str, column: &str) -> Option<f64> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows
            .iter()
            .find(|(label, _)| label == row)
            .and_then(|(_, cells)| cells[col])
    }
}

/// Pivot `metric` means by `rows` × task.
///
/// An `Average` column is appended when there is more than one task, and an
/// `Average` row when there is more than one row; averages skip empty cells.
/// Every cell is rounded to `digits` decimals after averaging.
pub fn pivot_mean(records: &[MetricRecord], rows: Dimension, metric: MetricField, digits: i32) -> PivotTable {
    let mut groups: BTreeMap<String, BTreeMap<String, Vec<f64>>> = BTreeMap::new();
    let mut tasks: BTreeSet<String> = BTreeSet::new();
    for record in records {
        let Some(value) = metric.value(record) else {
            continue;
        };
        tasks.insert(record.task_name.clone());
        groups
            .entry(rows.of_metric(record).to_string())
            .or_default()
            .entry(record.task_name.clone())
            .or_default()
            .push(value);
    }

    let mut columns: Vec<String> = tasks.into_iter().collect();
    let mut table: Vec<(String, Vec<Option<f64>>)> = groups
        .into_iter()
        .map(|(label, by_task)| {
            let cells = columns
                .iter()
                .map(|task| by_task.get(task).and_then(|values| mean(values.iter().copied().map(Some))))
                .collect();
            (label, cells)
        })
        .collect();

    if columns.len() > 1 {
        for (_, cells) in table.iter_mut() {
            let average = mean(cells.iter().copied());
            cells.push(average);
        }
        columns.push(AVERAGE_LABEL.to_string());
    }
    if table.len() > 1 {
        let average_row = (0..columns.len())
            .map(|col| mean(table.iter().map(|(_, cells)| cells[col])))
            .collect();
        table.push((AVERAGE_LABEL.to_string(), average_row));
    }

    for (_, cells) in table.iter_mut() {
        for cell in cells.iter_mut() {
            *cell = cell.map(|v| round_to(v, digits));
        }
    }

    PivotTable {
        row_header: rows.field().to_string(),
        columns,
        rows: table,
    }
}

/// Mean of every metric per value of one dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionMeans {
    pub dimension: Dimension,
    /// One row per dimension value, cells in `MetricField::ALL` order
    pub rows: Vec<(String, Vec<Option<f64>>)>,
}

impl DimensionMeans {
    pub fn value(&self, label: &str, metric: MetricField) -> Option<f64> {
        let col = MetricField::ALL.iter().position(|m| *m == metric)?;
        self.rows
            .iter()
            .find(|(row, _)| row == label)
            .and_then(|(_, cells)| cells[col])
    }

    /// CSV with a header row, two decimals, empty cells for missing means.
    pub fn to_csv(&self) -> String {
        let mut header = vec![self.dimension.field().to_string()];
        header.extend(MetricField::ALL.iter().map(|m| m.label().to_string()));
        let mut csv = header.join(",") + "\n";
        for (label, cells) in &self.rows {
            let mut line = vec![csv_field(label)];
            line.extend(cells.iter().map(|c| fmt_csv_number(*c)));
            csv.push_str(&line.join(","));
            csv.push('\n');
        }
        csv
    }
}

/// Per-dimension metric means, rows sorted by dimension value.
pub fn dimension_means(records: &[MetricRecord], by: Dimension) -> DimensionMeans {
    let mut groups: BTreeMap<String, Vec<&MetricRecord>> = BTreeMap::new();
    for record in records {
        groups.entry(by.of_metric(record).to_string()).or_default().push(record);
    }
    let rows = groups
        .into_iter()
        .map(|(label, members)| {
            let cells = MetricField::ALL
                .iter()
                .map(|metric| mean(members.iter().map(|r| metric.value(r))))
                .collect();
            (label, cells)
        })
        .collect();
    DimensionMeans { dimension: by, rows }
}

/// Metrics covered by the correlation table, in display order.
pub const CORRELATED_METRICS: [MetricField; 6] = [
    MetricField::FunctionalCorrectness,
    MetricField::HallucinationRate,
    MetricField::Readability,
    MetricField::Maintainability,
    MetricField::Robustness,
    MetricField::Security,
];

/// How one metric moves with task complexity, language and prompt completeness.
#[derive(Debug, Clone, PartialEq)]
pub struct CorrelationRow {
    pub metric: MetricField,
    /// Pearson r between task rank (tasks in name order) and the task mean
    pub task_complexity: Option<f64>,
    /// Coefficient of variation across language means, scaled so the largest
    /// magnitude over all metrics is 1
    pub language_impact: Option<f64>,
    /// Pearson r between completeness rank (minimal, partial, complete) and its mean
    pub prompt_completeness: Option<f64>,
}

fn ranked_correlation(means: &DimensionMeans, ranks: &[(String, f64)], metric: MetricField) -> Option<f64> {
    let (xs, ys): (Vec<f64>, Vec<f64>) = ranks
        .iter()
        .filter_map(|(label, rank)| means.value(label, metric).map(|v| (*rank, v)))
        .unzip();
    pearson(&xs, &ys).map(|r| round_to(r, 2))
}

/// Correlation table over scored records; every value rounded to two decimals.
///
/// Undefined correlations (fewer than two points, or no variance) are `None`.
pub fn correlation(records: &[MetricRecord]) -> Vec<CorrelationRow> {
    let by_task = dimension_means(records, Dimension::Task);
    let by_language = dimension_means(records, Dimension::Language);
    let by_completeness = dimension_means(records, Dimension::Completeness);

    let task_ranks: Vec<(String, f64)> = by_task
        .rows
        .iter()
        .enumerate()
        .map(|(idx, (label, _))| (label.clone(), (idx + 1) as f64))
        .collect();
    let completeness_ranks: Vec<(String, f64)> = COMPLETENESS_ORDER
        .iter()
        .enumerate()
        .map(|(idx, level)| (level.to_string(), (idx + 1) as f64))
        .collect();

    let raw_impact: Vec<Option<f64>> = CORRELATED_METRICS
        .iter()
        .map(|metric| {
            let values: Vec<f64> = by_language
                .rows
                .iter()
                .filter_map(|(label, _)| by_language.value(label, *metric))
                .collect();
            let avg = mean(values.iter().copied().map(Some))?;
            let std = sample_std(&values)?;
            if avg == 0.0 {
                None
            } else {
                Some(std / avg)
            }
        })
        .collect();
    let max_impact = raw_impact.iter().flatten().fold(0.0f64, |acc, v| acc.max(v.abs()));

    CORRELATED_METRICS
        .iter()
        .zip(raw_impact)
        .map(|(metric, impact)| CorrelationRow {
            metric: *metric,
            task_complexity: ranked_correlation(&by_task, &task_ranks, *metric),
            language_impact: impact.map(|v| {
                if max_impact > 0.0 {
                    round_to(v / max_impact, 2)
                } else {
                    0.0
                }
            }),
            prompt_completeness: ranked_correlation(&by_completeness, &completeness_ranks, *metric),
        })
        .collect()
}

/// CSV form of the correlation table.
pub fn correlation_csv(rows: &[CorrelationRow]) -> String {
    let mut csv = String::from("Metric,Task Complexity,Language Impact,Prompt Completeness\n");
    for row in rows {
        csv.push_str(&format!(
            "{},{},{},{}\n",
            row.metric.label(),
            fmt_csv_number(row.task_complexity),
            fmt_csv_number(row.language_impact),
            fmt_csv_number(row.prompt_completeness)
        ));
    }
    csv
}

fn fmt_csv_number(value: Option<f64>) -> String {
    value.map(|v| format!("{:.2}", v)).unwrap_or_default()
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::RecordStatus;
    use crate::metrics::{FunctionalCorrectness, Robustness};
    use serde_json::json;

    fn metric(model: &str, task: &str, fc: f64) -> MetricRecord {
        MetricRecord {
            task_id: format!("python_{}_complete_{}", model, task),
            model: model.to_string(),
            language: "python".to_string(),
            completeness: "complete".to_string(),
            task_name: task.to_string(),
            valid: true,
            fc: FunctionalCorrectness {
                eqs: 1.0,
                tpr: 1.0,
                functional_correctness: fc,
            },
            readability: None,
            robustness: Robustness {
                null_handling_deficiency: 0.0,
                type_validation_deficiency: 0.0,
                input_validation_deficiency: 0.0,
                exception_handling_deficiency: 0.0,
                robustness: 100.0,
            },
            maintainability: None,
            security: None,
            hallucination: None,
            cqs: 0.0,
        }
    }

    #[test]
    fn test_pivot_with_averages() {
        let records = vec![
            metric("gpt", "task_1", 80.0),
            metric("gpt", "task_1", 90.0),
            metric("gpt", "task_2", 70.0),
            metric("claude", "task_1", 60.0),
        ];
        let pivot = pivot_mean(&records, Dimension::Model, MetricField::FunctionalCorrectness, 1);
        assert_eq!(pivot.columns, vec!["task_1", "task_2", "Average"]);
        assert_eq!(pivot.cell("gpt", "task_1"), Some(85.0));
        assert_eq!(pivot.cell("gpt", "Average"), Some(77.5));
        assert_eq!(pivot.cell("claude", "task_2"), None);
        assert_eq!(pivot.cell("claude", "Average"), Some(60.0));
        assert_eq!(pivot.cell("Average", "task_1"), Some(72.5));
        assert_eq!(pivot.cell("Average", "task_2"), Some(70.0));
        // mean of 77.5 and 60.0, before rounding 68.75
        assert_eq!(pivot.cell("Average", "Average"), Some(68.8));
    }

    #[test]
    fn test_pivot_single_task_has_no_average_column() {
        let records = vec![metric("gpt", "task_1", 50.0)];
        let pivot = pivot_mean(&records, Dimension::Model, MetricField::Cqs, 1);
        assert_eq!(pivot.columns, vec!["task_1"]);
        assert_eq!(pivot.rows.len(), 1);
    }

    #[test]
    fn test_error_type_distribution() {
        let record = |language: &str, error: serde_json::Value| MergedRecord {
            task_id: String::new(),
            status: RecordStatus::Valid,
            fields: json!({"language": language, "task_name": "task_1", "error_type": error})
                .as_object()
                .unwrap()
                .clone()
                .into_iter()
                .collect(),
        };
        let records = vec![
            record("python", json!("NameError")),
            record("python", json!("NameError")),
            record("go", json!("SyntaxError")),
            record("javascript", json!(null)),
        ];
        let table = error_type_distribution(&records, Dimension::Language);
        assert_eq!(table.columns, vec!["NameError", "SyntaxError"]);
        assert_eq!(
            table.rows,
            vec![
                ("go".to_string(), vec![0, 1]),
                ("javascript".to_string(), vec![0, 0]),
                ("python".to_string(), vec![2, 0]),
            ]
        );
    }

    fn scored(language: &str, completeness: &str, task: &str, fc: f64) -> MetricRecord {
        let mut record = metric("gpt", task, fc);
        record.language = language.to_string();
        record.completeness = completeness.to_string();
        record
    }

    #[test]
    fn test_dimension_means_csv() {
        let records = vec![
            scored("python", "complete", "task_1", 80.0),
            scored("python", "complete", "task_2", 60.0),
            scored("go", "complete", "task_1", 50.0),
        ];
        let means = dimension_means(&records, Dimension::Language);
        assert_eq!(means.value("python", MetricField::FunctionalCorrectness), Some(70.0));
        assert_eq!(means.value("go", MetricField::Readability), None);
        let csv = means.to_csv();
        let mut lines = csv.lines();
        assert_eq!(lines.next(), Some("language,FC,R,RB,M,S,HR,CQS"));
        assert_eq!(lines.next(), Some("go,50.00,,100.00,,,,0.00"));
        assert_eq!(lines.next(), Some("python,70.00,,100.00,,,,0.00"));
    }

    #[test]
    fn test_task_complexity_correlation() {
        let records = vec![
            scored("python", "complete", "task_1", 90.0),
            scored("python", "complete", "task_2", 80.0),
            scored("python", "complete", "task_3", 70.0),
        ];
        let rows = correlation(&records);
        let fc = &rows[0];
        assert_eq!(fc.metric, MetricField::FunctionalCorrectness);
        assert_eq!(fc.task_complexity, Some(-1.0));
        // one completeness level and one language: nothing to correlate
        assert_eq!(fc.prompt_completeness, None);
        assert_eq!(fc.language_impact, None);
        // robustness is flat across tasks
        let rb = rows.iter().find(|r| r.metric == MetricField::Robustness).unwrap();
        assert_eq!(rb.task_complexity, None);
    }

    #[test]
    fn test_prompt_completeness_and_language_impact() {
        let records = vec![
            scored("python", "minimal", "task_1", 50.0),
            scored("python", "partial", "task_1", 60.0),
            scored("go", "complete", "task_1", 70.0),
            scored("go", "complete", "task_1", 90.0),
        ];
        let rows = correlation(&records);
        let fc = &rows[0];
        // completeness means 50, 60, 80 against ranks 1, 2, 3
        let expected = pearson(&[1.0, 2.0, 3.0], &[50.0, 60.0, 80.0]).unwrap();
        assert_eq!(fc.prompt_completeness, Some(round_to(expected, 2)));
        // FC is the only metric that varies by language, so it scales to 1
        assert_eq!(fc.language_impact, Some(1.0));
        let rb = rows.iter().find(|r| r.metric == MetricField::Robustness).unwrap();
        assert_eq!(rb.language_impact, Some(0.0));
        let hr = rows.iter().find(|r| r.metric == MetricField::HallucinationRate).unwrap();
        assert_eq!(hr.language_impact, None);

        let csv = correlation_csv(&rows);
        assert!(csv.starts_with("Metric,Task Complexity,Language Impact,Prompt Completeness\n"));
        assert!(csv.contains("\nRB,,0.00,\n"));
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("fc".parse::<MetricField>(), Ok(MetricField::FunctionalCorrectness));
        assert_eq!("CQS".parse::<MetricField>(), Ok(MetricField::Cqs));
        assert!("speed".parse::<MetricField>().is_err());
        assert_eq!("task".parse::<Dimension>(), Ok(Dimension::Task));
    }
}
