//! Metrics Engine: turns merged records into comparable 0–100 quality scores.
//!
//! Scoring is two-pass. [`PopulationStats`] first derives normalization
//! thresholds from the valid population (95th percentiles with floors), then
//! every record is scored against those fixed thresholds. Each normalized
//! ratio is clipped to [0, 1] before it is combined, and a missing raw
//! measurement normalizes to 0.5.

use crate::merge::MergedRecord;
use crate::robustness::{score_groups, GroupRobustness};
use crate::stats::{mean, quantile};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Raw keys that make a record count as statically analyzed.
const STATIC_FIELDS: [&str; 12] = [
    "cyclomatic_complexity",
    "cognitive_complexity",
    "comment_coverage",
    "code_redundancy",
    "lines_of_code",
    "maintainability_rating",
    "technical_debt",
    "bugs",
    "vulnerabilities",
    "code_smells",
    "security_rating",
    "reliability_rating",
];

const MISSING_NORM: f64 = 0.5;
const MISSING_SQ_MR: f64 = 50.0;

/// Error-quality weight per error kind; unknown kinds fall back to 0.7 penalty (EQS 0.3).
fn error_weight(error_type: &str) -> f64 {
    match error_type {
        "SyntaxError" | "ImportError" | "NameError" | "TypeError" | "RuntimeError" | "AttributeError" => 0.7,
        "ValueError" | "KeyError" | "IndexError" => 0.4,
        _ => 0.7,
    }
}

/// Measurements of one merged record, with missing values kept as `None`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CandidateMeasures {
    pub execution_succeeded: bool,
    pub error_type: Option<String>,
    pub error_message: Option<String>,
    pub test_passed: Option<f64>,
    pub test_total: Option<f64>,
    pub has_static: bool,
    pub cyclomatic_complexity: Option<f64>,
    pub cognitive_complexity: Option<f64>,
    pub comment_coverage: Option<f64>,
    pub code_redundancy: Option<f64>,
    pub lines_of_code: Option<f64>,
    pub maintainability_rating: Option<f64>,
    pub technical_debt: Option<f64>,
    pub bugs: Option<f64>,
    pub vulnerabilities: Option<f64>,
    pub code_smells: Option<f64>,
    pub security_rating: Option<f64>,
    pub reliability_rating: Option<f64>,
    /// Four explicit-hallucination flags; `None` when the stage never ran
    pub hallucinations: Option<[bool; 4]>,
}

impl CandidateMeasures {
    pub fn from_merged(record: &MergedRecord) -> Self {
        let code_smells = record.get_f64("code_smells").or_else(|| {
            record
                .get("issues")
                .and_then(|issues| issues.get("total"))
                .and_then(assayer_common::types::numeric)
        });
        let hallucinations = match record.get("explicit_hallucinations") {
            Some(Value::Object(flags)) => {
                let flag = |key: &str| flags.get(key).and_then(Value::as_bool).unwrap_or(false);
                Some([
                    flag("nonexistent_library"),
                    flag("undefined_function"),
                    flag("invalid_api_usage"),
                    flag("syntax_error"),
                ])
            }
            _ => None,
        };

        Self {
            execution_succeeded: record.get_str("execution_status") == Some("success"),
            error_type: record.get_str("error_type").map(str::to_string),
            error_message: record.get_str("error_message").map(str::to_string),
            test_passed: record.get_f64("test_passed_count"),
            test_total: record.get_f64("test_total_count"),
            has_static: STATIC_FIELDS.iter().any(|key| record.fields.contains_key(*key)),
            cyclomatic_complexity: record.get_f64("cyclomatic_complexity"),
            cognitive_complexity: record.get_f64("cognitive_complexity"),
            comment_coverage: record.get_f64("comment_coverage"),
            code_redundancy: record.get_f64("code_redundancy"),
            lines_of_code: record.get_f64("lines_of_code"),
            maintainability_rating: record.get_f64("maintainability_rating"),
            technical_debt: record.get_f64("technical_debt"),
            bugs: record.get_f64("bugs"),
            vulnerabilities: record.get_f64("vulnerabilities"),
            code_smells,
            security_rating: record.get_f64("security_rating"),
            reliability_rating: record.get_f64("reliability_rating"),
            hallucinations,
        }
    }

    /// Passed ÷ total, only when a positive total is known.
    fn pass_ratio(&self) -> Option<f64> {
        match (self.test_passed, self.test_total) {
            (Some(passed), Some(total)) if total > 0.0 => Some((passed / total).clamp(0.0, 1.0)),
            _ => None,
        }
    }
}

/// Normalization thresholds derived from the valid population.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PopulationStats {
    pub max_cc: f64,
    pub max_cog: f64,
    pub max_cs: f64,
    pub max_td: f64,
    pub max_vulns: f64,
    pub max_bugs: f64,
}

impl PopulationStats {
    pub fn from_measures(population: &[CandidateMeasures]) -> Self {
        let p95 = |f: fn(&CandidateMeasures) -> Option<f64>| quantile(population.iter().map(f), 0.95);
        let floor = |value: Option<f64>, min: f64| value.map_or(min, |v| v.max(min));

        let mean_loc = mean(population.iter().map(|m| m.lines_of_code)).unwrap_or(1000.0);
        Self {
            max_cc: floor(p95(|m| m.cyclomatic_complexity), 10.0),
            max_cog: floor(p95(|m| m.cognitive_complexity), 15.0),
            max_cs: (5.0 * mean_loc / 1000.0).max(5.0),
            max_td: floor(p95(|m| m.technical_debt), 20.0),
            max_vulns: floor(p95(|m| m.vulnerabilities), 3.0),
            max_bugs: floor(p95(|m| m.bugs), 3.0),
        }
    }
}

fn clip(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

/// raw ÷ threshold clipped to [0, 1]; missing → 0.5
fn normalize(raw: Option<f64>, threshold: f64) -> f64 {
    match raw {
        Some(v) if threshold > 0.0 => clip(v / threshold),
        _ => MISSING_NORM,
    }
}

/// 1..5 rating (1 best) mapped so that 1 → 1.0 and 5 → 0.2; out-of-range counts as missing.
fn rating_ratio(rating: Option<f64>) -> f64 {
    match rating {
        Some(r) if (1.0..=5.0).contains(&r) => clip((6.0 - r) / 5.0),
        _ => MISSING_NORM,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionalCorrectness {
    pub eqs: f64,
    pub tpr: f64,
    pub functional_correctness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Readability {
    pub norm_cc: f64,
    pub norm_cog: f64,
    pub norm_cr: f64,
    pub norm_dup: f64,
    pub norm_cs: f64,
    pub readability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Robustness {
    pub null_handling_deficiency: f64,
    pub type_validation_deficiency: f64,
    pub input_validation_deficiency: f64,
    pub exception_handling_deficiency: f64,
    pub robustness: f64,
}

impl From<GroupRobustness> for Robustness {
    fn from(group: GroupRobustness) -> Self {
        let [null, typ, input, exception] = group.deficiencies;
        Self {
            null_handling_deficiency: null * 100.0,
            type_validation_deficiency: typ * 100.0,
            input_validation_deficiency: input * 100.0,
            exception_handling_deficiency: exception * 100.0,
            robustness: group.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Maintainability {
    pub sq_mr: f64,
    pub norm_td: f64,
    pub cms: f64,
    pub maintainability: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Security {
    pub norm_vulns: f64,
    pub norm_bugs: f64,
    pub norm_sr: f64,
    pub norm_rr: f64,
    pub security: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HallucinationRate {
    pub ehs: f64,
    pub ihr: f64,
    pub hallucination_rate: f64,
}

/// All scores for one candidate. Unavailable sub-scores are absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub task_id: String,
    pub model: String,
    pub language: String,
    pub completeness: String,
    pub task_name: String,
    pub valid: bool,
    #[serde(flatten)]
    pub fc: FunctionalCorrectness,
    #[serde(flatten)]
    pub readability: Option<Readability>,
    #[serde(flatten)]
    pub robustness: Robustness,
    #[serde(flatten)]
    pub maintainability: Option<Maintainability>,
    #[serde(flatten)]
    pub security: Option<Security>,
    #[serde(flatten)]
    pub hallucination: Option<HallucinationRate>,
    pub cqs: f64,
}

pub fn functional_correctness(m: &CandidateMeasures) -> FunctionalCorrectness {
    let eqs = if m.execution_succeeded {
        1.0
    } else {
        match m.error_type.as_deref() {
            Some(kind) => 1.0 - error_weight(kind),
            None => 1.0,
        }
    };
    let tpr = m.pass_ratio().unwrap_or(0.0);
    FunctionalCorrectness {
        eqs,
        tpr,
        functional_correctness: (0.3 * eqs + 0.7 * tpr) * 100.0,
    }
}

pub fn readability(m: &CandidateMeasures, stats: &PopulationStats) -> Readability {
    let norm_cc = normalize(m.cyclomatic_complexity, stats.max_cc);
    let norm_cog = normalize(m.cognitive_complexity, stats.max_cog);
    let norm_cr = normalize(m.comment_coverage, 100.0);
    let norm_dup = normalize(m.code_redundancy, 100.0);
    let norm_cs = normalize(m.code_smells, stats.max_cs);
    let penalty = 0.3 * norm_cc + 0.3 * norm_cog + 0.2 * (1.0 - norm_cr) + 0.15 * norm_dup + 0.05 * norm_cs;
    Readability {
        norm_cc,
        norm_cog,
        norm_cr,
        norm_dup,
        norm_cs,
        readability: 100.0 - penalty * 100.0,
    }
}

pub fn maintainability(m: &CandidateMeasures, stats: &PopulationStats) -> Maintainability {
    let sq_mr = match m.maintainability_rating {
        Some(r) if (1.0..=5.0).contains(&r) => (6.0 - r) * 20.0,
        _ => MISSING_SQ_MR,
    };
    let norm_cc = normalize(m.cyclomatic_complexity, stats.max_cc);
    let norm_cog = normalize(m.cognitive_complexity, stats.max_cog);
    let norm_cr = normalize(m.comment_coverage, 100.0);
    let norm_dup = normalize(m.code_redundancy, 100.0);
    let norm_td = normalize(m.technical_debt, stats.max_td);
    let penalty = 0.3 * norm_cc + 0.3 * norm_cog + 0.15 * (1.0 - norm_cr) + 0.15 * norm_dup + 0.1 * norm_td;
    let cms = 100.0 - penalty * 100.0;
    Maintainability {
        sq_mr,
        norm_td,
        cms,
        maintainability: 0.7 * sq_mr + 0.3 * cms,
    }
}

pub fn security(m: &CandidateMeasures, stats: &PopulationStats) -> Security {
    let norm_vulns = normalize(m.vulnerabilities, stats.max_vulns);
    let norm_bugs = normalize(m.bugs, stats.max_bugs);
    let norm_sr = rating_ratio(m.security_rating);
    let norm_rr = rating_ratio(m.reliability_rating);
    let penalty = 0.4 * norm_vulns + 0.3 * (1.0 - norm_sr) + 0.2 * (1.0 - norm_rr) + 0.1 * norm_bugs;
    Security {
        norm_vulns,
        norm_bugs,
        norm_sr,
        norm_rr,
        security: 100.0 - penalty * 100.0,
    }
}

/// `None` when the hallucination stage never produced flags for this record.
pub fn hallucination_rate(m: &CandidateMeasures) -> Option<HallucinationRate> {
    const WEIGHTS: [f64; 4] = [0.3, 0.3, 0.25, 0.15];
    let flags = m.hallucinations?;
    let ehs: f64 = flags
        .iter()
        .zip(WEIGHTS)
        .filter(|(set, _)| **set)
        .map(|(_, weight)| weight)
        .sum();
    let ihr = m.pass_ratio().map_or(MISSING_NORM, |ratio| 1.0 - ratio);
    Some(HallucinationRate {
        ehs,
        ihr,
        hallucination_rate: 0.6 * ehs + 0.4 * ihr,
    })
}

/// Weighted sum of the available sub-scores. Missing parts are dropped
/// without renormalizing the remaining weights.
pub fn comprehensive_quality(
    fc: &FunctionalCorrectness,
    readability: Option<&Readability>,
    robustness: &Robustness,
    maintainability: Option<&Maintainability>,
    security: Option<&Security>,
    hallucination: Option<&HallucinationRate>,
) -> f64 {
    0.3 * fc.functional_correctness
        + readability.map_or(0.0, |r| 0.2 * r.readability)
        + 0.2 * robustness.robustness
        + maintainability.map_or(0.0, |m| 0.15 * m.maintainability)
        + security.map_or(0.0, |s| 0.1 * s.security)
        + hallucination.map_or(0.0, |h| 0.05 * (100.0 - h.hallucination_rate * 100.0))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsOptions {
    /// Also score invalid records, against the valid population's thresholds
    pub include_invalid: bool,
}

type GroupKey = (String, String, String, String);

fn dimension(record: &MergedRecord, key: &str) -> String {
    record.get_str(key).unwrap_or_default().to_string()
}

/// Score merged records. Output follows input order.
pub fn compute_metrics(records: &[MergedRecord], options: MetricsOptions) -> Vec<MetricRecord> {
    let measures: Vec<CandidateMeasures> = records.iter().map(CandidateMeasures::from_merged).collect();

    let population: Vec<CandidateMeasures> = records
        .iter()
        .zip(&measures)
        .filter(|(record, _)| record.is_valid())
        .map(|(_, m)| m.clone())
        .collect();
    let stats = PopulationStats::from_measures(&population);

    let scored: Vec<(&MergedRecord, &CandidateMeasures)> = records
        .iter()
        .zip(&measures)
        .filter(|(record, _)| options.include_invalid || record.is_valid())
        .collect();

    let group_key = |record: &MergedRecord| -> GroupKey {
        (
            dimension(record, "model"),
            dimension(record, "language"),
            dimension(record, "completeness"),
            dimension(record, "task_name"),
        )
    };
    let members: Vec<(GroupKey, Option<&str>)> = scored
        .iter()
        .map(|(record, m)| (group_key(record), m.error_message.as_deref()))
        .collect();
    let groups = score_groups(&members);

    scored
        .into_iter()
        .map(|(record, m)| {
            let fc = functional_correctness(m);
            let robustness = groups
                .get(&group_key(record))
                .copied()
                .map(Robustness::from)
                .unwrap_or_else(|| Robustness::from(GroupRobustness::from_categories(&[])));
            let (readability, maintainability, security) = if m.has_static {
                (
                    Some(readability(m, &stats)),
                    Some(maintainability(m, &stats)),
                    Some(security(m, &stats)),
                )
            } else {
                (None, None, None)
            };
            let hallucination = hallucination_rate(m);
            let cqs = comprehensive_quality(
                &fc,
                readability.as_ref(),
                &robustness,
                maintainability.as_ref(),
                security.as_ref(),
                hallucination.as_ref(),
            );
            MetricRecord {
                task_id: record.task_id.clone(),
                model: dimension(record, "model"),
                language: dimension(record, "language"),
                completeness: dimension(record, "completeness"),
                task_name: dimension(record, "task_name"),
                valid: record.is_valid(),
                fc,
                readability,
                robustness,
                maintainability,
                security,
                hallucination,
                cqs,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::RecordStatus;
    use serde_json::json;

    fn merged(task_id: &str, status: RecordStatus, fields: Value) -> MergedRecord {
        let mut base = json!({
            "language": "python",
            "model": "gpt",
            "completeness": "complete",
            "task_name": "task_1",
        });
        for (k, v) in fields.as_object().unwrap() {
            base[k] = v.clone();
        }
        MergedRecord {
            task_id: task_id.to_string(),
            status,
            fields: base.as_object().unwrap().clone().into_iter().collect(),
        }
    }

    fn perfect() -> MergedRecord {
        merged(
            "python_gpt_complete_task_1",
            RecordStatus::Valid,
            json!({
                "execution_status": "success",
                "error_type": null,
                "error_message": null,
                "test_passed_count": 3,
                "test_total_count": 3,
                "cyclomatic_complexity": 2,
                "cognitive_complexity": 1,
                "comment_coverage": 20.0,
                "code_redundancy": 0.0,
                "lines_of_code": 40,
                "maintainability_rating": 1.0,
                "technical_debt": 0,
                "bugs": 0,
                "vulnerabilities": 0,
                "code_smells": 0,
                "security_rating": 1.0,
                "reliability_rating": 1.0,
                "explicit_hallucinations": {
                    "nonexistent_library": false,
                    "undefined_function": false,
                    "invalid_api_usage": false,
                    "syntax_error": false
                }
            }),
        )
    }

    #[test]
    fn test_all_tests_passed_gives_full_fc() {
        let scores = compute_metrics(&[perfect()], MetricsOptions::default());
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].fc.tpr, 1.0);
        assert_eq!(scores[0].fc.eqs, 1.0);
        assert!((scores[0].fc.functional_correctness - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_clean_security_gives_full_score() {
        let scores = compute_metrics(&[perfect()], MetricsOptions::default());
        let security = scores[0].security.as_ref().unwrap();
        assert!((security.security - 100.0).abs() < 1e-9);
        let hr = scores[0].hallucination.as_ref().unwrap();
        assert_eq!(hr.hallucination_rate, 0.0);
    }

    #[test]
    fn test_eqs_weights() {
        let failing = |kind: Value| CandidateMeasures::from_merged(&merged(
            "x",
            RecordStatus::Valid,
            json!({"execution_status": "failure", "error_type": kind}),
        ));
        let eqs = |kind: Value| functional_correctness(&failing(kind)).eqs;
        assert!((eqs(json!("SyntaxError")) - 0.3).abs() < 1e-9);
        assert!((eqs(json!("KeyError")) - 0.6).abs() < 1e-9);
        assert!((eqs(json!("TimeoutError")) - 0.3).abs() < 1e-9);
        assert_eq!(eqs(Value::Null), 1.0);
    }

    #[test]
    fn test_missing_totals() {
        let record = merged(
            "python_gpt_complete_task_1",
            RecordStatus::Valid,
            json!({
                "execution_status": "failure",
                "error_type": "RuntimeError",
                "test_passed_count": 0,
                "test_total_count": 0,
                "explicit_hallucinations": {"syntax_error": true}
            }),
        );
        let scores = compute_metrics(&[record], MetricsOptions::default());
        assert_eq!(scores[0].fc.tpr, 0.0);
        let hr = scores[0].hallucination.as_ref().unwrap();
        assert_eq!(hr.ihr, 0.5);
        assert!((hr.ehs - 0.15).abs() < 1e-9);
        // no static fields at all
        assert!(scores[0].readability.is_none());
        assert!(scores[0].maintainability.is_none());
        assert!(scores[0].security.is_none());
    }

    #[test]
    fn test_cqs_drops_unavailable_parts() {
        let record = merged(
            "python_gpt_complete_task_1",
            RecordStatus::Valid,
            json!({"execution_status": "success", "test_passed_count": 2, "test_total_count": 2}),
        );
        let scores = compute_metrics(&[record], MetricsOptions::default());
        // 0.3 * 100 + 0.2 * 100, nothing else available
        assert!((scores[0].cqs - 50.0).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_records_excluded_by_default() {
        let mut invalid = perfect();
        invalid.task_id = "python_gpt_minimal_task_1".to_string();
        invalid.status = RecordStatus::Invalid;
        let records = vec![perfect(), invalid];

        assert_eq!(compute_metrics(&records, MetricsOptions::default()).len(), 1);
        let all = compute_metrics(&records, MetricsOptions { include_invalid: true });
        assert_eq!(all.len(), 2);
        assert!(!all[1].valid);
    }

    #[test]
    fn test_thresholds_use_floors_and_p95() {
        let mut population = vec![CandidateMeasures::default(); 4];
        for (i, m) in population.iter_mut().enumerate() {
            m.cyclomatic_complexity = Some(10.0 * (i as f64 + 1.0));
            m.lines_of_code = Some(3000.0);
        }
        let stats = PopulationStats::from_measures(&population);
        // p95 of [10, 20, 30, 40] = 30 + 0.85 * 10
        assert!((stats.max_cc - 38.5).abs() < 1e-9);
        assert_eq!(stats.max_cog, 15.0);
        assert_eq!(stats.max_cs, 15.0);
        assert_eq!(stats.max_vulns, 3.0);
        assert_eq!(PopulationStats::from_measures(&[]).max_cs, 5.0);
    }

    #[test]
    fn test_scores_stay_in_bounds() {
        let extreme = merged(
            "python_gpt_complete_task_1",
            RecordStatus::Valid,
            json!({
                "execution_status": "failure",
                "error_type": "TypeError",
                "error_message": "TypeError: cannot read properties of undefined",
                "test_passed_count": 0,
                "test_total_count": 5,
                "cyclomatic_complexity": 500,
                "cognitive_complexity": -3,
                "comment_coverage": 250.0,
                "code_redundancy": 100.0,
                "maintainability_rating": 9,
                "technical_debt": 10000,
                "bugs": 99,
                "vulnerabilities": 99,
                "security_rating": 5,
                "reliability_rating": 0
            }),
        );
        let scores = compute_metrics(&[extreme, perfect()], MetricsOptions::default());
        for score in &scores {
            let fc = score.fc.functional_correctness;
            assert!((0.0..=100.0).contains(&fc));
            assert!((0.0..=1.0).contains(&score.fc.tpr));
            assert!((0.0..=1.0).contains(&score.fc.eqs));
            assert!(score.robustness.robustness >= 0.0);
            for value in [
                score.readability.as_ref().unwrap().readability,
                score.maintainability.as_ref().unwrap().maintainability,
                score.security.as_ref().unwrap().security,
            ] {
                assert!((0.0..=100.0).contains(&value), "out of bounds: {}", value);
            }
        }
    }

    #[test]
    fn test_metrics_are_idempotent() {
        let records = vec![perfect()];
        let a = serde_json::to_string(&compute_metrics(&records, MetricsOptions::default())).unwrap();
        let b = serde_json::to_string(&compute_metrics(&records, MetricsOptions::default())).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_code_smells_fall_back_to_issue_total() {
        let record = merged("x", RecordStatus::Valid, json!({"issues": {"total": 4}}));
        assert_eq!(CandidateMeasures::from_merged(&record).code_smells, Some(4.0));
    }
}
