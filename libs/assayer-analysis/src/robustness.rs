//! Robustness: how often a group of candidates fails in each weakness category.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NullHandling,
    TypeValidation,
    InputValidation,
    ExceptionHandling,
    Other,
}

/// Ordered signature table; the first category with a matching signature wins.
const CATEGORY_SIGNATURES: &[(ErrorCategory, &[&str])] = &[
    (
        ErrorCategory::NullHandling,
        &[
            "undefined",
            "null pointer",
            "keyerror",
            "cannot read properties of undefined",
            "nonetype",
            "typeerror: cannot read",
            "is not defined",
        ],
    ),
    (
        ErrorCategory::TypeValidation,
        &["typeerror", "cannot use", "not supported between", "cannot convert", "expected", "invalid type"],
    ),
    (
        ErrorCategory::InputValidation,
        &["valueerror", "invalid input", "out of range", "invalid argument", "indexerror"],
    ),
    (ErrorCategory::ExceptionHandling, &["exception", "error:", "uncaught", "unexpected"]),
];

/// Weighted categories; `Other` carries no penalty.
pub const CATEGORY_WEIGHTS: [(ErrorCategory, f64); 4] = [
    (ErrorCategory::NullHandling, 30.0),
    (ErrorCategory::TypeValidation, 25.0),
    (ErrorCategory::InputValidation, 30.0),
    (ErrorCategory::ExceptionHandling, 15.0),
];

/// Categorize an error message. Empty or absent messages have no category.
pub fn categorize(message: Option<&str>) -> Option<ErrorCategory> {
    let text = message?.to_lowercase();
    if text.trim().is_empty() {
        return None;
    }
    let category = CATEGORY_SIGNATURES
        .iter()
        .find(|(_, signatures)| signatures.iter().any(|s| text.contains(s)))
        .map(|(category, _)| *category)
        .unwrap_or(ErrorCategory::Other);
    Some(category)
}

/// Group-level robustness result shared by every member of the group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroupRobustness {
    /// Per-category deficiency in [0, 1], in `CATEGORY_WEIGHTS` order
    pub deficiencies: [f64; 4],
    pub score: f64,
}

impl GroupRobustness {
    pub fn from_categories(categories: &[Option<ErrorCategory>]) -> Self {
        let size = categories.len().max(1) as f64;
        let mut deficiencies = [0.0; 4];
        let mut penalty = 0.0;
        for (slot, (category, weight)) in CATEGORY_WEIGHTS.iter().enumerate() {
            let count = categories.iter().filter(|c| **c == Some(*category)).count() as f64;
            let deficiency = (count / size).min(1.0);
            deficiencies[slot] = deficiency;
            penalty += weight * deficiency;
        }
        Self {
            deficiencies,
            score: (100.0 - penalty).max(0.0),
        }
    }
}

/// Robustness for each group key, computed from its members' error messages.
pub fn score_groups<K: Ord + Clone>(members: &[(K, Option<&str>)]) -> BTreeMap<K, GroupRobustness> {
    let mut grouped: BTreeMap<K, Vec<Option<ErrorCategory>>> = BTreeMap::new();
    for (key, message) in members {
        grouped.entry(key.clone()).or_default().push(categorize(*message));
    }
    grouped
        .into_iter()
        .map(|(key, categories)| (key, GroupRobustness::from_categories(&categories)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_order() {
        assert_eq!(
            categorize(Some("TypeError: Cannot read properties of undefined (reading 'id')")),
            Some(ErrorCategory::NullHandling)
        );
        assert_eq!(
            categorize(Some("TypeError: '<' not supported between instances")),
            Some(ErrorCategory::TypeValidation)
        );
        assert_eq!(
            categorize(Some("IndexError: list index out of range")),
            Some(ErrorCategory::InputValidation)
        );
        assert_eq!(categorize(Some("ZeroDivisionError: division by zero")), Some(ErrorCategory::ExceptionHandling));
        assert_eq!(categorize(Some("killed")), Some(ErrorCategory::Other));
        assert_eq!(categorize(Some("")), None);
        assert_eq!(categorize(None), None);
    }

    #[test]
    fn test_clean_group_scores_full() {
        let group = GroupRobustness::from_categories(&[None, None]);
        assert_eq!(group.score, 100.0);
        assert_eq!(group.deficiencies, [0.0; 4]);
    }

    #[test]
    fn test_group_penalty() {
        let group = GroupRobustness::from_categories(&[
            Some(ErrorCategory::NullHandling),
            Some(ErrorCategory::TypeValidation),
            None,
            None,
        ]);
        // 30 * 0.25 + 25 * 0.25
        assert!((group.score - 86.25).abs() < 1e-9);
        assert_eq!(group.deficiencies[0], 0.25);
    }

    #[test]
    fn test_score_groups_shares_result() {
        let members = vec![
            ("a", Some("KeyError: 'x'")),
            ("a", None),
            ("b", Some("Uncaught exception in handler")),
        ];
        let scores = score_groups(&members);
        assert!((scores["a"].score - 85.0).abs() < 1e-9);
        assert!((scores["b"].score - 85.0).abs() < 1e-9);
        assert!(scores.values().all(|g| g.score >= 0.0));
    }
}
