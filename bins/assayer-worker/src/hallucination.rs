/// Explicit hallucination detection from the final execution attempt.
///
/// A failed run is inspected for signs that the program invented something:
/// a library that does not exist, a function that was never defined, an API
/// used the wrong way, or code that does not even parse.

use assayer_common::types::{
    CandidateId, ErrorType, ExecutionRecord, ExecutionStatus, ExplicitHallucinations,
    HallucinationRecord, TestResultRecord,
};
use chrono::Utc;
use tracing::debug;

const LIBRARY_PATTERNS: &[&str] = &["imported and not used", "no module named", "cannot find module"];

const UNDEFINED_PATTERNS: &[&str] = &[
    "undefined",
    "not defined",
    "name",
    "reference",
    "cannot read properties of undefined",
];

const API_PATTERNS: &[&str] = &[
    "argument",
    "method",
    "function",
    "property",
    "assignment to constant",
    "immutable",
    "invalid",
];

fn contains_any(text: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|p| text.contains(p))
}

/// Flags for one execution attempt. A successful attempt has no flags set.
pub fn detect(attempt: &ExecutionRecord) -> ExplicitHallucinations {
    if attempt.execution_status == ExecutionStatus::Success {
        return ExplicitHallucinations::default();
    }
    let msg = attempt.error_message.as_deref().unwrap_or_default().to_lowercase();
    let kind = attempt.error_type;

    ExplicitHallucinations {
        nonexistent_library: contains_any(&msg, LIBRARY_PATTERNS) || kind == Some(ErrorType::ImportError),
        undefined_function: contains_any(&msg, UNDEFINED_PATTERNS)
            || matches!(kind, Some(ErrorType::NameError) | Some(ErrorType::ReferenceError)),
        invalid_api_usage: (kind == Some(ErrorType::TypeError) && !msg.contains("undefined"))
            || contains_any(&msg, API_PATTERNS),
        syntax_error: msg.contains("syntax") || kind == Some(ErrorType::SyntaxError),
    }
}

/// Build the hallucination record from the last attempt and the candidate's test results.
pub fn build_record(
    id: &CandidateId,
    final_attempt: &ExecutionRecord,
    test_results: &[TestResultRecord],
) -> HallucinationRecord {
    let explicit_hallucinations = detect(final_attempt);
    if explicit_hallucinations.any() {
        debug!(task_id = %id, flags = ?explicit_hallucinations, "Explicit hallucination detected");
    }
    HallucinationRecord {
        id: id.clone(),
        explicit_hallucinations,
        test_passed_count: test_results.iter().filter(|r| r.test_passed).count(),
        test_total_count: test_results.len(),
        timestamp: Utc::now(),
    }
}
