/// Test Evaluator - Language-Agnostic Verdict Logic
///
/// **Core Responsibility:**
/// Build the stdin payload for each test case and judge one harness outcome
/// against the expected mapping.
///
/// **Critical Properties:**
/// - Knows nothing about processes or interpreters
/// - Pure functions: (template, case) → payload, (outcome, expected) → verdict
///
/// **Comparison Rules:**
/// - stdout must parse as exactly one JSON value, and that value must be an object
/// - Objects compare structurally, key order is irrelevant
/// - Numbers compare exactly, but `1` and `1.0` are the same number
/// - Any failed, malformed or non-object run yields a diagnostic string as
///   `actual_output` instead of the raw bytes

use crate::engine::{extract_key_error, ExecutionOutcome};
use assayer_common::types::TestCase;
use serde_json::{Map, Number, Value};

/// Verdict for a single test case
#[derive(Debug, Clone, PartialEq)]
pub struct CaseVerdict {
    pub passed: bool,
    /// Parsed output mapping on a well-formed run, otherwise a diagnostic string
    pub actual: Value,
}

impl CaseVerdict {
    fn failed(diagnostic: impl Into<String>) -> Self {
        Self {
            passed: false,
            actual: Value::String(diagnostic.into()),
        }
    }
}

/// Structural equality with key-order independence and 1 == 1.0
pub fn deep_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| deep_equal(x, y))
        }
        (Value::Object(xm), Value::Object(ym)) => {
            xm.len() == ym.len()
                && xm
                    .iter()
                    .all(|(key, x)| ym.get(key).map_or(false, |y| deep_equal(x, y)))
        }
        _ => false,
    }
}

/// Exact numeric equality. Integers compare as integers; an integer equals a
/// float only when the float is integral and converts to exactly that integer.
fn numbers_equal(x: &Number, y: &Number) -> bool {
    match (x.as_f64(), y.as_f64(), x.is_f64(), y.is_f64()) {
        (Some(a), Some(b), true, true) => a == b,
        (Some(a), _, true, false) => float_equals_integer(a, y),
        (_, Some(b), false, true) => float_equals_integer(b, x),
        _ => match (x.as_i64(), y.as_i64()) {
            (Some(a), Some(b)) => a == b,
            _ => matches!((x.as_u64(), y.as_u64()), (Some(a), Some(b)) if a == b),
        },
    }
}

fn float_equals_integer(f: f64, n: &Number) -> bool {
    if !f.is_finite() || f.fract() != 0.0 {
        return false;
    }
    if let Some(i) = n.as_i64() {
        return f >= i64::MIN as f64 && f < i64::MAX as f64 && f as i64 == i;
    }
    if let Some(u) = n.as_u64() {
        return f >= 0.0 && f < u64::MAX as f64 && f as u64 == u;
    }
    false
}

/// Build the stdin payload for one case.
///
/// Each template field is either a literal or a reference string such as
/// `case['patient']`, `case.patient.id` or `test_cases['wards'][0]`.
/// References are resolved recursively inside arrays and objects; anything
/// that does not resolve stays literal. An empty template sends the case's
/// own fields.
pub fn build_payload(template: &Map<String, Value>, case: &TestCase, document: &Value) -> Value {
    if template.is_empty() {
        return Value::Object(case.fields.clone());
    }
    let case_value = serde_json::to_value(case).unwrap_or(Value::Null);
    let resolved = template
        .iter()
        .map(|(key, value)| (key.clone(), resolve_value(value, &case_value, document)))
        .collect();
    Value::Object(resolved)
}

fn resolve_value(value: &Value, case_value: &Value, document: &Value) -> Value {
    match value {
        Value::String(expr) => resolve_reference(expr, case_value, document).unwrap_or_else(|| value.clone()),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| resolve_value(item, case_value, document))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_value(v, case_value, document)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[derive(Debug, PartialEq)]
enum Accessor {
    Key(String),
    Index(usize),
}

/// Resolve a reference expression, or `None` if it is not one or does not resolve.
fn resolve_reference(expr: &str, case_value: &Value, document: &Value) -> Option<Value> {
    let expr = expr.trim();
    let (root, rest) = if let Some(rest) = expr.strip_prefix("test_cases") {
        (document, rest)
    } else if let Some(rest) = expr.strip_prefix("case") {
        (case_value, rest)
    } else {
        return None;
    };

    let accessors = parse_accessors(rest)?;
    if accessors.is_empty() {
        return None;
    }

    let mut current = root;
    for accessor in &accessors {
        current = match (accessor, current) {
            (Accessor::Key(key), Value::Object(map)) => map.get(key)?,
            (Accessor::Index(idx), Value::Array(items)) => items.get(*idx)?,
            (Accessor::Key(key), Value::Array(items)) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

/// Parse `['a']["b"][0].c` into accessors. Returns `None` on any syntax it does not know.
fn parse_accessors(mut rest: &str) -> Option<Vec<Accessor>> {
    let mut out = Vec::new();
    while !rest.is_empty() {
        if let Some(after) = rest.strip_prefix('[') {
            let close = after.find(']')?;
            let inner = after[..close].trim();
            let accessor = if let Some(key) = unquote(inner) {
                Accessor::Key(key.to_string())
            } else {
                Accessor::Index(inner.parse().ok()?)
            };
            out.push(accessor);
            rest = &after[close + 1..];
        } else if let Some(after) = rest.strip_prefix('.') {
            let end = after
                .find(|c: char| c == '.' || c == '[')
                .unwrap_or(after.len());
            let key = &after[..end];
            if key.is_empty() || !key.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return None;
            }
            out.push(Accessor::Key(key.to_string()));
            rest = &after[end..];
        } else {
            return None;
        }
    }
    Some(out)
}

fn unquote(s: &str) -> Option<&str> {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'\'' || first == b'"') && first == last {
            return Some(&s[1..s.len() - 1]);
        }
    }
    None
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Judge one harness outcome against the expected mapping.
///
/// With `strict_stderr`, a zero exit that still wrote to stderr is a failure.
pub fn evaluate_case(outcome: &ExecutionOutcome, expected: &Value, strict_stderr: bool) -> CaseVerdict {
    if !outcome.success {
        let raw = outcome.error_message.as_deref().unwrap_or(&outcome.stderr);
        let key = extract_key_error(raw);
        return if key.is_empty() {
            let kind = outcome.error_type.map(|t| t.as_str()).unwrap_or("RuntimeError");
            CaseVerdict::failed(format!("{} (exit code {})", kind, outcome.exit_code))
        } else {
            CaseVerdict::failed(key)
        };
    }

    if strict_stderr && !outcome.stderr.trim().is_empty() {
        return CaseVerdict::failed(format!(
            "Unexpected stderr output: {}",
            extract_key_error(&outcome.stderr)
        ));
    }

    let stdout = outcome.stdout.trim();
    match serde_json::from_str::<Value>(stdout) {
        Ok(actual @ Value::Object(_)) => CaseVerdict {
            passed: expected.is_object() && deep_equal(&actual, expected),
            actual,
        },
        Ok(other) => CaseVerdict::failed(format!(
            "Invalid output format: expected object, got {}",
            kind_of(&other)
        )),
        Err(_) => {
            let preview: String = stdout.chars().take(100).collect();
            CaseVerdict::failed(format!("Invalid JSON output: {}", preview))
        }
    }
}
