use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::{Path, PathBuf};

/// Source languages the harness knows how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    Go,
}

impl Language {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "python" | "py" => Some(Language::Python),
            "javascript" | "js" | "node" => Some(Language::JavaScript),
            "go" | "golang" => Some(Language::Go),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Go => "go",
        }
    }

    /// Extension used for `Solution.{ext}` when no language config overrides it.
    pub fn default_extension(&self) -> &'static str {
        match self {
            Language::Python => "py",
            Language::JavaScript => "js",
            Language::Go => "go",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one generated program: (language, model, completeness, task).
///
/// Serialized flat into every stage record, so each log line carries both the
/// joined `task_id` key and the four dimensions it was derived from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CandidateId {
    pub task_id: String,
    pub language: Language,
    pub model: String,
    pub completeness: String,
    pub task_name: String,
}

impl CandidateId {
    pub fn new(
        language: Language,
        model: impl Into<String>,
        completeness: impl Into<String>,
        task_name: impl Into<String>,
    ) -> Self {
        let model = model.into().to_lowercase();
        let completeness = completeness.into();
        let task_name = task_name.into();
        let task_id = Self::compose_key(language, &model, &completeness, &task_name);
        Self {
            task_id,
            language,
            model,
            completeness,
            task_name,
        }
    }

    /// `{language}_{model}_{completeness}_{task_name}`
    pub fn compose_key(language: Language, model: &str, completeness: &str, task_name: &str) -> String {
        format!(
            "{}_{}_{}_{}",
            language,
            model.to_lowercase(),
            completeness,
            task_name
        )
    }

    /// True when `task_id` is exactly the key derived from the four dimensions.
    pub fn is_consistent(&self) -> bool {
        self.task_id == Self::compose_key(self.language, &self.model, &self.completeness, &self.task_name)
    }

    /// Recover an identity from `{codes_dir}/{language}/{model}/{completeness}/{task}/Solution.{ext}`.
    pub fn from_solution_path(codes_dir: &Path, path: &Path) -> Option<Self> {
        let relative = path.strip_prefix(codes_dir).ok()?;
        let parts: Vec<&str> = relative
            .components()
            .filter_map(|c| c.as_os_str().to_str())
            .collect();
        match parts.as_slice() {
            [language, model, completeness, task, file] if file.starts_with("Solution.") => {
                let language = Language::from_str(language)?;
                Some(Self::new(language, *model, *completeness, *task))
            }
            _ => None,
        }
    }

    /// Where the candidate program for this identity lives on disk.
    pub fn solution_path(&self, codes_dir: &Path, extension: &str) -> PathBuf {
        codes_dir
            .join(self.language.as_str())
            .join(&self.model)
            .join(&self.completeness)
            .join(&self.task_name)
            .join(format!("Solution.{}", extension.trim_start_matches('.')))
    }
}

impl fmt::Display for CandidateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.task_id)
    }
}

/// Failure taxonomy reported by the execution harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorType {
    TimeoutError,
    CompilationError,
    SyntaxError,
    ReferenceError,
    NameError,
    TypeError,
    ImportError,
    ValueError,
    KeyError,
    IndexError,
    AttributeError,
    RuntimeError,
    UnknownError,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::TimeoutError => "TimeoutError",
            ErrorType::CompilationError => "CompilationError",
            ErrorType::SyntaxError => "SyntaxError",
            ErrorType::ReferenceError => "ReferenceError",
            ErrorType::NameError => "NameError",
            ErrorType::TypeError => "TypeError",
            ErrorType::ImportError => "ImportError",
            ErrorType::ValueError => "ValueError",
            ErrorType::KeyError => "KeyError",
            ErrorType::IndexError => "IndexError",
            ErrorType::AttributeError => "AttributeError",
            ErrorType::RuntimeError => "RuntimeError",
            ErrorType::UnknownError => "UnknownError",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenerationStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failure,
}

/// Best-effort resource usage of a candidate process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// User + system CPU seconds
    pub cpu_time: f64,
    /// Resident set size in MB at the last sample
    pub memory_usage: f64,
    /// Highest resident set size observed, in MB
    pub peak_memory_usage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    #[serde(flatten)]
    pub id: CandidateId,
    pub generation_status: GenerationStatus,
    pub generation_error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Outcome of exactly one harness invocation. One line per attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    #[serde(flatten)]
    pub id: CandidateId,
    pub execution_status: ExecutionStatus,
    pub error_type: Option<ErrorType>,
    pub error_message: Option<String>,
    pub exit_code: i32,
    pub retry_count: u32,
    pub duration: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResultRecord {
    #[serde(flatten)]
    pub id: CandidateId,
    pub test_case_id: String,
    pub expected_output: Value,
    /// The parsed mapping on a well-formed run, otherwise a diagnostic string.
    pub actual_output: Value,
    pub test_passed: bool,
    pub execution_duration: f64,
    pub memory_usage: f64,
    pub cpu_time: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticAnalysisRecord {
    #[serde(flatten)]
    pub id: CandidateId,
    pub file_path: Option<String>,
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
    pub timestamp: DateTime<Utc>,
}

impl StaticAnalysisRecord {
    /// Map a raw analyzer measurement vector onto the record's field names.
    ///
    /// Values may be JSON numbers or numeric strings; anything else is treated
    /// as missing.
    pub fn from_measures(id: CandidateId, file_path: Option<String>, measures: &Map<String, Value>) -> Self {
        let m = |key: &str| measures.get(key).and_then(numeric);
        Self {
            id,
            file_path,
            cyclomatic_complexity: m("complexity"),
            cognitive_complexity: m("cognitive_complexity"),
            comment_coverage: m("comment_lines_density"),
            code_redundancy: m("duplicated_lines_density"),
            lines_of_code: m("ncloc"),
            maintainability_rating: m("sqale_rating"),
            technical_debt: m("sqale_index"),
            bugs: m("bugs"),
            vulnerabilities: m("vulnerabilities"),
            code_smells: m("code_smells"),
            security_rating: m("security_rating"),
            reliability_rating: m("reliability_rating"),
            timestamp: Utc::now(),
        }
    }
}

/// Read a JSON number, or a string holding one.
pub fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExplicitHallucinations {
    pub nonexistent_library: bool,
    pub undefined_function: bool,
    pub invalid_api_usage: bool,
    pub syntax_error: bool,
}

impl ExplicitHallucinations {
    pub fn any(&self) -> bool {
        self.nonexistent_library || self.undefined_function || self.invalid_api_usage || self.syntax_error
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HallucinationRecord {
    #[serde(flatten)]
    pub id: CandidateId,
    pub explicit_hallucinations: ExplicitHallucinations,
    pub test_passed_count: usize,
    pub test_total_count: usize,
    pub timestamp: DateTime<Utc>,
}

/// One literal test case from a task's test-case file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    #[serde(rename = "test_case")]
    pub id: Value,
    #[serde(rename = "expected_result")]
    pub expected: Value,
    /// Every other field of the case, available to input-template references.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TestCase {
    /// Case id as recorded in the test-results log (`1` and `"1"` both become `"1"`).
    pub fn id_string(&self) -> String {
        match &self.id {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
