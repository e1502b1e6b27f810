// Pipeline configuration: the evaluation matrix plus where things live on disk
use crate::types::{CandidateId, Language, TestCase};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_ENV: &str = "ASSAYER_CONFIG";
pub const MAX_PARALLEL_ENV: &str = "ASSAYER_MAX_PARALLEL";
pub const DEFAULT_CONFIG_PATH: &str = "config/config.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalConfig {
    pub languages: Vec<Language>,
    pub tasks: Vec<String>,
    pub models: Vec<String>,
    pub completeness_levels: Vec<String>,
    #[serde(default = "default_codes_dir")]
    pub codes_dir: PathBuf,
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,
    #[serde(default = "default_test_cases_dir")]
    pub test_cases_dir: PathBuf,
    /// JSON file of static-analysis measurements keyed by task_id
    #[serde(default)]
    pub measurements_path: Option<PathBuf>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Treat stderr output on a zero exit as a failed test case
    #[serde(default = "default_strict_stderr")]
    pub strict_stderr: bool,
}

fn default_codes_dir() -> PathBuf {
    PathBuf::from("codes")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_test_cases_dir() -> PathBuf {
    PathBuf::from("test_cases")
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    1
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_max_parallel() -> usize {
    4
}

fn default_strict_stderr() -> bool {
    true
}

impl EvalConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config: EvalConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `$ASSAYER_CONFIG` (default `config/config.json`) and apply env overrides.
    pub fn load_default() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let mut config = Self::load(Path::new(&path))?;
        if let Ok(raw) = std::env::var(MAX_PARALLEL_ENV) {
            config.max_parallel = raw
                .parse()
                .with_context(|| format!("{} must be a positive integer, got {:?}", MAX_PARALLEL_ENV, raw))?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            bail!("No tasks configured");
        }
        if self.languages.is_empty() || self.models.is_empty() || self.completeness_levels.is_empty() {
            bail!("Languages, models and completeness levels must all be non-empty");
        }
        if self.max_attempts == 0 {
            bail!("max_attempts must be at least 1");
        }
        if self.max_parallel == 0 {
            bail!("max_parallel must be at least 1");
        }
        if self.timeout_secs == 0 {
            bail!("timeout_secs must be at least 1");
        }
        Ok(())
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Every identity in the matrix, ordered task → language → model → completeness.
    pub fn candidates(&self) -> Vec<CandidateId> {
        let mut out = Vec::new();
        for task in &self.tasks {
            for language in &self.languages {
                for model in &self.models {
                    for level in &self.completeness_levels {
                        out.push(CandidateId::new(*language, model.as_str(), level.as_str(), task.as_str()));
                    }
                }
            }
        }
        out
    }
}

/// Literal test cases and input template for one task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub name: String,
    pub cases: Vec<TestCase>,
    /// The whole test-case document, reachable from templates as `test_cases`
    pub document: Value,
    pub input_template: Map<String, Value>,
}

impl TaskSpec {
    /// Load `{dir}/{task}_test_cases.json` and the task's entry in `{dir}/input_data.json`.
    pub fn load(dir: &Path, task_name: &str) -> Result<Self> {
        let cases_path = dir.join(format!("{}_test_cases.json", task_name));
        let content = fs::read_to_string(&cases_path)
            .with_context(|| format!("Failed to read {}", cases_path.display()))?;
        let document: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse {}", cases_path.display()))?;

        let cases: Vec<TestCase> = match document.get("test_cases") {
            Some(raw) => serde_json::from_value(raw.clone())
                .with_context(|| format!("Malformed test_cases array in {}", cases_path.display()))?,
            None => bail!("{} has no test_cases array", cases_path.display()),
        };

        let template_path = dir.join("input_data.json");
        let input_template = if template_path.exists() {
            let content = fs::read_to_string(&template_path)
                .with_context(|| format!("Failed to read {}", template_path.display()))?;
            let templates: Map<String, Value> = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", template_path.display()))?;
            match templates.get(task_name) {
                Some(Value::Object(map)) => map.clone(),
                Some(_) => bail!("Input template for {} must be an object", task_name),
                None => Map::new(),
            }
        } else {
            Map::new()
        };

        Ok(Self {
            name: task_name.to_string(),
            cases,
            document,
            input_template,
        })
    }
}
