// Language configuration management for the assayer worker
use anyhow::{bail, Context, Result};
use assayer_common::types::Language;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageExecution {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub file_extension: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageConfig {
    pub name: String,
    #[serde(flatten)]
    pub execution: LanguageExecution,
}

#[derive(Debug, Serialize, Deserialize)]
struct LanguagesJson {
    languages: Vec<LanguageConfig>,
}

/// Maps a declared source language to the interpreter/toolchain that runs it.
#[derive(Debug, Clone)]
pub struct LanguageConfigManager {
    configs: HashMap<Language, LanguageExecution>,
}

impl LanguageConfigManager {
    /// Built-in interpreters: `python3`, `node`, `go run`
    pub fn builtin() -> Self {
        let mut configs = HashMap::new();
        configs.insert(
            Language::Python,
            LanguageExecution {
                command: "python3".to_string(),
                args: vec![],
                file_extension: "py".to_string(),
            },
        );
        configs.insert(
            Language::JavaScript,
            LanguageExecution {
                command: "node".to_string(),
                args: vec![],
                file_extension: "js".to_string(),
            },
        );
        configs.insert(
            Language::Go,
            LanguageExecution {
                command: "go".to_string(),
                args: vec!["run".to_string()],
                file_extension: "go".to_string(),
            },
        );
        Self { configs }
    }

    /// An empty manager: every language is unsupported until configured.
    #[cfg(test)]
    pub fn empty() -> Self {
        Self {
            configs: HashMap::new(),
        }
    }

    /// Load overrides from languages.json on top of the built-in table
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Language config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("Failed to read languages.json")?;

        let languages_json: LanguagesJson =
            serde_json::from_str(&content).context("Failed to parse languages.json")?;

        let mut manager = Self::builtin();
        for lang in languages_json.languages {
            let language = Language::from_str(&lang.name)
                .with_context(|| format!("Unknown language '{}' in languages.json", lang.name))?;
            manager.configs.insert(language, lang.execution);
        }

        Ok(manager)
    }

    /// Load config/languages.json if present, otherwise fall back to the built-in table
    pub fn load_default() -> Result<Self> {
        let default_path = Path::new("config/languages.json");
        if default_path.exists() {
            Self::load(default_path)
        } else {
            Ok(Self::builtin())
        }
    }

    #[cfg(test)]
    pub fn set(&mut self, language: Language, execution: LanguageExecution) {
        self.configs.insert(language, execution);
    }

    pub fn get_config(&self, language: &Language) -> Option<&LanguageExecution> {
        self.configs.get(language)
    }

    pub fn file_extension(&self, language: &Language) -> String {
        self.configs
            .get(language)
            .map(|c| c.file_extension.trim_start_matches('.').to_string())
            .unwrap_or_else(|| language.default_extension().to_string())
    }

    /// List all configured languages
    pub fn list_languages(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.keys().map(|l| l.to_string()).collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_table() {
        let manager = LanguageConfigManager::builtin();
        let go = manager.get_config(&Language::Go).unwrap();
        assert_eq!(go.command, "go");
        assert_eq!(go.args, vec!["run".to_string()]);
        assert_eq!(manager.file_extension(&Language::JavaScript), "js");
        assert_eq!(manager.list_languages(), vec!["go", "javascript", "python"]);
    }

    #[test]
    fn test_load_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");
        fs::write(
            &path,
            r#"{"languages": [{"name": "python", "command": "python3.12", "args": ["-u"], "file_extension": ".py"}]}"#,
        )
        .unwrap();

        let manager = LanguageConfigManager::load(&path).unwrap();
        let python = manager.get_config(&Language::Python).unwrap();
        assert_eq!(python.command, "python3.12");
        assert_eq!(python.args, vec!["-u".to_string()]);
        assert_eq!(manager.file_extension(&Language::Python), "py");
        // untouched entries keep their defaults
        assert_eq!(manager.get_config(&Language::JavaScript).unwrap().command, "node");
    }

    #[test]
    fn test_unknown_language_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("languages.json");
        fs::write(
            &path,
            r#"{"languages": [{"name": "cobol", "command": "cobc", "file_extension": "cbl"}]}"#,
        )
        .unwrap();
        assert!(LanguageConfigManager::load(&path).is_err());
    }

    #[test]
    fn test_empty_manager_has_no_interpreters() {
        let manager = LanguageConfigManager::empty();
        assert!(manager.get_config(&Language::Python).is_none());
        assert_eq!(manager.file_extension(&Language::Python), "py");
    }
}
