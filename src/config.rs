use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agent::PlanningStrategy;
use crate::error::{FlowError, Result};
use crate::llm::{CallOptions, LanguageModel, StubModel};

const ENV_PREFIX: &str = "SAYR_FLOW_";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    /// Replies served in order when `provider = "stub"`.
    #[serde(default)]
    pub script: Vec<String>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: "stub".into(),
            model: "stub-model".into(),
            api_key: None,
            base_url: None,
            script: Vec::new(),
        }
    }
}

impl ModelConfig {
    /// Explicit key first, then `<PROVIDER>_API_KEY` from `lookup`.
    pub fn resolve_api_key(&self, lookup: &dyn ConfigLookup) -> Option<String> {
        self.api_key.clone().or_else(|| {
            lookup.get(&format!("{}_API_KEY", self.provider.to_ascii_uppercase()))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    pub max_iterations: usize,
    pub max_consecutive_errors: usize,
    pub human_feedback_enabled: bool,
    pub strategy: PlanningStrategy,
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            max_consecutive_errors: 3,
            human_feedback_enabled: true,
            strategy: PlanningStrategy::React,
            system_prompt: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EvaluatorConfig {
    pub max_iterations: usize,
    pub min_acceptable_score: f64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            min_acceptable_score: 0.8,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub call: CallOptions,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub evaluator: EvaluatorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(format!("{ENV_PREFIX}{key}"))
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
}

impl AppConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Self::from_toml(&raw)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        toml::from_str(raw)
            .map_err(|err| FlowError::Configuration(format!("failed to parse configuration: {err}")))
    }

    /// Loads `path` and applies `SAYR_FLOW_*` environment overrides.
    pub fn from_env_or_file(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_file(path)?;
        cfg.apply_env_overrides();
        Ok(cfg)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Some(provider) = parse_env::<String>("PROVIDER") {
            self.model.provider = provider;
        }
        if let Some(model) = parse_env::<String>("MODEL") {
            self.model.model = model;
        }
        if let Some(key) = parse_env::<String>("API_KEY") {
            self.model.api_key = Some(key);
        }
        if let Some(url) = parse_env::<String>("BASE_URL") {
            self.model.base_url = Some(url);
        }
        if let Some(temperature) = parse_env::<f32>("TEMPERATURE") {
            self.call.temperature = temperature.clamp(0.0, 2.0);
        }
        if let Some(max_tokens) = parse_env::<u32>("MAX_TOKENS") {
            self.call.max_tokens = max_tokens;
        }
        if let Some(timeout_ms) = parse_env::<u64>("TIMEOUT_MS") {
            self.call.timeout_ms = timeout_ms;
        }
        if let Some(max_iterations) = parse_env::<usize>("MAX_ITERATIONS") {
            self.agent.max_iterations = max_iterations;
        }
        if let Some(enabled) = parse_env::<bool>("HUMAN_FEEDBACK") {
            self.agent.human_feedback_enabled = enabled;
        }
        if let Some(level) = parse_env::<String>("LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = parse_env::<bool>("LOG_JSON") {
            self.logging.json = json;
        }
    }

    /// Builds the configured model. Only the in-process `stub` provider ships with the crate;
    /// other providers are supplied by the caller as a [`LanguageModel`] implementation.
    pub fn build_model(&self) -> Result<Arc<dyn LanguageModel>> {
        match self.model.provider.as_str() {
            "stub" => {
                debug!(replies = self.model.script.len(), "building scripted model");
                Ok(Arc::new(
                    StubModel::new(self.model.script.clone())
                        .with_fallback("{\"answer\": \"no scripted reply left\"}"),
                ))
            }
            other => Err(FlowError::Configuration(format!(
                "no built-in client for provider `{other}`"
            ))),
        }
    }
}

/// String-keyed configuration lookup.
pub trait ConfigLookup: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;

    fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }
}

impl ConfigLookup for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Values from a `.env` file, backed by the process environment.
#[derive(Debug, Clone, Default)]
pub struct EnvFile {
    values: HashMap<String, String>,
    source: Option<PathBuf>,
}

impl EnvFile {
    /// Loads the first `.env` found in `.`, `..`, `../..` or `$HOME/.sayr-flow/`.
    /// Missing files are not an error.
    pub fn load() -> Self {
        for candidate in Self::search_paths() {
            if candidate.is_file() {
                match Self::from_path(&candidate) {
                    Ok(file) => return file,
                    Err(err) => debug!(path = %candidate.display(), error = %err, "skipping env file"),
                }
            }
        }
        Self::default()
    }

    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![
            PathBuf::from(".env"),
            PathBuf::from("../.env"),
            PathBuf::from("../../.env"),
        ];
        if let Ok(home) = env::var("HOME") {
            paths.push(Path::new(&home).join(".sayr-flow").join(".env"));
        }
        paths
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path.as_ref())?;
        Ok(Self {
            values: Self::parse(&raw),
            source: Some(path.as_ref().to_path_buf()),
        })
    }

    /// Parses `KEY=VALUE` lines, skipping blanks and `#` comments and stripping quotes.
    pub fn parse(raw: &str) -> HashMap<String, String> {
        let mut values = HashMap::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            if key.is_empty() {
                continue;
            }
            let value = value.trim();
            let unquoted = ['"', '\'']
                .iter()
                .find_map(|q| {
                    value
                        .strip_prefix(*q)
                        .and_then(|rest| rest.strip_suffix(*q))
                })
                .unwrap_or(value);
            values.insert(key.to_string(), unquoted.to_string());
        }
        values
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }
}

impl ConfigLookup for EnvFile {
    fn get(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .cloned()
            .or_else(|| env::var(key).ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn loads_and_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[model]\nprovider='stub'\nmodel='scripted'\n[call]\ntemperature=0.2\n[agent]\nmax_iterations=4\nstrategy='reflexion'"
        )
        .unwrap();

        env::set_var("SAYR_FLOW_MAX_TOKENS", "256");
        let cfg = AppConfig::from_env_or_file(file.path()).unwrap();
        env::remove_var("SAYR_FLOW_MAX_TOKENS");

        assert_eq!(cfg.model.model, "scripted");
        assert_eq!(cfg.call.temperature, 0.2);
        assert_eq!(cfg.call.max_tokens, 256);
        assert_eq!(cfg.call.top_p, 1.0);
        assert_eq!(cfg.agent.max_iterations, 4);
        assert_eq!(cfg.agent.strategy, PlanningStrategy::Reflexion);
        assert_eq!(cfg.evaluator.min_acceptable_score, 0.8);
    }

    #[test]
    fn malformed_toml_is_configuration_error() {
        let err = AppConfig::from_toml("[agent\nmax_iterations=").unwrap_err();
        assert!(matches!(err, FlowError::Configuration(_)));
    }

    #[test]
    fn unknown_provider_has_no_client() {
        let mut cfg = AppConfig::default();
        cfg.model.provider = "openai".into();
        assert!(matches!(
            cfg.build_model(),
            Err(FlowError::Configuration(_))
        ));
        assert!(AppConfig::default().build_model().is_ok());
    }

    #[test]
    fn parses_env_file() {
        let values = EnvFile::parse(
            "# credentials\nOPENAI_API_KEY=\"sk-test\"\n\nexport MODEL='gpt'\nBROKEN\n",
        );
        assert_eq!(values.get("OPENAI_API_KEY").map(String::as_str), Some("sk-test"));
        assert_eq!(values.get("MODEL").map(String::as_str), Some("gpt"));
        assert_eq!(values.len(), 2);
    }

    #[test]
    fn env_file_falls_back_to_process_env() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "ANTHROPIC_API_KEY=from-file").unwrap();
        env::set_var("SAYR_FLOW_TEST_ONLY_LOOKUP", "from-env");

        let env_file = EnvFile::from_path(file.path()).unwrap();
        assert_eq!(env_file.get("ANTHROPIC_API_KEY").as_deref(), Some("from-file"));
        assert_eq!(
            env_file.get("SAYR_FLOW_TEST_ONLY_LOOKUP").as_deref(),
            Some("from-env")
        );
        env::remove_var("SAYR_FLOW_TEST_ONLY_LOOKUP");

        let model = ModelConfig {
            provider: "anthropic".into(),
            ..ModelConfig::default()
        };
        assert_eq!(model.resolve_api_key(&env_file).as_deref(), Some("from-file"));
    }
}
