//! Engine configuration.
//!
//! Defaults target a local Ollama server. `from_env` overlays
//! `PHARMACY_QUERY_*` variables; `from_json_str` reads the same structure as
//! JSON (every field optional).

use std::path::PathBuf;
use std::time::Duration;

use pharmacy_query_llm::RetryPolicy;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: `{value}`")]
    InvalidValue { name: String, value: String },

    #[error("Invalid configuration JSON: {0}")]
    Json(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Which model answers classification and composition requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Ollama `/api/generate`
    Ollama,
    /// Offline keyword classifier; answers always use the template
    Keyword,
}

impl Backend {
    fn parse(value: &str) -> Option<Backend> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ollama" => Some(Backend::Ollama),
            "keyword" | "offline" => Some(Backend::Keyword),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub backend: Backend,
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Few-shot examples in the classification prompt
    pub include_examples: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: "mistral".to_string(),
            timeout_secs: 30,
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 4000,
            include_examples: true,
        }
    }
}

impl LlmConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts.max(1),
            initial_backoff: Duration::from_millis(self.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Bound on in-memory entries; `None` is unbounded
    pub max_entries: Option<usize>,
    /// SQLite file for persisted results
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub llm: LlmConfig,
    pub cache: CacheConfig,
}

impl EngineConfig {
    /// Defaults overlaid with `PHARMACY_QUERY_*` environment variables.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_json_str(json: &str) -> ConfigResult<Self> {
        serde_json::from_str(json).map_err(|e| ConfigError::Json(e.to_string()))
    }

    /// Defaults overlaid with whatever `lookup` returns per variable name.
    pub fn from_lookup<F>(lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = EngineConfig::default();

        if let Some(value) = var("PHARMACY_QUERY_BACKEND") {
            config.llm.backend = Backend::parse(&value).ok_or_else(|| ConfigError::InvalidValue {
                name: "PHARMACY_QUERY_BACKEND".into(),
                value,
            })?;
        }
        if let Some(value) = var("PHARMACY_QUERY_LLM_URL") {
            config.llm.base_url = value;
        }
        if let Some(value) = var("PHARMACY_QUERY_MODEL") {
            config.llm.model = value;
        }
        if let Some(value) = var("PHARMACY_QUERY_TIMEOUT_SECS") {
            config.llm.timeout_secs = parse_number("PHARMACY_QUERY_TIMEOUT_SECS", value)?;
        }
        if let Some(value) = var("PHARMACY_QUERY_MAX_ATTEMPTS") {
            config.llm.max_attempts = parse_number("PHARMACY_QUERY_MAX_ATTEMPTS", value)?;
        }
        if let Some(value) = var("PHARMACY_QUERY_CACHE_MAX_ENTRIES") {
            config.cache.max_entries = Some(parse_number("PHARMACY_QUERY_CACHE_MAX_ENTRIES", value)?);
        }
        if let Some(value) = var("PHARMACY_QUERY_CACHE_PATH") {
            config.cache.path = Some(PathBuf::from(value));
        }

        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: String) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name: name.to_string(),
        value,
    })
}
