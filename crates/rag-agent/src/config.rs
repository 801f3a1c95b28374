//! Runtime configuration.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Environment variable overrides (`RAG_*`)
//! 2. Values from the TOML file passed with `--config`
//! 3. Built-in defaults
//!
//! ```toml
//! [gateway]
//! failure_threshold = 3
//! cooldown_ms = 60000
//! max_fallback_depth = 4
//!
//! [[gateway.providers]]
//! name = "primary"
//! base_url = "http://localhost:8000/v1"
//! model = "qwen2.5-32b-instruct"
//! tier = "flash"
//! api_key_env = "PRIMARY_API_KEY"
//!
//! [memory]
//! read_concurrency = 10
//! database_url = "postgres://rag@localhost/rag"
//!
//! [orchestrator]
//! verify_answers = true
//! ```

use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use coordination::gateway::{
    CostTable, OpenAiCompatConfig, OpenAiCompatProvider, ProviderError, ProviderHandle,
    ProviderRegistry, Tier,
};
use coordination::memory::InMemoryCollectiveMemory;
use coordination::{GatewayConfig, MemoryConfig, SearchConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::OrchestratorConfig;

const ENV_DATABASE_URL: &str = "RAG_DATABASE_URL";
const ENV_FAILURE_THRESHOLD: &str = "RAG_FAILURE_THRESHOLD";
const ENV_COOLDOWN_MS: &str = "RAG_BREAKER_COOLDOWN_MS";
const ENV_REQUEST_TIMEOUT_MS: &str = "RAG_REQUEST_TIMEOUT_MS";
const ENV_MAX_FALLBACK_DEPTH: &str = "RAG_MAX_FALLBACK_DEPTH";
const ENV_READ_CONCURRENCY: &str = "RAG_READ_CONCURRENCY";
const ENV_WRITE_LOCK_TIMEOUT_MS: &str = "RAG_WRITE_LOCK_TIMEOUT_MS";
const ENV_VERIFY_ANSWERS: &str = "RAG_VERIFY_ANSWERS";
const ENV_DEFAULT_TIER: &str = "RAG_DEFAULT_TIER";
const ENV_PROVIDER_URL: &str = "RAG_PROVIDER_URL";
const ENV_PROVIDER_MODEL: &str = "RAG_PROVIDER_MODEL";
const ENV_PROVIDER_API_KEY: &str = "RAG_PROVIDER_API_KEY";
const ENV_PROVIDER_TIER: &str = "RAG_PROVIDER_TIER";

/// Configuration loading failure.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {var}")]
    InvalidEnv { var: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Fact extractor backing the memory service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractorKind {
    /// Regex over first-person statements.
    #[default]
    Pattern,
    /// Ask the gateway at `lite` tier.
    Llm,
    None,
}

/// One OpenAI-compatible provider entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderEntry {
    #[serde(flatten)]
    pub endpoint: OpenAiCompatConfig,
    pub tier: Tier,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub cost: CostTable,
    /// Environment variable holding the API key; wins over `api_key`.
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySection {
    #[serde(flatten)]
    pub settings: GatewayConfig,
    pub providers: Vec<ProviderEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    #[serde(flatten)]
    pub settings: MemoryConfig,
    /// Postgres URL. Without one, memory lives in process.
    pub database_url: Option<String>,
    pub extractor: ExtractorKind,
    /// Distinct users required before a fact becomes a collective insight.
    pub collective_min_users: usize,
    /// Distinct facts tracked for collective insights.
    pub collective_capacity: usize,
    /// Connection attempts before the store is declared unreachable.
    pub connect_attempts: u32,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            settings: MemoryConfig::default(),
            database_url: None,
            extractor: ExtractorKind::default(),
            collective_min_users: 2,
            collective_capacity: InMemoryCollectiveMemory::DEFAULT_CAPACITY,
            connect_attempts: 3,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RagConfig {
    pub gateway: GatewaySection,
    pub memory: MemorySection,
    pub search: SearchConfig,
    pub orchestrator: OrchestratorConfig,
}

fn parse_env<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}

fn parse_bool(var: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv { var, value }),
    }
}

impl RagConfig {
    /// Defaults, optionally overlaid by a TOML file, then by the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Apply `RAG_*` overrides read through `lookup`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = lookup(ENV_DATABASE_URL) {
            self.memory.database_url = Some(v).filter(|s| !s.trim().is_empty());
        }
        if let Some(v) = lookup(ENV_FAILURE_THRESHOLD) {
            self.gateway.settings.failure_threshold = parse_env(ENV_FAILURE_THRESHOLD, v)?;
        }
        if let Some(v) = lookup(ENV_COOLDOWN_MS) {
            self.gateway.settings.cooldown = Duration::from_millis(parse_env(ENV_COOLDOWN_MS, v)?);
        }
        if let Some(v) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            self.gateway.settings.request_timeout =
                Duration::from_millis(parse_env(ENV_REQUEST_TIMEOUT_MS, v)?);
        }
        if let Some(v) = lookup(ENV_MAX_FALLBACK_DEPTH) {
            self.gateway.settings.max_fallback_depth = parse_env(ENV_MAX_FALLBACK_DEPTH, v)?;
        }
        if let Some(v) = lookup(ENV_READ_CONCURRENCY) {
            self.memory.settings.read_concurrency = parse_env(ENV_READ_CONCURRENCY, v)?;
        }
        if let Some(v) = lookup(ENV_WRITE_LOCK_TIMEOUT_MS) {
            self.memory.settings.write_lock_timeout =
                Duration::from_millis(parse_env(ENV_WRITE_LOCK_TIMEOUT_MS, v)?);
        }
        if let Some(v) = lookup(ENV_VERIFY_ANSWERS) {
            self.orchestrator.verify_answers = parse_bool(ENV_VERIFY_ANSWERS, v)?;
        }
        if let Some(v) = lookup(ENV_DEFAULT_TIER) {
            self.orchestrator.default_tier = parse_env(ENV_DEFAULT_TIER, v)?;
        }

        // A single provider from the environment, for quick local runs.
        if let Some(base_url) = lookup(ENV_PROVIDER_URL) {
            let tier = match lookup(ENV_PROVIDER_TIER) {
                Some(v) => parse_env(ENV_PROVIDER_TIER, v)?,
                None => self.orchestrator.default_tier,
            };
            self.gateway.providers.push(ProviderEntry {
                endpoint: OpenAiCompatConfig {
                    name: "env".to_string(),
                    base_url,
                    model: lookup(ENV_PROVIDER_MODEL).unwrap_or_else(|| "default".to_string()),
                    api_key: lookup(ENV_PROVIDER_API_KEY).unwrap_or_default(),
                    connect_timeout_ms: 5_000,
                },
                tier,
                priority: 0,
                cost: CostTable::default(),
                api_key_env: None,
                enabled: true,
            });
        }

        for provider in &mut self.gateway.providers {
            if let Some(var) = &provider.api_key_env {
                if let Some(key) = lookup(var) {
                    provider.endpoint.api_key = key;
                }
            }
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let g = &self.gateway.settings;
        if g.failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "gateway.failure_threshold must be at least 1".into(),
            ));
        }
        if g.max_fallback_depth == 0 {
            return Err(ConfigError::Invalid(
                "gateway.max_fallback_depth must be at least 1".into(),
            ));
        }
        let mut names = HashSet::new();
        for p in &self.gateway.providers {
            if p.endpoint.name.trim().is_empty() {
                return Err(ConfigError::Invalid("provider name must not be empty".into()));
            }
            if !names.insert(p.endpoint.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider name '{}'",
                    p.endpoint.name
                )));
            }
        }
        if self.memory.settings.read_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "memory.read_concurrency must be at least 1".into(),
            ));
        }
        let s = &self.search;
        if s.dense_weight < 0.0 || s.lexical_weight < 0.0 || s.dense_weight + s.lexical_weight <= 0.0
        {
            return Err(ConfigError::Invalid(
                "search weights must be non-negative and not both zero".into(),
            ));
        }
        if self.orchestrator.event_buffer == 0 || self.orchestrator.write_queue_capacity == 0 {
            return Err(ConfigError::Invalid(
                "orchestrator buffers must hold at least one item".into(),
            ));
        }
        Ok(())
    }

    /// Register every enabled provider with an OpenAI-compatible adapter.
    pub fn build_registry(&self) -> Result<ProviderRegistry, ProviderError> {
        let mut registry = ProviderRegistry::new();
        for entry in self.gateway.providers.iter().filter(|p| p.enabled) {
            let adapter = OpenAiCompatProvider::new(entry.endpoint.clone())?;
            let handle = ProviderHandle::new(entry.endpoint.name.clone(), entry.tier)
                .with_priority(entry.priority)
                .with_cost(entry.cost);
            registry.register(handle, Arc::new(adapter));
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const SAMPLE: &str = r#"
[gateway]
failure_threshold = 5
cooldown_ms = 30000
max_fallback_depth = 3

[[gateway.providers]]
name = "primary"
base_url = "http://localhost:8000/v1"
model = "qwen"
tier = "flash"
priority = 1
api_key_env = "PRIMARY_KEY"

[[gateway.providers]]
name = "backup"
base_url = "http://localhost:8001/v1"
model = "llama"
tier = "lite"
cost = { input_per_1k = 0.1, output_per_1k = 0.2 }

[memory]
read_concurrency = 4
write_lock_timeout_ms = 2000
extractor = "llm"

[search]
dense_weight = 0.7
lexical_weight = 0.3

[orchestrator]
verify_answers = true
history_window = 4
"#;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = RagConfig::default();
        config.validate().unwrap();
        assert_eq!(config.memory.settings.read_concurrency, 10);
        assert_eq!(config.gateway.settings.failure_threshold, 3);
        assert!(config.gateway.providers.is_empty());
        assert_eq!(config.orchestrator.default_tier, Tier::Flash);
    }

    #[test]
    fn test_parse_toml() {
        let config = RagConfig::from_toml(SAMPLE).unwrap();
        assert_eq!(config.gateway.settings.failure_threshold, 5);
        assert_eq!(config.gateway.settings.cooldown, Duration::from_secs(30));
        assert_eq!(config.gateway.providers.len(), 2);
        assert_eq!(config.gateway.providers[0].tier, Tier::Flash);
        assert_eq!(config.gateway.providers[1].cost.output_per_1k, 0.2);
        assert_eq!(config.memory.settings.read_concurrency, 4);
        assert_eq!(
            config.memory.settings.write_lock_timeout,
            Duration::from_secs(2)
        );
        assert_eq!(config.memory.extractor, ExtractorKind::Llm);
        assert!(config.orchestrator.verify_answers);
        assert_eq!(config.orchestrator.history_window, 4);
        // Untouched sections keep their defaults.
        assert_eq!(config.search.candidate_multiplier, 4);
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = RagConfig::from_toml(SAMPLE).unwrap();
        config
            .apply_overrides(env(&[
                ("RAG_MAX_FALLBACK_DEPTH", "6"),
                ("RAG_VERIFY_ANSWERS", "false"),
                ("RAG_DATABASE_URL", "postgres://localhost/rag"),
                ("PRIMARY_KEY", "sk-test"),
            ]))
            .unwrap();
        assert_eq!(config.gateway.settings.max_fallback_depth, 6);
        assert!(!config.orchestrator.verify_answers);
        assert_eq!(
            config.memory.database_url.as_deref(),
            Some("postgres://localhost/rag")
        );
        assert_eq!(config.gateway.providers[0].endpoint.api_key, "sk-test");
        assert_eq!(config.gateway.providers[1].endpoint.api_key, "");
    }

    #[test]
    fn test_env_provider_is_appended() {
        let mut config = RagConfig::default();
        config
            .apply_overrides(env(&[
                ("RAG_PROVIDER_URL", "http://127.0.0.1:9000/v1"),
                ("RAG_PROVIDER_MODEL", "mini"),
                ("RAG_PROVIDER_TIER", "lite"),
            ]))
            .unwrap();
        let p = &config.gateway.providers[0];
        assert_eq!(p.endpoint.name, "env");
        assert_eq!(p.endpoint.model, "mini");
        assert_eq!(p.tier, Tier::Lite);
    }

    #[test]
    fn test_invalid_env_value() {
        let mut config = RagConfig::default();
        let err = config
            .apply_overrides(env(&[("RAG_READ_CONCURRENCY", "lots")]))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidEnv {
                var: "RAG_READ_CONCURRENCY",
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_provider_rejected() {
        let mut config = RagConfig::from_toml(SAMPLE).unwrap();
        let dup = config.gateway.providers[0].clone();
        config.gateway.providers.push(dup);
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_depth_rejected() {
        let mut config = RagConfig::default();
        config.gateway.settings.max_fallback_depth = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_build_registry_skips_disabled() {
        let mut config = RagConfig::from_toml(SAMPLE).unwrap();
        config.gateway.providers[1].enabled = false;
        let registry = config.build_registry().unwrap();
        assert_eq!(registry.len(), 1);
        assert!(registry.get("primary").is_some());
    }
}
