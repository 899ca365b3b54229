//! Configuration types for the orchestrator.
//!
//! Config is loaded once at startup from `backends.json` and validated before
//! any dispatcher state is constructed. Invalid configs are rejected with a
//! clear error rather than silently falling back to defaults. Unlike a
//! multi-client HTTP gateway, this process serves exactly one local stdio
//! client per run, so config is read once and never hot-reloaded.
//!
//! # Example
//! ```json
//! {
//!   "backends": [
//!     { "name": "local", "kind": "local", "endpoint_url": "http://localhost:11434",
//!       "model_id": "qwen2.5:7b", "priority": 0, "max_tokens_cap": 8192,
//!       "default_timeout_ms": 30000 }
//!   ],
//!   "council": { "topics": { "coding": ["local"] } },
//!   "dual_iterate": { "default_coder": "local", "default_reviewer": "local" }
//! }
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Which provider wire format a backend speaks (§3 `BackendDescriptor.kind`).
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Local inference server speaking the OpenAI-compatible chat schema
    /// (e.g. Ollama, LM Studio, vLLM).
    #[default]
    Local,
    /// Generic OpenAI-compatible cloud endpoint.
    OpenaiCompatible,
    /// Google Gemini `generateContent` API.
    Gemini,
    /// NVIDIA NIM — OpenAI-compatible wire format against NVIDIA's catalog.
    Nvidia,
    /// Groq — OpenAI-compatible wire format against Groq's low-latency API.
    Groq,
    /// Anthropic Messages API (`/v1/messages`); request/response translated
    /// to/from the OpenAI-shaped internal representation.
    AnthropicLike,
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::OpenaiCompatible => "openai_compatible",
            Self::Gemini => "gemini",
            Self::Nvidia => "nvidia",
            Self::Groq => "groq",
            Self::AnthropicLike => "anthropic_like",
        })
    }
}

/// A single backend descriptor, config-loaded and immutable for the
/// process's lifetime (§3 `BackendDescriptor`).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendDescriptor {
    /// Unique backend name used throughout routing, learning, and logs.
    pub name: String,
    pub kind: BackendKind,
    pub endpoint_url: String,
    pub model_id: String,
    /// Environment variable whose value is this backend's API key. Absent
    /// for keyless local backends.
    #[serde(default)]
    pub api_key_env: Option<String>,
    /// Lower priority values are earlier in the global fallback chain.
    pub priority: i32,
    #[serde(default = "defaults::max_tokens_cap")]
    pub max_tokens_cap: u32,
    #[serde(default = "defaults::timeout_ms")]
    pub default_timeout_ms: u64,
}

impl BackendDescriptor {
    /// Resolve the API key from the configured environment variable.
    pub fn api_key(&self) -> Option<String> {
        self.api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
    }
}

/// Council topic → candidate backend names (§4.9 step 1).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CouncilConfig {
    #[serde(default)]
    pub topics: HashMap<String, Vec<String>>,
}

/// Dual-iterate default role bindings (§4.10), overridable by env config.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DualIterateConfig {
    pub default_coder: String,
    pub default_reviewer: String,
}

/// LearningEngine tunables (§4.7).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LearningConfig {
    #[serde(default = "defaults::alpha")]
    pub alpha: f64,
    #[serde(default = "defaults::min_samples")]
    pub min_samples: u32,
    #[serde(default = "defaults::confidence_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "defaults::history_cap")]
    pub history_cap: usize,
    #[serde(default = "defaults::save_every_n")]
    pub save_every_n: u32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            alpha: defaults::alpha(),
            min_samples: defaults::min_samples(),
            confidence_threshold: defaults::confidence_threshold(),
            history_cap: defaults::history_cap(),
            save_every_n: defaults::save_every_n(),
        }
    }
}

/// CircuitBreaker tunables (§4.2).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "defaults::fail_threshold")]
    pub fail_threshold: u32,
    #[serde(default = "defaults::cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: defaults::fail_threshold(),
            cooldown_secs: defaults::cooldown_secs(),
        }
    }
}

/// PatternRAG store tunables (§4.13).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PatternStoreConfig {
    #[serde(default = "defaults::max_patterns")]
    pub max_patterns: usize,
    #[serde(default = "defaults::max_age_days")]
    pub max_age_days: f64,
    #[serde(default = "defaults::decay_factor")]
    pub decay_factor: f64,
    #[serde(default = "defaults::min_similarity")]
    pub min_similarity: f64,
}

impl Default for PatternStoreConfig {
    fn default() -> Self {
        Self {
            max_patterns: defaults::max_patterns(),
            max_age_days: defaults::max_age_days(),
            decay_factor: defaults::decay_factor(),
            min_similarity: defaults::min_similarity(),
        }
    }
}

/// Top-level orchestrator configuration, loaded from `backends.json` (§6).
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub backends: Vec<BackendDescriptor>,
    #[serde(default)]
    pub council: CouncilConfig,
    pub dual_iterate: DualIterateConfig,
    #[serde(default)]
    pub learning: LearningConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub patterns: PatternStoreConfig,
    /// Root directory for `data/learning` and `data/patterns`.
    #[serde(default = "defaults::data_dir")]
    pub data_dir: String,
    /// Log level override (also controlled by `LOG_LEVEL`/`RUST_LOG`).
    #[serde(default)]
    pub log_level: Option<String>,
    /// Process-wide cap on in-flight backend calls (§4.5, §5).
    #[serde(default = "defaults::max_concurrent")]
    pub max_concurrent: usize,
}

impl ServerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = serde_json::from_str(&content).context("parsing backends.json")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(!self.backends.is_empty(), "at least one backend must be configured");

        let names: std::collections::HashSet<&str> =
            self.backends.iter().map(|b| b.name.as_str()).collect();
        anyhow::ensure!(
            names.len() == self.backends.len(),
            "backend names must be unique"
        );

        for (topic, candidates) in &self.council.topics {
            for candidate in candidates {
                anyhow::ensure!(
                    names.contains(candidate.as_str()),
                    "council topic `{}` references unknown backend `{}`",
                    topic,
                    candidate
                );
            }
        }

        anyhow::ensure!(
            names.contains(self.dual_iterate.default_coder.as_str()),
            "dual_iterate.default_coder references unknown backend `{}`",
            self.dual_iterate.default_coder
        );
        anyhow::ensure!(
            names.contains(self.dual_iterate.default_reviewer.as_str()),
            "dual_iterate.default_reviewer references unknown backend `{}`",
            self.dual_iterate.default_reviewer
        );

        Ok(())
    }

    /// The global fallback chain: backend names ordered by ascending
    /// `priority` (§4.4 — a single global chain, not per-backend; see
    /// SPEC_FULL.md §9 open-question resolution).
    pub fn fallback_chain(&self) -> Vec<String> {
        let mut backends: Vec<&BackendDescriptor> = self.backends.iter().collect();
        backends.sort_by_key(|b| b.priority);
        backends.into_iter().map(|b| b.name.clone()).collect()
    }

    pub fn backend(&self, name: &str) -> Option<&BackendDescriptor> {
        self.backends.iter().find(|b| b.name == name)
    }

    pub fn learning_state_path(&self) -> std::path::PathBuf {
        Path::new(&self.data_dir).join("learning/learning-state.json")
    }

    pub fn patterns_path(&self) -> std::path::PathBuf {
        Path::new(&self.data_dir).join("patterns/patterns.json")
    }
}

mod defaults {
    pub fn max_tokens_cap() -> u32 {
        8192
    }
    pub fn timeout_ms() -> u64 {
        30_000
    }
    pub fn alpha() -> f64 {
        0.2
    }
    pub fn min_samples() -> u32 {
        5
    }
    pub fn confidence_threshold() -> f64 {
        0.6
    }
    pub fn history_cap() -> usize {
        1000
    }
    pub fn save_every_n() -> u32 {
        10
    }
    pub fn fail_threshold() -> u32 {
        5
    }
    pub fn cooldown_secs() -> u64 {
        30
    }
    pub fn max_patterns() -> usize {
        500
    }
    pub fn max_age_days() -> f64 {
        90.0
    }
    pub fn decay_factor() -> f64 {
        0.98
    }
    pub fn min_similarity() -> f64 {
        0.3
    }
    pub fn data_dir() -> String {
        "data".to_string()
    }
    pub fn max_concurrent() -> usize {
        250
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_config() -> ServerConfig {
        serde_json::from_str(
            r#"{
                "backends": [
                    { "name": "local", "kind": "local", "endpoint_url": "http://localhost:11434",
                      "model_id": "qwen2.5:7b", "priority": 0 },
                    { "name": "cloud", "kind": "openai_compatible", "endpoint_url": "https://api.example.com",
                      "model_id": "gpt", "priority": 1 }
                ],
                "council": { "topics": { "coding": ["local", "cloud"] } },
                "dual_iterate": { "default_coder": "local", "default_reviewer": "cloud" }
            }"#,
        )
        .expect("minimal config should parse")
    }

    #[test]
    fn parses_minimal_config_and_applies_defaults() {
        let config = minimal_config();
        assert_eq!(config.backends.len(), 2);
        assert_eq!(config.learning.alpha, 0.2);
        assert_eq!(config.circuit_breaker.fail_threshold, 5);
        assert_eq!(config.patterns.max_patterns, 500);
    }

    #[test]
    fn validation_rejects_empty_backend_list() {
        let config = ServerConfig {
            backends: vec![],
            council: CouncilConfig::default(),
            dual_iterate: DualIterateConfig {
                default_coder: "x".into(),
                default_reviewer: "x".into(),
            },
            learning: LearningConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            patterns: PatternStoreConfig::default(),
            data_dir: "data".into(),
            log_level: None,

            max_concurrent: 250,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_council_topic_with_unknown_backend() {
        let mut config = minimal_config();
        config
            .council
            .topics
            .insert("security".into(), vec!["no-such-backend".into()]);
        assert!(config.validate().is_err());
    }

    #[test]
    fn validation_rejects_dual_iterate_default_with_unknown_backend() {
        let mut config = minimal_config();
        config.dual_iterate.default_coder = "no-such-backend".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn fallback_chain_is_ordered_by_ascending_priority() {
        let mut config = minimal_config();
        config.backends[0].priority = 5;
        config.backends[1].priority = 1;
        assert_eq!(config.fallback_chain(), vec!["cloud", "local"]);
    }

    #[test]
    fn backend_lookup_by_name() {
        let config = minimal_config();
        assert!(config.backend("local").is_some());
        assert!(config.backend("missing").is_none());
    }
}
