//! Four-tier backend selection: forced → learning → rules → fallback (§4.6).
//!
//! The router never calls a backend itself; it only decides *which* backend
//! a caller should hand a [`crate::backends::CallRequest`] to. The caller
//! (a handler) is responsible for feeding the resulting [`RoutingOutcome`]
//! back into [`crate::learning::LearningEngine`] once the call completes.

use std::fmt;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::learning::LearningEngine;
use crate::registry::BackendRegistry;

/// Coarse prompt-complexity bucket (§3 `RoutingContext.complexity`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Simple => "simple",
            Self::Moderate => "moderate",
            Self::Complex => "complex",
        })
    }
}

/// Prompt category inferred by keyword matching (§3 `RoutingContext.task_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Code,
    Analysis,
    Generation,
    Unity,
    General,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Code => "code",
            Self::Analysis => "analysis",
            Self::Generation => "generation",
            Self::Unity => "unity",
            Self::General => "general",
        })
    }
}

/// Per-request routing input, derived from the prompt at handler entry.
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub prompt_length: usize,
    pub estimated_tokens: u32,
    pub max_tokens: u32,
    pub complexity: Complexity,
    pub task_type: TaskType,
    pub forced_backend: Option<String>,
    pub timestamp: DateTime<Utc>,
}

static TOKENIZER: OnceLock<tiktoken_rs::CoreBPE> = OnceLock::new();

/// `cl100k_base`'s rank tables are bundled with the crate, so construction
/// only fails on a broken build, never on runtime input.
fn tokenizer() -> &'static tiktoken_rs::CoreBPE {
    TOKENIZER.get_or_init(|| tiktoken_rs::cl100k_base().expect("bundled cl100k_base tokenizer assets"))
}

impl RoutingContext {
    /// Derives complexity from prompt length and requested output size, and
    /// task type from keyword matching over the prompt text (§3).
    pub fn derive(prompt: &str, max_tokens: u32, forced_backend: Option<String>) -> Self {
        let prompt_length = prompt.chars().count();
        let estimated_tokens = tokenizer().encode_with_special_tokens(prompt).len() as u32;

        let complexity = if prompt_length > 2000 || max_tokens > 4000 {
            Complexity::Complex
        } else if prompt_length > 400 || max_tokens > 1000 {
            Complexity::Moderate
        } else {
            Complexity::Simple
        };

        let task_type = classify_task_type(prompt);

        Self {
            prompt_length,
            estimated_tokens,
            max_tokens,
            complexity,
            task_type,
            forced_backend,
            timestamp: Utc::now(),
        }
    }
}

/// Computes the output-size ceiling a caller should request before the
/// per-backend `max_tokens_cap` clamp is applied (§4.1): Unity prompts get
/// the largest budget, complex prompts a medium one, everything else the
/// smallest. Only used when the caller didn't ask for a specific limit.
pub fn dynamic_token_limit(context: &RoutingContext) -> u32 {
    if context.task_type == TaskType::Unity {
        16_384
    } else if context.complexity == Complexity::Complex {
        8_192
    } else if context.complexity == Complexity::Simple {
        2_048
    } else {
        4_096
    }
}

pub(crate) fn classify_task_type(prompt: &str) -> TaskType {
    let lower = prompt.to_lowercase();
    const CODE_KEYWORDS: &[&str] = &["fn ", "function", "class ", "def ", "impl ", "code", "bug", "refactor", "```"];
    const UNITY_KEYWORDS: &[&str] = &["unity", "gameobject", "monobehaviour", "prefab"];
    const ANALYSIS_KEYWORDS: &[&str] = &["analyze", "analyse", "compare", "evaluate", "explain why"];
    const GENERATION_KEYWORDS: &[&str] = &["write a story", "generate", "draft", "compose"];

    if UNITY_KEYWORDS.iter().any(|k| lower.contains(k)) {
        TaskType::Unity
    } else if CODE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        TaskType::Code
    } else if ANALYSIS_KEYWORDS.iter().any(|k| lower.contains(k)) {
        TaskType::Analysis
    } else if GENERATION_KEYWORDS.iter().any(|k| lower.contains(k)) {
        TaskType::Generation
    } else {
        TaskType::General
    }
}

/// Which tier produced a [`RoutingDecision`] (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    Forced,
    Learning,
    Rules,
    Fallback,
}

/// The router's output for one request.
#[derive(Debug, Clone)]
pub struct RoutingDecision {
    pub backend: String,
    pub source: DecisionSource,
    pub confidence: f64,
    pub reasoning_tag: String,
}

/// Fed back into [`LearningEngine::record_outcome`] once the chosen backend's
/// call has completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingOutcome {
    pub backend: String,
    pub complexity: Complexity,
    pub task_type: TaskType,
    pub success: bool,
    pub latency_ms: u64,
    pub source: DecisionSource,
}

/// Fixed-rule backend names consulted by tier 3 (§4.6). These are plain
/// string lookups against the registry, not special-cased types — if a
/// config doesn't define a backend by this name, the rule silently falls
/// through to the next tier.
const COMPLEX_RULE_BACKEND: &str = "nvidia_qwen";
const CODE_RULE_BACKEND: &str = "nvidia_deepseek";

pub struct Router;

impl Router {
    /// Runs the four tiers in order against `registry`/`learning` and
    /// returns the first tier that produces a decision (§4.6).
    pub fn route(context: &RoutingContext, registry: &BackendRegistry, learning: &LearningEngine) -> RoutingDecision {
        if let Some(forced) = context.forced_backend.as_ref().filter(|b| b.as_str() != "auto") {
            return RoutingDecision {
                backend: forced.clone(),
                source: DecisionSource::Forced,
                confidence: 1.0,
                reasoning_tag: "forced_backend".to_string(),
            };
        }

        if let Some(recommendation) = learning.recommendation(context.complexity, context.task_type) {
            if recommendation.confidence > 0.7 && Self::is_healthy(registry, &recommendation.backend) {
                return RoutingDecision {
                    backend: recommendation.backend,
                    source: DecisionSource::Learning,
                    confidence: recommendation.confidence,
                    reasoning_tag: recommendation.reason,
                };
            }
        }

        if context.complexity == Complexity::Complex && Self::is_healthy(registry, COMPLEX_RULE_BACKEND) {
            return RoutingDecision {
                backend: COMPLEX_RULE_BACKEND.to_string(),
                source: DecisionSource::Rules,
                confidence: 0.8,
                reasoning_tag: "rule:complex_prefers_nvidia_qwen".to_string(),
            };
        }
        if context.task_type == TaskType::Code && Self::is_healthy(registry, CODE_RULE_BACKEND) {
            return RoutingDecision {
                backend: CODE_RULE_BACKEND.to_string(),
                source: DecisionSource::Rules,
                confidence: 0.8,
                reasoning_tag: "rule:code_prefers_nvidia_deepseek".to_string(),
            };
        }

        let chain = registry.global_chain();
        let fallback = chain
            .iter()
            .find(|name| Self::is_healthy(registry, name))
            .or_else(|| chain.first())
            .cloned()
            .unwrap_or_default();

        RoutingDecision {
            backend: fallback,
            source: DecisionSource::Fallback,
            confidence: 0.3,
            reasoning_tag: "fallback_chain_head".to_string(),
        }
    }

    fn is_healthy(registry: &BackendRegistry, name: &str) -> bool {
        registry.is_available(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendDescriptor, BackendKind, CircuitBreakerConfig, CouncilConfig, DualIterateConfig, LearningConfig, PatternStoreConfig, ServerConfig};

    fn descriptor(name: &str, priority: i32) -> BackendDescriptor {
        BackendDescriptor {
            name: name.into(),
            kind: BackendKind::Local,
            endpoint_url: "http://localhost:1".into(),
            model_id: "m".into(),
            api_key_env: None,
            priority,
            max_tokens_cap: 1024,
            default_timeout_ms: 1000,
        }
    }

    fn registry(backends: Vec<BackendDescriptor>) -> BackendRegistry {
        let config = ServerConfig {
            backends,
            council: CouncilConfig::default(),
            dual_iterate: DualIterateConfig {
                default_coder: "a".into(),
                default_reviewer: "a".into(),
            },
            learning: LearningConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            patterns: PatternStoreConfig::default(),
            data_dir: "data".into(),
            log_level: None,

            max_concurrent: 250,
        };
        BackendRegistry::new(&config).unwrap()
    }

    #[test]
    fn forced_backend_wins_unconditionally() {
        let registry = registry(vec![descriptor("a", 0), descriptor("b", 1)]);
        let learning = LearningEngine::new(LearningConfig::default());
        let context = RoutingContext::derive("hello", 16, Some("b".to_string()));
        let decision = Router::route(&context, &registry, &learning);
        assert_eq!(decision.backend, "b");
        assert_eq!(decision.source, DecisionSource::Forced);
        assert_eq!(decision.confidence, 1.0);
    }

    #[test]
    fn forced_auto_is_not_treated_as_forced() {
        let registry = registry(vec![descriptor("a", 0)]);
        let learning = LearningEngine::new(LearningConfig::default());
        let context = RoutingContext::derive("hello", 16, Some("auto".to_string()));
        let decision = Router::route(&context, &registry, &learning);
        assert_ne!(decision.source, DecisionSource::Forced);
    }

    #[test]
    fn falls_back_to_chain_head_when_nothing_else_applies() {
        let registry = registry(vec![descriptor("a", 1), descriptor("b", 0)]);
        let learning = LearningEngine::new(LearningConfig::default());
        let context = RoutingContext::derive("short prompt", 16, None);
        let decision = Router::route(&context, &registry, &learning);
        assert_eq!(decision.source, DecisionSource::Fallback);
        assert_eq!(decision.backend, "b");
    }

    #[test]
    fn complexity_escalates_with_prompt_length() {
        let short = RoutingContext::derive("hi", 16, None);
        assert_eq!(short.complexity, Complexity::Simple);
        let long = RoutingContext::derive(&"word ".repeat(500), 16, None);
        assert_eq!(long.complexity, Complexity::Complex);
    }

    #[test]
    fn keyword_matching_detects_code_task_type() {
        let context = RoutingContext::derive("please fix this bug in my function", 16, None);
        assert_eq!(context.task_type, TaskType::Code);
    }
}
