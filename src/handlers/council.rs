//! Council: query several backends in parallel on the same prompt and report
//! an agreement signal, with no synthesis step (§4.9).

use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::backends::{clamp_max_tokens, CallRequest};
use crate::config::ServerConfig;
use crate::error::AppError;
use crate::registry::BackendRegistry;
use crate::router::{dynamic_token_limit, RoutingContext};

use super::{cancellable, spawn_deadline};

/// Upper bound on total workflow wall-clock (§5): generous enough to cover
/// a full fallback chain on the slowest queried backend.
const COUNCIL_DEADLINE: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    Coding,
    Reasoning,
    Architecture,
    Security,
    Performance,
    General,
    Creative,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Coding => "coding",
            Self::Reasoning => "reasoning",
            Self::Architecture => "architecture",
            Self::Security => "security",
            Self::Performance => "performance",
            Self::General => "general",
            Self::Creative => "creative",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceNeeded {
    High,
    Medium,
    Low,
}

impl ConfidenceNeeded {
    fn backend_count(self) -> usize {
        match self {
            Self::High => 4,
            Self::Medium => 3,
            Self::Low => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgreementLevel {
    High,
    Moderate,
    Divergent,
    SingleResponse,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recommendation {
    Proceed,
    Review,
}

pub struct CouncilResponse {
    pub backend: String,
    pub content: String,
}

pub struct CouncilFailure {
    pub backend: String,
    pub error: String,
}

pub struct CouncilSynthesis {
    pub backends_queried: usize,
    pub backends_succeeded: usize,
    pub duration_ms: u64,
    pub agreement_level: AgreementLevel,
    pub recommendation: Recommendation,
}

pub struct CouncilResult {
    pub responses: Vec<CouncilResponse>,
    pub failed: Vec<CouncilFailure>,
    pub synthesis: CouncilSynthesis,
}

const COUNCIL_PREAMBLE: &str = "You are one of several independent experts consulted in parallel. \
Answer directly and concisely; do not mention other experts.\n\nQuestion:\n";

pub struct CouncilHandler;

impl CouncilHandler {
    /// Runs the council workflow (§4.9).
    pub async fn run(
        registry: &BackendRegistry,
        config: &ServerConfig,
        prompt: &str,
        topic: Topic,
        confidence_needed: ConfidenceNeeded,
        num_backends_override: Option<usize>,
        max_tokens: u32,
    ) -> Result<CouncilResult, AppError> {
        let needed = num_backends_override.unwrap_or_else(|| confidence_needed.backend_count()).clamp(2, 6);

        let mut candidates: Vec<String> = config
            .council
            .topics
            .get(&topic.to_string())
            .cloned()
            .unwrap_or_default()
            .into_iter()
            .filter(|name| registry.is_available(name))
            .collect();

        if candidates.len() < needed {
            for name in registry.global_chain() {
                if candidates.len() >= needed {
                    break;
                }
                if registry.is_available(name) && !candidates.contains(name) {
                    candidates.push(name.clone());
                }
            }
        }
        candidates.truncate(needed);

        if candidates.len() < 2 {
            return Err(AppError::Validation(format!(
                "council requires at least 2 available backends for topic `{topic}`, found {}",
                candidates.len()
            )));
        }

        let wrapped_prompt = format!("{COUNCIL_PREAMBLE}{prompt}");
        let started = std::time::Instant::now();

        // `max_tokens == 0` means "let the router decide" (§4.1), same
        // convention as the `ask` tool.
        let requested_max_tokens = if max_tokens == 0 {
            dynamic_token_limit(&RoutingContext::derive(&wrapped_prompt, max_tokens, None))
        } else {
            max_tokens
        };

        let token = CancellationToken::new();
        spawn_deadline(token.clone(), COUNCIL_DEADLINE);

        let calls = candidates.iter().map(|backend| {
            let wrapped_prompt = wrapped_prompt.clone();
            let token = token.clone();
            let max_tokens = registry
                .max_tokens_cap(backend)
                .map(|cap| clamp_max_tokens(requested_max_tokens, cap))
                .unwrap_or(requested_max_tokens);
            async move {
                let request = CallRequest::new(wrapped_prompt, max_tokens, 0.7, false);
                let outcome = cancellable(&token, registry.request_with_fallback(backend, request)).await;
                (backend.clone(), outcome)
            }
        });
        let results = join_all(calls).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let mut responses = Vec::new();
        let mut failed = Vec::new();
        for (backend, outcome) in results {
            match outcome {
                Ok(fallback) => responses.push(CouncilResponse {
                    backend: fallback.used_backend,
                    content: fallback.response.content,
                }),
                Err(e) => failed.push(CouncilFailure {
                    backend,
                    error: e.redacted_message(),
                }),
            }
        }

        if responses.is_empty() {
            return Err(AppError::AllBackendsFailed(
                failed.into_iter().map(|f| (f.backend, f.error)).collect(),
            ));
        }

        let agreement_level = Self::agreement_level(&responses);
        let quorum = (0.6 * candidates.len() as f64).ceil() as usize;
        let recommendation = if responses.len() >= quorum {
            Recommendation::Proceed
        } else {
            Recommendation::Review
        };

        let backends_succeeded = responses.len();
        Ok(CouncilResult {
            responses,
            failed,
            synthesis: CouncilSynthesis {
                backends_queried: candidates.len(),
                backends_succeeded,
                duration_ms,
                agreement_level,
                recommendation,
            },
        })
    }

    /// Pairwise Jaccard-like overlap over non-stopword tokens longer than 4
    /// characters; fraction of pairs with overlap > 0.3 buckets the result
    /// into `{high, moderate, divergent}` (§4.9 step 7).
    fn agreement_level(responses: &[CouncilResponse]) -> AgreementLevel {
        if responses.len() < 2 {
            return AgreementLevel::SingleResponse;
        }
        let token_sets: Vec<HashSet<String>> = responses.iter().map(|r| significant_tokens(&r.content)).collect();

        let mut total_pairs = 0u32;
        let mut agreeing_pairs = 0u32;
        for i in 0..token_sets.len() {
            for j in (i + 1)..token_sets.len() {
                total_pairs += 1;
                let overlap = jaccard(&token_sets[i], &token_sets[j]);
                if overlap > 0.3 {
                    agreeing_pairs += 1;
                }
            }
        }
        if total_pairs == 0 {
            return AgreementLevel::SingleResponse;
        }
        let fraction = agreeing_pairs as f64 / total_pairs as f64;
        if fraction >= 0.8 {
            AgreementLevel::High
        } else if fraction >= 0.5 {
            AgreementLevel::Moderate
        } else {
            AgreementLevel::Divergent
        }
    }
}

fn significant_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 4)
        .map(str::to_string)
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_response_yields_single_response_level() {
        let responses = vec![CouncilResponse {
            backend: "a".into(),
            content: "hello world".into(),
        }];
        assert_eq!(CouncilHandler::agreement_level(&responses), AgreementLevel::SingleResponse);
    }

    #[test]
    fn identical_responses_yield_high_agreement() {
        let responses = vec![
            CouncilResponse {
                backend: "a".into(),
                content: "exponential backoff retry strategy implementation".into(),
            },
            CouncilResponse {
                backend: "b".into(),
                content: "exponential backoff retry strategy implementation".into(),
            },
        ];
        assert_eq!(CouncilHandler::agreement_level(&responses), AgreementLevel::High);
    }

    #[test]
    fn unrelated_responses_yield_divergent_agreement() {
        let responses = vec![
            CouncilResponse {
                backend: "a".into(),
                content: "exponential backoff retry strategy implementation".into(),
            },
            CouncilResponse {
                backend: "b".into(),
                content: "purple elephants dance gracefully tonight".into(),
            },
        ];
        assert_eq!(CouncilHandler::agreement_level(&responses), AgreementLevel::Divergent);
    }
}
