//! Single-backend ask tool: direct (forced) or auto-routed (§4.8).

use crate::backends::{clamp_max_tokens, CallRequest};
use crate::error::AppError;
use crate::registry::BackendRegistry;
use crate::router::{dynamic_token_limit, Router, RoutingContext, RoutingDecision, RoutingOutcome};
use crate::learning::LearningEngine;

use super::looks_truncated;

const MAX_CONTINUATION_CHUNKS: u32 = 3;
const CONTINUATION_MARKER: &str = "\n\n--- continued ---\n\n";

pub struct AskResponse {
    pub content: String,
    pub backend_used: String,
    pub fallback_chain: Vec<String>,
    pub latency_ms: u64,
    pub routing: RoutingDecision,
}

pub struct AskOutcome {
    pub response: AskResponse,
    pub routing_outcome: RoutingOutcome,
}

pub struct AskHandler;

impl AskHandler {
    /// Runs the ask tool (§4.8). `force_backend = Some("auto")` or `None`
    /// both mean auto-routed; any other value means direct-forced (no
    /// fallback chain on failure).
    pub async fn ask(
        registry: &BackendRegistry,
        learning: &LearningEngine,
        prompt: String,
        max_tokens: u32,
        temperature: f32,
        thinking: bool,
        force_backend: Option<String>,
        enable_chunking: bool,
    ) -> Result<AskOutcome, AppError> {
        let context = RoutingContext::derive(&prompt, max_tokens, force_backend.clone());
        let decision = Router::route(&context, registry, learning);

        // A caller-supplied `max_tokens` of 0 means "let the router decide"
        // (§4.1); otherwise the caller's value is respected, still subject
        // to the backend's own cap.
        let requested_max_tokens = if max_tokens == 0 {
            dynamic_token_limit(&context)
        } else {
            max_tokens
        };
        let max_tokens = registry
            .max_tokens_cap(&decision.backend)
            .map(|cap| clamp_max_tokens(requested_max_tokens, cap))
            .unwrap_or(requested_max_tokens);

        let request = CallRequest::new(prompt.clone(), max_tokens, temperature, thinking);

        let is_direct = force_backend
            .as_deref()
            .map(|b| b != "auto")
            .unwrap_or(false);

        let started = std::time::Instant::now();
        let (mut content, backend_used, fallback_chain, tokens_used, call_result);
        if is_direct {
            let result = registry.request(&decision.backend, request).await;
            call_result = result.is_ok();
            let response = result?;
            tokens_used = response.tokens_used;
            content = response.content;
            backend_used = decision.backend.clone();
            fallback_chain = vec![decision.backend.clone()];
        } else {
            let result = registry.request_with_fallback(&decision.backend, request).await;
            call_result = result.is_ok();
            let outcome = result?;
            tokens_used = outcome.response.tokens_used;
            content = outcome.response.content;
            backend_used = outcome.used_backend;
            fallback_chain = outcome.fallback_chain;
        }
        let latency_ms = started.elapsed().as_millis() as u64;

        if enable_chunking && looks_truncated(&content, tokens_used, max_tokens) {
            content = Self::continue_until_complete(
                registry,
                &backend_used,
                &prompt,
                &content,
                max_tokens,
                temperature,
                thinking,
            )
            .await;
        }

        let routing_outcome = RoutingOutcome {
            backend: backend_used.clone(),
            complexity: context.complexity,
            task_type: context.task_type,
            success: call_result,
            latency_ms,
            source: decision.source,
        };

        Ok(AskOutcome {
            response: AskResponse {
                content,
                backend_used,
                fallback_chain,
                latency_ms,
                routing: decision,
            },
            routing_outcome,
        })
    }

    /// Re-issues the same backend with a continuation prompt while the
    /// response keeps coming back truncated, joining chunks with an
    /// explicit boundary marker (§4.8).
    async fn continue_until_complete(
        registry: &BackendRegistry,
        backend: &str,
        original_prompt: &str,
        first_chunk: &str,
        max_tokens: u32,
        temperature: f32,
        thinking: bool,
    ) -> String {
        let mut joined = first_chunk.to_string();
        let mut latest = first_chunk.to_string();

        for _ in 0..MAX_CONTINUATION_CHUNKS {
            let continuation_prompt = format!(
                "Continue exactly where you left off. Original request:\n{original_prompt}\n\nAlready written:\n{latest}"
            );
            let request = CallRequest::new(continuation_prompt, max_tokens, temperature, thinking);
            let Ok(response) = registry.request(backend, request).await else {
                break;
            };
            joined.push_str(CONTINUATION_MARKER);
            joined.push_str(&response.content);
            let still_truncated = looks_truncated(&response.content, response.tokens_used, max_tokens);
            latest = response.content;
            if !still_truncated {
                break;
            }
        }
        joined
    }
}
