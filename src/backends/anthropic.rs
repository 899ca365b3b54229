//! Anthropic-like Messages API adapter (`BackendKind::AnthropicLike`).
//!
//! Translates between the internal [`CallRequest`]/[`CallResponse`] shape and
//! Anthropic's [`/v1/messages`](https://docs.anthropic.com/en/api/messages)
//! API.
//!
//! # Protocol differences handled here
//!
//! | Concern | Internal | Anthropic |
//! |---|---|---|
//! | Max tokens | Always present | **Required** (`max_tokens`) |
//! | Finish reasons | n/a | `"end_turn"`, `"max_tokens"` |
//! | Response shape | `content` string | `content[].text` |
//! | Auth header | n/a | `x-api-key: …` |

use std::time::Duration;

use anyhow::Context;
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::BackendDescriptor;
use crate::error::AppError;

use super::{CallRequest, CallResponse};

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

pub(super) async fn call(
    client: &Client,
    descriptor: &BackendDescriptor,
    request: &CallRequest,
    timeout: Duration,
) -> Result<CallResponse, AppError> {
    let body = to_anthropic(descriptor, request);
    let url = format!("{}/v1/messages", descriptor.endpoint_url.trim_end_matches('/'));

    let api_key = descriptor.api_key().ok_or_else(|| AppError::Auth {
        backend: descriptor.name.clone(),
    })?;

    let response = client
        .post(&url)
        .timeout(timeout)
        .header("x-api-key", api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&body)
        .send()
        .await
        .map_err(|e| transport_or_timeout(descriptor, e, timeout))?;

    let status = response.status();
    if !status.is_success() {
        return Err(AppError::from_status(&descriptor.name, status.as_u16()));
    }

    let parsed: Value = response.json().await.map_err(|_| AppError::InvalidResponse {
        backend: descriptor.name.clone(),
    })?;

    from_anthropic(&descriptor.name, parsed)
}

pub(super) async fn probe(client: &Client, descriptor: &BackendDescriptor) -> anyhow::Result<()> {
    // Anthropic has no `/v1/models` endpoint; a minimal 1-token request is
    // the only reliable way to verify auth + connectivity.
    let api_key = descriptor
        .api_key()
        .context("anthropic-like backend requires an API key")?;
    let probe_body = json!({
        "model": descriptor.model_id,
        "max_tokens": 1,
        "messages": [{ "role": "user", "content": "ping" }],
    });
    let url = format!("{}/v1/messages", descriptor.endpoint_url.trim_end_matches('/'));
    let response = client
        .post(&url)
        .header("x-api-key", api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&probe_body)
        .send()
        .await
        .with_context(|| format!("probe POST {url}"))?;
    anyhow::ensure!(
        response.status().is_success(),
        "anthropic-like health probe returned HTTP {}",
        response.status()
    );
    Ok(())
}

fn transport_or_timeout(descriptor: &BackendDescriptor, e: reqwest::Error, timeout: Duration) -> AppError {
    if e.is_timeout() {
        AppError::Timeout {
            backend: descriptor.name.clone(),
            elapsed_ms: timeout.as_millis() as u64,
        }
    } else {
        AppError::Transport {
            backend: descriptor.name.clone(),
            detail: e.to_string(),
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────
// Schema translation — pub(super) for unit testing
// ──────────────────────────────────────────────────────────────────────────

pub(super) fn to_anthropic(descriptor: &BackendDescriptor, request: &CallRequest) -> Value {
    let mut body = json!({
        "model": descriptor.model_id,
        "max_tokens": request.max_tokens,
        "messages": [{ "role": "user", "content": request.prompt }],
        "temperature": request.temperature,
    });
    if request.thinking {
        body["thinking"] = json!({ "type": "enabled", "budget_tokens": request.max_tokens / 2 });
    }
    body
}

pub(super) fn from_anthropic(backend: &str, resp: Value) -> Result<CallResponse, AppError> {
    let text = resp["content"]
        .as_array()
        .and_then(|blocks| blocks.iter().find(|b| b["type"] == "text"))
        .and_then(|b| b["text"].as_str())
        .ok_or_else(|| AppError::InvalidResponse {
            backend: backend.to_string(),
        })?
        .to_string();

    let reasoning_content = resp["content"]
        .as_array()
        .and_then(|blocks| blocks.iter().find(|b| b["type"] == "thinking"))
        .and_then(|b| b["thinking"].as_str())
        .map(str::to_string);

    let output_tokens = resp["usage"]["output_tokens"].as_u64().unwrap_or(0) as u32;

    Ok(CallResponse {
        content: text,
        tokens_used: output_tokens,
        reasoning_content,
        raw_latency_ms: 0,
    })
}
