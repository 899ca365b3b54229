//! Google Gemini `generateContent` adapter (`BackendKind::Gemini`).
//!
//! Gemini's wire format differs from the OpenAI-compatible shape in the
//! request envelope (`contents[].parts[].text`, `generationConfig`), the
//! auth mechanism (`key` query parameter, not a header), and the response
//! shape (`candidates[].content.parts[].text`).

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};

use crate::config::BackendDescriptor;
use crate::error::AppError;

use super::{CallRequest, CallResponse};

pub(super) async fn call(
    client: &Client,
    descriptor: &BackendDescriptor,
    request: &CallRequest,
    timeout: Duration,
) -> Result<CallResponse, AppError> {
    let api_key = descriptor.api_key().ok_or_else(|| AppError::Auth {
        backend: descriptor.name.clone(),
    })?;
    let url = format!(
        "{}/v1beta/models/{}:generateContent",
        descriptor.endpoint_url.trim_end_matches('/'),
        descriptor.model_id
    );
    let body = to_gemini(request);

    let response = client
        .post(&url)
        .timeout(timeout)
        .query(&[("key", api_key)])
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

    from_gemini(&descriptor.name, parsed)
}

pub(super) async fn probe(client: &Client, descriptor: &BackendDescriptor) -> anyhow::Result<()> {
    let api_key = descriptor
        .api_key()
        .ok_or_else(|| anyhow::anyhow!("gemini backend requires an API key"))?;
    let url = format!("{}/v1beta/models", descriptor.endpoint_url.trim_end_matches('/'));
    let response = client.get(&url).query(&[("key", api_key)]).send().await?;
    anyhow::ensure!(
        response.status().is_success(),
        "gemini health probe returned HTTP {}",
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

pub(super) fn to_gemini(request: &CallRequest) -> Value {
    json!({
        "contents": [{ "parts": [{ "text": request.prompt }] }],
        "generationConfig": {
            "maxOutputTokens": request.max_tokens,
            "temperature": request.temperature,
        }
    })
}

pub(super) fn from_gemini(backend: &str, resp: Value) -> Result<CallResponse, AppError> {
    let text = resp["candidates"][0]["content"]["parts"][0]["text"]
        .as_str()
        .ok_or_else(|| AppError::InvalidResponse {
            backend: backend.to_string(),
        })?
        .to_string();
    let tokens_used = resp["usageMetadata"]["candidatesTokenCount"]
        .as_u64()
        .unwrap_or(0) as u32;
    Ok(CallResponse {
        content: text,
        tokens_used,
        reasoning_content: None,
        raw_latency_ms: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_gemini_wraps_prompt_in_contents_parts() {
        let req = CallRequest::new("hi".into(), 64, 0.7, false);
        let body = to_gemini(&req);
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hi");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 64);
    }

    #[test]
    fn from_gemini_extracts_candidate_text() {
        let resp = json!({
            "candidates": [{ "content": { "parts": [{ "text": "hello" }] } }],
            "usageMetadata": { "candidatesTokenCount": 2 },
        });
        let out = from_gemini("gemini", resp).unwrap();
        assert_eq!(out.content, "hello");
        assert_eq!(out.tokens_used, 2);
    }

    #[test]
    fn from_gemini_errors_when_no_candidates() {
        let resp = json!({ "candidates": [] });
        assert!(matches!(
            from_gemini("gemini", resp),
            Err(AppError::InvalidResponse { .. })
        ));
    }
}
