//! Shared adapter for every backend kind that speaks the OpenAI-compatible
//! chat-completions wire format: `local` (Ollama/LM Studio/vLLM), the
//! generic `openai_compatible` kind, and the `nvidia`/`groq` kinds, which are
//! the same wire format against a different catalog and base URL.

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
    let url = format!(
        "{}/v1/chat/completions",
        descriptor.endpoint_url.trim_end_matches('/')
    );
    let body = to_openai(descriptor, request);

    let mut req = client.post(&url).timeout(timeout).json(&body);
    if let Some(key) = descriptor.api_key() {
        req = req.bearer_auth(key);
    }

    let response = req
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

    from_openai(&descriptor.name, parsed)
}

pub(super) async fn probe(client: &Client, descriptor: &BackendDescriptor) -> anyhow::Result<()> {
    let url = format!("{}/v1/models", descriptor.endpoint_url.trim_end_matches('/'));
    let mut req = client.get(&url);
    if let Some(key) = descriptor.api_key() {
        req = req.bearer_auth(key);
    }
    let response = req.send().await?;
    anyhow::ensure!(
        response.status().is_success(),
        "health probe returned HTTP {}",
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

fn to_openai(descriptor: &BackendDescriptor, request: &CallRequest) -> Value {
    json!({
        "model": descriptor.model_id,
        "messages": [{ "role": "user", "content": request.prompt }],
        "max_tokens": request.max_tokens,
        "temperature": request.temperature,
    })
}

fn from_openai(backend: &str, resp: Value) -> Result<CallResponse, AppError> {
    let content = resp["choices"][0]["message"]["content"]
        .as_str()
        .ok_or_else(|| AppError::InvalidResponse {
            backend: backend.to_string(),
        })?
        .to_string();
    let tokens_used = resp["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;
    Ok(CallResponse {
        content,
        tokens_used,
        reasoning_content: None,
        raw_latency_ms: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> BackendDescriptor {
        BackendDescriptor {
            name: "local".into(),
            kind: crate::config::BackendKind::Local,
            endpoint_url: "http://localhost:11434".into(),
            model_id: "qwen2.5:7b".into(),
            api_key_env: None,
            priority: 0,
            max_tokens_cap: 8192,
            default_timeout_ms: 30_000,
        }
    }

    #[test]
    fn to_openai_wraps_prompt_as_single_user_message() {
        let req = CallRequest::new("hi".into(), 100, 0.5, false);
        let body = to_openai(&descriptor(), &req);
        assert_eq!(body["messages"][0]["content"], "hi");
        assert_eq!(body["max_tokens"], 100);
    }

    #[test]
    fn from_openai_extracts_content_and_tokens() {
        let resp = json!({
            "choices": [{ "message": { "content": "hello back" } }],
            "usage": { "completion_tokens": 3 },
        });
        let out = from_openai("local", resp).unwrap();
        assert_eq!(out.content, "hello back");
        assert_eq!(out.tokens_used, 3);
    }

    #[test]
    fn from_openai_errors_when_content_missing() {
        let resp = json!({ "choices": [{ "message": {} }] });
        assert!(matches!(
            from_openai("local", resp),
            Err(AppError::InvalidResponse { .. })
        ));
    }
}
