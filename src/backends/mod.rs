//! Backend adapter factory and unified call/probe interface (§4.1).
//!
//! An [`Adapter`] wraps one [`BackendDescriptor`] and dispatches to the
//! translation module for its [`BackendKind`]. `local`, `openai_compatible`,
//! `nvidia`, and `groq` all speak the same OpenAI-compatible wire format
//! against different endpoints and are handled by [`openai_compat`]; `gemini`
//! and `anthropic_like` each get their own request/response translation.
//! This is the only layer that knows provider vocabulary — everything above
//! it deals exclusively in [`CallRequest`]/[`CallResponse`]/[`ProbeResult`].

mod anthropic;
mod gemini;
mod openai_compat;

use std::time::{Duration, Instant};

use crate::config::{BackendDescriptor, BackendKind};
use crate::error::AppError;

/// A normalized request, independent of provider wire format.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub thinking: bool,
    /// Classified once at construction so the registry can scale the
    /// per-request timeout (§4.1, §5) without re-deriving a full
    /// `RoutingContext` for every backend in a fallback chain.
    pub is_unity: bool,
    pub is_code_like: bool,
}

impl CallRequest {
    pub fn new(prompt: String, max_tokens: u32, temperature: f32, thinking: bool) -> Self {
        let task_type = crate::router::classify_task_type(&prompt);
        Self {
            is_unity: task_type == crate::router::TaskType::Unity,
            is_code_like: task_type == crate::router::TaskType::Code,
            prompt,
            max_tokens,
            temperature,
            thinking,
        }
    }
}

/// A normalized response, independent of provider wire format (§4.1).
#[derive(Debug, Clone)]
pub struct CallResponse {
    pub content: String,
    pub tokens_used: u32,
    pub reasoning_content: Option<String>,
    pub raw_latency_ms: u64,
}

/// Result of a liveness probe. Never an `Err` — non-reachability is reported
/// as `healthy: false` with `detail` explaining why.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub healthy: bool,
    pub latency_ms: u64,
    pub detail: Option<String>,
}

const CLOUD_PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const LOCAL_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// One adapter per configured backend. Holds its own `reqwest::Client` so
/// connection pools are not shared across backends with different base
/// URLs/auth.
pub struct Adapter {
    descriptor: BackendDescriptor,
    client: reqwest::Client,
}

impl Adapter {
    pub fn new(descriptor: BackendDescriptor) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(descriptor.default_timeout_ms))
            .build()?;
        Ok(Self { descriptor, client })
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    /// Cheap liveness check. Never returns `Err`; see [`ProbeResult`].
    pub async fn probe(&self) -> ProbeResult {
        let timeout = match self.descriptor.kind {
            BackendKind::Local => LOCAL_PROBE_TIMEOUT,
            _ => CLOUD_PROBE_TIMEOUT,
        };
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.probe_inner()).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(Ok(())) => ProbeResult {
                healthy: true,
                latency_ms,
                detail: None,
            },
            Ok(Err(e)) => ProbeResult {
                healthy: false,
                latency_ms,
                detail: Some(AppError::from(e).redacted_message()),
            },
            Err(_) => ProbeResult {
                healthy: false,
                latency_ms,
                detail: Some("probe timed out".to_string()),
            },
        }
    }

    async fn probe_inner(&self) -> anyhow::Result<()> {
        match self.descriptor.kind {
            BackendKind::Local | BackendKind::OpenaiCompatible | BackendKind::Nvidia | BackendKind::Groq => {
                openai_compat::probe(&self.client, &self.descriptor).await
            }
            BackendKind::Gemini => gemini::probe(&self.client, &self.descriptor).await,
            BackendKind::AnthropicLike => anthropic::probe(&self.client, &self.descriptor).await,
        }
    }

    /// Issue one HTTP request, translating into and out of the provider's
    /// wire format. The request-level timeout is computed fresh from the
    /// request and this adapter's backend kind (§4.1), not taken from the
    /// descriptor's static `default_timeout_ms`.
    pub async fn call(&self, request: CallRequest) -> Result<CallResponse, AppError> {
        let started = Instant::now();
        let timeout = dynamic_timeout(&request, &self.descriptor);
        let result = match self.descriptor.kind {
            BackendKind::Local | BackendKind::OpenaiCompatible | BackendKind::Nvidia | BackendKind::Groq => {
                openai_compat::call(&self.client, &self.descriptor, &request, timeout).await
            }
            BackendKind::Gemini => gemini::call(&self.client, &self.descriptor, &request, timeout).await,
            BackendKind::AnthropicLike => anthropic::call(&self.client, &self.descriptor, &request, timeout).await,
        };
        result.map(|mut resp| {
            resp.raw_latency_ms = started.elapsed().as_millis() as u64;
            resp
        })
    }
}

/// Clamp a requested `max_tokens` to the backend's configured cap (§4.1
/// "dynamic token limit" final clamp step).
pub fn clamp_max_tokens(requested: u32, cap: u32) -> u32 {
    requested.min(cap)
}

const MIN_DYNAMIC_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_DYNAMIC_TIMEOUT: Duration = Duration::from_secs(300);

/// Scales the per-request timeout within `[60s, 300s]` (§4.1, §5): a larger
/// requested output, a Unity prompt, and code-like content each push it up;
/// local backends get extra headroom since they're typically slower per
/// token than a hosted API. The registry applies the same computation
/// again before wrapping the call in `tokio::time::timeout`, so both layers
/// agree on the bound.
pub fn dynamic_timeout(request: &CallRequest, descriptor: &BackendDescriptor) -> Duration {
    let mut secs = 60.0_f64;
    secs += (request.max_tokens as f64 / 16_384.0).min(1.0) * 120.0;
    if request.is_unity {
        secs += 60.0;
    }
    if request.is_code_like {
        secs += 30.0;
    }
    if descriptor.kind == BackendKind::Local {
        secs += 30.0;
    }
    Duration::from_secs_f64(secs).clamp(MIN_DYNAMIC_TIMEOUT, MAX_DYNAMIC_TIMEOUT)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_descriptor(kind: BackendKind) -> BackendDescriptor {
        BackendDescriptor {
            name: "x".into(),
            kind,
            endpoint_url: "http://localhost:1".into(),
            model_id: "m".into(),
            api_key_env: None,
            priority: 0,
            max_tokens_cap: 8192,
            default_timeout_ms: 1000,
        }
    }

    #[test]
    fn clamp_max_tokens_never_exceeds_cap() {
        assert_eq!(clamp_max_tokens(20_000, 8_192), 8_192);
        assert_eq!(clamp_max_tokens(1_000, 8_192), 1_000);
    }

    #[test]
    fn dynamic_timeout_stays_within_bounds() {
        let descriptor = test_descriptor(BackendKind::OpenaiCompatible);
        let request = CallRequest::new("hello".into(), 100, 0.5, false);
        let timeout = dynamic_timeout(&request, &descriptor);
        assert!(timeout >= MIN_DYNAMIC_TIMEOUT);
        assert!(timeout <= MAX_DYNAMIC_TIMEOUT);
    }

    #[test]
    fn unity_and_local_push_timeout_higher_than_a_plain_cloud_request() {
        let cloud = test_descriptor(BackendKind::OpenaiCompatible);
        let local = test_descriptor(BackendKind::Local);
        let plain = CallRequest::new("please fix this bug in my function".into(), 1000, 0.5, false);
        let unity = CallRequest::new("tweak this unity monobehaviour prefab".into(), 1000, 0.5, false);

        assert!(dynamic_timeout(&unity, &cloud) > dynamic_timeout(&plain, &cloud));
        assert!(dynamic_timeout(&plain, &local) > dynamic_timeout(&plain, &cloud));
    }
}
