//! BackendRegistry: the single entry point for "issue a call to one or more
//! backends" (§4.4). Owns adapters, circuit breakers, and health state.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::Mutex;

use crate::backends::{dynamic_timeout, Adapter, CallRequest, CallResponse};
use crate::circuit_breaker::CircuitBreaker;
use crate::concurrency::{ConcurrentRequestManager, Priority};
use crate::config::ServerConfig;
use crate::error::AppError;
use crate::health::HealthMonitor;

/// Last-known health classification (§3 `BackendState.health`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// Mutable per-backend state owned by the registry (§3 `BackendState`).
/// Every configured descriptor has exactly one entry for the process's
/// lifetime.
#[derive(Debug, Clone)]
pub struct BackendState {
    pub health: Health,
    pub last_probe_at: Option<Instant>,
    pub consecutive_failures: u32,
    pub avg_latency_ms: f64,
    pub in_flight_count: u32,
}

impl Default for BackendState {
    fn default() -> Self {
        Self {
            health: Health::Unknown,
            last_probe_at: None,
            consecutive_failures: 0,
            avg_latency_ms: 0.0,
            in_flight_count: 0,
        }
    }
}

/// Result of `request_with_fallback` (§4.4).
pub struct FallbackOutcome {
    pub response: CallResponse,
    pub used_backend: String,
    pub fallback_chain: Vec<String>,
}

pub struct BackendRegistry {
    adapters: std::collections::HashMap<String, Adapter>,
    breakers: DashMap<String, Mutex<CircuitBreaker>>,
    states: DashMap<String, BackendState>,
    health_monitor: HealthMonitor,
    global_chain: Vec<String>,
    concurrency: ConcurrentRequestManager,
}

impl BackendRegistry {
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let mut adapters = std::collections::HashMap::new();
        let breakers = DashMap::new();
        let states = DashMap::new();

        for descriptor in &config.backends {
            let name = descriptor.name.clone();
            adapters.insert(name.clone(), Adapter::new(descriptor.clone())?);
            breakers.insert(
                name.clone(),
                Mutex::new(CircuitBreaker::new(
                    config.circuit_breaker.fail_threshold,
                    Duration::from_secs(config.circuit_breaker.cooldown_secs),
                )),
            );
            states.insert(name, BackendState::default());
        }

        Ok(Self {
            adapters,
            breakers,
            states,
            health_monitor: HealthMonitor::new(),
            global_chain: config.fallback_chain(),
            concurrency: ConcurrentRequestManager::new(config.max_concurrent),
        })
    }

    pub fn global_chain(&self) -> &[String] {
        &self.global_chain
    }

    pub fn concurrency_metrics(&self) -> crate::concurrency::ManagerMetrics {
        self.concurrency.metrics()
    }

    pub fn has_backend(&self, name: &str) -> bool {
        self.adapters.contains_key(name)
    }

    /// True if `name` is configured, its breaker is not open, and its last
    /// known health is not `unhealthy` (§4.9 step 1 "available" filter).
    pub fn is_available(&self, name: &str) -> bool {
        if !self.has_backend(name) {
            return false;
        }
        if self.health_of(name) == Health::Unhealthy {
            return false;
        }
        self.breakers
            .get(name)
            .map(|b| b.try_lock().map(|mut b| b.admits_request()).unwrap_or(true))
            .unwrap_or(true)
    }

    pub fn health_of(&self, name: &str) -> Health {
        self.states
            .get(name)
            .map(|s| s.health)
            .unwrap_or(Health::Unknown)
    }

    /// The configured `max_tokens_cap` for `name`, used by handlers to clamp
    /// a dynamically computed token limit (§4.1) before building the call.
    pub fn max_tokens_cap(&self, name: &str) -> Option<u32> {
        self.adapters.get(name).map(|a| a.descriptor().max_tokens_cap)
    }

    /// `request(backend_name, request) → response` (§4.4). Rejects
    /// immediately if the breaker is open; otherwise waits for a concurrency
    /// permit (§4.5) and calls `adapter.call` wrapped in a timeout. On
    /// success, decrements the breaker; on typed error, increments it and
    /// propagates.
    pub async fn request(&self, backend_name: &str, request: CallRequest) -> Result<CallResponse, AppError> {
        let adapter = self
            .adapters
            .get(backend_name)
            .ok_or_else(|| AppError::Validation(format!("unknown backend `{backend_name}`")))?;

        {
            let breaker = self
                .breakers
                .get(backend_name)
                .expect("breaker exists for every configured backend");
            let mut breaker = breaker.lock().await;
            if !breaker.admits_request() {
                return Err(AppError::CircuitOpen {
                    backend: backend_name.to_string(),
                });
            }
        }

        let timeout = dynamic_timeout(&request, adapter.descriptor());
        let outcome = self
            .concurrency
            .submit(Priority::Normal, || async {
                match tokio::time::timeout(timeout, adapter.call(request)).await {
                    Ok(inner) => inner,
                    Err(_) => Err(AppError::Timeout {
                        backend: backend_name.to_string(),
                        elapsed_ms: timeout.as_millis() as u64,
                    }),
                }
            })
            .await;

        self.record_result(backend_name, &outcome).await;
        outcome
    }

    async fn record_result(&self, backend_name: &str, outcome: &Result<CallResponse, AppError>) {
        let breaker = self
            .breakers
            .get(backend_name)
            .expect("breaker exists for every configured backend");
        let mut breaker = breaker.lock().await;

        let mut state = self
            .states
            .get_mut(backend_name)
            .expect("state exists for every configured backend");

        match outcome {
            Ok(resp) => {
                breaker.record_success();
                state.consecutive_failures = 0;
                state.avg_latency_ms = ema(state.avg_latency_ms, resp.raw_latency_ms as f64, 0.3);
                if state.health != Health::Healthy {
                    state.health = Health::Healthy;
                }
            }
            Err(e) => {
                if e.counts_as_breaker_failure() {
                    breaker.record_failure();
                    state.consecutive_failures += 1;
                }
                if e.marks_degraded() {
                    state.health = Health::Degraded;
                } else if state.consecutive_failures >= 3 {
                    state.health = Health::Unhealthy;
                }
            }
        }
    }

    /// `request_with_fallback(preferred_backend, request) → {response,
    /// used_backend, fallback_chain[]}` (§4.4). Tries `preferred_backend`
    /// first, then walks the global chain in priority order, skipping
    /// backends whose breaker is open or whose last known health is
    /// `unhealthy`. `preferred_backend` is tried first but not re-inserted
    /// into the chain on failure.
    pub async fn request_with_fallback(
        &self,
        preferred_backend: &str,
        request: CallRequest,
    ) -> Result<FallbackOutcome, AppError> {
        let mut attempts: Vec<(String, String)> = Vec::new();
        let mut tried: Vec<String> = Vec::new();

        let mut candidates: Vec<String> = vec![preferred_backend.to_string()];
        for name in &self.global_chain {
            if name != preferred_backend {
                candidates.push(name.clone());
            }
        }

        for (idx, name) in candidates.iter().enumerate() {
            if idx > 0 && self.should_skip(name) {
                continue;
            }
            tried.push(name.clone());
            match self.request(name, request.clone()).await {
                Ok(response) => {
                    return Ok(FallbackOutcome {
                        response,
                        used_backend: name.clone(),
                        fallback_chain: tried,
                    });
                }
                Err(e) => attempts.push((name.clone(), e.redacted_message())),
            }
        }

        Err(AppError::AllBackendsFailed(attempts))
    }

    fn should_skip(&self, name: &str) -> bool {
        let breaker_open = self
            .breakers
            .get(name)
            .map(|b| {
                // try_lock: best-effort, a held lock just means "don't skip
                // on this stale check", the subsequent request() call re-checks.
                b.try_lock()
                    .map(|mut b| !b.admits_request())
                    .unwrap_or(false)
            })
            .unwrap_or(false);
        let unhealthy = self.health_of(name) == Health::Unhealthy;
        breaker_open || unhealthy
    }

    /// `checkHealth() → map<name, {healthy, latency, detail?}>` (§4.4).
    /// Probes every backend in parallel under a global deadline; adapters are
    /// stored by value in a `HashMap` (not `Clone`), so this drives the join
    /// directly rather than delegating to `HealthMonitor::check_all`, which
    /// takes an owned slice. Each probe's result is folded into `states`/the
    /// breaker via `record_probe_result` before returning, so a periodic
    /// sweep actually moves fallback-chain ordering, not just logs (§4.3).
    pub async fn check_health(&self) -> Vec<(String, crate::backends::ProbeResult)> {
        use futures_util::future::join_all;

        let probes = self.adapters.values().map(|adapter| async move {
            let result = self
                .concurrency
                .submit(Priority::HealthProbe, || adapter.probe())
                .await;
            self.record_probe_result(adapter.name(), &result).await;
            (adapter.name().to_string(), result)
        });
        join_all(probes).await
    }

    /// Folds a health-probe outcome into the same breaker/state bookkeeping
    /// a completed request uses (§4.3), so a probe's `healthy` flag matters
    /// exactly as much as a request's success/failure does.
    async fn record_probe_result(&self, backend_name: &str, probe: &crate::backends::ProbeResult) {
        let Some(breaker) = self.breakers.get(backend_name) else {
            return;
        };
        let mut breaker = breaker.lock().await;
        let Some(mut state) = self.states.get_mut(backend_name) else {
            return;
        };

        if probe.healthy {
            breaker.record_success();
            state.consecutive_failures = 0;
            state.avg_latency_ms = ema(state.avg_latency_ms, probe.latency_ms as f64, 0.3);
            state.health = Health::Healthy;
        } else {
            breaker.record_failure();
            state.consecutive_failures += 1;
            state.health = if state.consecutive_failures >= 3 {
                Health::Unhealthy
            } else {
                Health::Degraded
            };
        }
        state.last_probe_at = Some(Instant::now());
    }

    pub async fn check_backend_health(&self, backend_name: &str, force: bool) -> Result<crate::backends::ProbeResult, AppError> {
        let adapter = self
            .adapters
            .get(backend_name)
            .ok_or_else(|| AppError::Validation(format!("unknown backend `{backend_name}`")))?;
        Ok(self.health_monitor.check(adapter, force).await)
    }
}

fn ema(old: f64, observed: f64, alpha: f64) -> f64 {
    alpha * observed + (1.0 - alpha) * old
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BackendDescriptor, BackendKind, CircuitBreakerConfig, CouncilConfig, DualIterateConfig, LearningConfig, PatternStoreConfig};

    fn descriptor(name: &str, url: &str, priority: i32) -> BackendDescriptor {
        BackendDescriptor {
            name: name.into(),
            kind: BackendKind::OpenaiCompatible,
            endpoint_url: url.into(),
            model_id: "m".into(),
            api_key_env: None,
            priority,
            max_tokens_cap: 1024,
            default_timeout_ms: 2000,
        }
    }

    fn config(backends: Vec<BackendDescriptor>) -> ServerConfig {
        ServerConfig {
            backends,
            council: CouncilConfig::default(),
            dual_iterate: DualIterateConfig {
                default_coder: "a".into(),
                default_reviewer: "a".into(),
            },
            learning: LearningConfig::default(),
            circuit_breaker: CircuitBreakerConfig {
                fail_threshold: 5,
                cooldown_secs: 30,
            },
            patterns: PatternStoreConfig::default(),
            data_dir: "data".into(),
            log_level: None,

            max_concurrent: 250,
        }
    }

    fn req() -> CallRequest {
        CallRequest::new("hi".into(), 16, 0.0, false)
    }

    #[tokio::test]
    async fn single_fallback_tries_preferred_then_next_in_priority_order() {
        let server_a = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&server_a)
            .await;

        let server_b = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "content": "ok" } }],
                "usage": { "completion_tokens": 1 },
            })))
            .mount(&server_b)
            .await;

        let backends = vec![
            descriptor("A", &server_a.uri(), 0),
            descriptor("B", &server_b.uri(), 1),
        ];
        let registry = BackendRegistry::new(&config(backends)).unwrap();

        let outcome = registry.request_with_fallback("A", req()).await.unwrap();
        assert_eq!(outcome.used_backend, "B");
        assert_eq!(outcome.fallback_chain, vec!["A".to_string(), "B".to_string()]);
    }

    #[tokio::test]
    async fn breaker_opens_after_fail_threshold_and_blocks_request() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let mut cfg = config(vec![descriptor("A", &server.uri(), 0)]);
        cfg.circuit_breaker.fail_threshold = 2;
        let registry = BackendRegistry::new(&cfg).unwrap();

        assert!(registry.request("A", req()).await.is_err());
        assert!(registry.request("A", req()).await.is_err());
        // third call should be rejected by the breaker without reaching the mock
        let result = registry.request("A", req()).await;
        assert!(matches!(result, Err(AppError::CircuitOpen { .. })));
    }

    #[test]
    fn max_tokens_cap_reflects_configured_descriptor() {
        let registry = BackendRegistry::new(&config(vec![descriptor("A", "http://x", 0)])).unwrap();
        assert_eq!(registry.max_tokens_cap("A"), Some(1024));
        assert_eq!(registry.max_tokens_cap("missing"), None);
    }

    #[tokio::test]
    async fn all_backends_failing_returns_aggregated_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let backends = vec![descriptor("A", &server.uri(), 0), descriptor("B", &server.uri(), 1)];
        let registry = BackendRegistry::new(&config(backends)).unwrap();
        let result = registry.request_with_fallback("A", req()).await;
        assert!(matches!(result, Err(AppError::AllBackendsFailed(_))));
    }
}
