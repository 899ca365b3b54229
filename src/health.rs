//! HealthMonitor: periodic + on-demand backend health probing (§4.3).
//!
//! No request is ever gated on a synchronous probe; the health signal
//! informs fallback-chain *ordering* only (`BackendRegistry::request_with_fallback`
//! skips backends known `unhealthy`, but the registry itself decides that).

use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;

use crate::backends::{Adapter, ProbeResult};

const ON_DEMAND_CACHE_TTL: Duration = Duration::from_secs(5 * 60);
const PERIODIC_INTERVAL: Duration = Duration::from_secs(30);
const PARALLEL_PROBE_DEADLINE: Duration = Duration::from_secs(3);

#[derive(Debug, Clone)]
struct CachedProbe {
    result: ProbeResult,
    at: Instant,
}

/// Caches on-demand probe results per backend for 5 minutes (§4.3 mode 2).
pub struct HealthMonitor {
    cache: DashMap<String, CachedProbe>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    /// On-demand probe for one backend (`check_backend_health` tool, §6).
    /// Returns the cached result unless it is stale or `force` is set.
    pub async fn check(&self, adapter: &Adapter, force: bool) -> ProbeResult {
        if !force {
            if let Some(entry) = self.cache.get(adapter.name()) {
                if entry.at.elapsed() < ON_DEMAND_CACHE_TTL {
                    return entry.result.clone();
                }
            }
        }
        let result = adapter.probe().await;
        self.cache.insert(
            adapter.name().to_string(),
            CachedProbe {
                result: result.clone(),
                at: Instant::now(),
            },
        );
        result
    }

    /// Probe every backend in parallel, bounded by a 3s global deadline
    /// (§4.4 `checkHealth`). Backends that don't respond in time are
    /// reported unhealthy with a timeout detail, not omitted.
    pub async fn check_all(&self, adapters: &[Adapter]) -> Vec<(String, ProbeResult)> {
        let probes = adapters.iter().map(|a| async move {
            let result = tokio::time::timeout(PARALLEL_PROBE_DEADLINE, a.probe())
                .await
                .unwrap_or(ProbeResult {
                    healthy: false,
                    latency_ms: PARALLEL_PROBE_DEADLINE.as_millis() as u64,
                    detail: Some("global health-check deadline exceeded".to_string()),
                });
            (a.name().to_string(), result)
        });
        join_all(probes).await
    }

    /// Spawns the periodic 30s probe loop (§4.3 mode 1). Intended to run as
    /// a detached background task for the process's lifetime; callers
    /// observe its effect only through the registry's `BackendState`, which
    /// `on_tick`'s own call into `BackendRegistry::check_health` updates via
    /// `record_probe_result`.
    pub async fn run_periodic<F, Fut>(&self, mut on_tick: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(PERIODIC_INTERVAL);
        loop {
            interval.tick().await;
            on_tick().await;
        }
    }
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}
