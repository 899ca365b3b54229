//! Bounded-concurrency request scheduling (§4.5).
//!
//! Gates *when* a submitted unit of work begins; it never owns work
//! semantics or cancellation — those are the caller's responsibility. Two
//! priority classes are modeled: health probes and normal requests, each a
//! real queue inside [`Admission`] rather than a bookkeeping-only list —
//! when a slot frees up it is handed to the highest-priority waiter, so a
//! probe queued behind a run of normal requests still jumps ahead of them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex};

/// Submission priority. Health probes jump the queue ahead of normal
/// requests when both are waiting for a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Normal,
    HealthProbe,
}

#[derive(Debug, Default)]
struct Metrics {
    queued: AtomicUsize,
    peak_concurrency: AtomicUsize,
    total_queue_wait_ms: AtomicU64,
    total_completed: AtomicU64,
    total_latency_ms: AtomicU64,
    /// Completion timestamps within the trailing throughput window; pruned
    /// on every read and every completion. A `std::sync::Mutex` is enough
    /// since the critical section never spans an `.await`.
    completions: std::sync::Mutex<VecDeque<Instant>>,
}

const THROUGHPUT_WINDOW: Duration = Duration::from_secs(10);

/// Snapshot of manager metrics (§4.5).
#[derive(Debug, Clone, Copy)]
pub struct ManagerMetrics {
    pub in_flight: usize,
    pub queued: usize,
    pub peak_concurrency: usize,
    pub rolling_throughput: f64,
    pub avg_latency_ms: f64,
    pub avg_queue_wait_ms: f64,
}

struct Waiter {
    priority: Priority,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct AdmissionState {
    in_use: usize,
    waiters: VecDeque<Waiter>,
}

/// A real two-level priority queue gating access to `max_concurrent` slots.
/// `Priority::HealthProbe` waiters are always inserted ahead of any queued
/// `Priority::Normal` waiter, and FIFO within their own class (§4.5).
struct Admission {
    max_concurrent: usize,
    state: Mutex<AdmissionState>,
}

impl Admission {
    fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            state: Mutex::new(AdmissionState::default()),
        }
    }

    async fn acquire(&self, priority: Priority) {
        let rx = {
            let mut state = self.state.lock().await;
            if state.in_use < self.max_concurrent {
                state.in_use += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let waiter = Waiter { priority, grant: tx };
                match priority {
                    Priority::HealthProbe => {
                        let pos = state
                            .waiters
                            .iter()
                            .position(|w| w.priority == Priority::Normal)
                            .unwrap_or(state.waiters.len());
                        state.waiters.insert(pos, waiter);
                    }
                    Priority::Normal => state.waiters.push_back(waiter),
                }
                Some(rx)
            }
        };
        if let Some(rx) = rx {
            // The releaser hands the slot directly to us; `in_use` was
            // never decremented on our behalf, so no further bookkeeping
            // is needed here.
            let _ = rx.await;
        }
    }

    async fn release(&self) {
        let mut state = self.state.lock().await;
        if let Some(waiter) = state.waiters.pop_front() {
            let _ = waiter.grant.send(());
        } else {
            state.in_use -= 1;
        }
    }
}

/// Bounded worker-pool abstraction shared by any component that fans out
/// requests (council, parallel-agents, health sweeps).
pub struct ConcurrentRequestManager {
    max_concurrent: usize,
    in_flight: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
    admission: Arc<Admission>,
}

impl ConcurrentRequestManager {
    /// `max_concurrent` default is 250 across the process (§4.5); per-handler
    /// callers (council, parallel-agents) impose tighter caps of their own by
    /// constructing a manager with a smaller value, or by limiting batch size
    /// before submission.
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            in_flight: Arc::new(AtomicUsize::new(0)),
            metrics: Arc::new(Metrics::default()),
            admission: Arc::new(Admission::new(max_concurrent)),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Run `work` once a concurrency permit is available, recording queue
    /// wait and latency metrics. Priority is attributed at submission time
    /// and never re-adjusted (§4.5: "no dynamic priority adjustment").
    pub async fn submit<F, Fut, T>(&self, priority: Priority, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = T>,
    {
        let submitted_at = Instant::now();
        self.metrics.queued.fetch_add(1, Ordering::SeqCst);

        self.admission.acquire(priority).await;

        self.metrics.queued.fetch_sub(1, Ordering::SeqCst);
        let queue_wait_ms = submitted_at.elapsed().as_millis() as u64;
        self.metrics
            .total_queue_wait_ms
            .fetch_add(queue_wait_ms, Ordering::SeqCst);

        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.peak_concurrency.fetch_max(current, Ordering::SeqCst);

        let started = Instant::now();
        let result = work().await;
        let latency_ms = started.elapsed().as_millis() as u64;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.metrics.total_completed.fetch_add(1, Ordering::SeqCst);
        self.metrics
            .total_latency_ms
            .fetch_add(latency_ms, Ordering::SeqCst);
        record_completion(&self.metrics);

        self.admission.release().await;
        result
    }

    pub fn metrics(&self) -> ManagerMetrics {
        let completed = self.metrics.total_completed.load(Ordering::SeqCst).max(1);
        ManagerMetrics {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            queued: self.metrics.queued.load(Ordering::SeqCst),
            peak_concurrency: self.metrics.peak_concurrency.load(Ordering::SeqCst),
            rolling_throughput: rolling_throughput(&self.metrics),
            avg_latency_ms: self.metrics.total_latency_ms.load(Ordering::SeqCst) as f64
                / completed as f64,
            avg_queue_wait_ms: self.metrics.total_queue_wait_ms.load(Ordering::SeqCst) as f64
                / completed as f64,
        }
    }
}

fn record_completion(metrics: &Metrics) {
    let now = Instant::now();
    let mut completions = metrics.completions.lock().expect("completions mutex poisoned");
    completions.push_back(now);
    prune(&mut completions, now);
}

fn rolling_throughput(metrics: &Metrics) -> f64 {
    let now = Instant::now();
    let mut completions = metrics.completions.lock().expect("completions mutex poisoned");
    prune(&mut completions, now);
    completions.len() as f64 / THROUGHPUT_WINDOW.as_secs_f64()
}

fn prune(completions: &mut VecDeque<Instant>, now: Instant) {
    while completions
        .front()
        .map(|t| now.duration_since(*t) > THROUGHPUT_WINDOW)
        .unwrap_or(false)
    {
        completions.pop_front();
    }
}
