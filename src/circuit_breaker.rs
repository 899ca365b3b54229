//! Per-backend circuit breaker state machine (§4.2).
//!
//! ```text
//! closed ──[fail counter ≥ N]──→ open
//! open   ──[now − opened_at ≥ cooldown]──→ half_open
//! half_open ──[next request succeeds]──→ closed
//! half_open ──[next request fails]────→ open (reset timer)
//! ```
//!
//! State is per-process, never persisted — `Instant` has no meaningful
//! cross-restart representation, and a cold-started process should always
//! begin `closed`.

use std::time::{Duration, Instant};

/// The three states a breaker can be in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// One breaker per backend. `fail_threshold`/`cooldown` are fixed at
/// construction from [`crate::config::CircuitBreakerConfig`].
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    failures_since_close: u32,
    opened_at: Option<Instant>,
    fail_threshold: u32,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(fail_threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            failures_since_close: 0,
            opened_at: None,
            fail_threshold,
            cooldown,
        }
    }

    /// The state a caller should observe *right now*, applying the
    /// `open → half_open` cooldown transition lazily on read.
    pub fn state(&mut self) -> BreakerState {
        if self.state == BreakerState::Open {
            if let Some(opened_at) = self.opened_at {
                if opened_at.elapsed() >= self.cooldown {
                    self.state = BreakerState::HalfOpen;
                }
            }
        }
        self.state
    }

    /// Whether a request may currently be attempted. `closed` and
    /// `half_open` admit requests; `open` does not.
    pub fn admits_request(&mut self) -> bool {
        self.state() != BreakerState::Open
    }

    /// Record a successful call. Always decrements the failure counter
    /// toward zero; in `half_open`, the first success closes the breaker.
    pub fn record_success(&mut self) {
        self.failures_since_close = self.failures_since_close.saturating_sub(1);
        match self.state() {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Closed;
                self.failures_since_close = 0;
                self.opened_at = None;
            }
            BreakerState::Closed | BreakerState::Open => {}
        }
    }

    /// Record a failed call. In `half_open`, any failure reopens the
    /// breaker and resets the cooldown timer. In `closed`, the failure
    /// counter increments and the breaker opens once it reaches
    /// `fail_threshold`.
    pub fn record_failure(&mut self) {
        match self.state() {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                self.failures_since_close += 1;
                if self.failures_since_close >= self.fail_threshold {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn failures_since_close(&self) -> u32 {
        self.failures_since_close
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_closed_below_threshold() {
        let mut b = CircuitBreaker::new(5, Duration::from_secs(30));
        for _ in 0..4 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.admits_request());
    }

    #[test]
    fn opens_after_exactly_fail_threshold_consecutive_failures() {
        let mut b = CircuitBreaker::new(5, Duration::from_secs(30));
        for i in 0..5 {
            assert_eq!(b.state(), BreakerState::Closed, "should still be closed at failure {i}");
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.admits_request());
    }

    #[test]
    fn success_decrements_failure_counter_without_opening() {
        let mut b = CircuitBreaker::new(5, Duration::from_secs(30));
        b.record_failure();
        b.record_failure();
        b.record_success();
        assert_eq!(b.failures_since_close(), 1);
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_success_closes_breaker() {
        let mut b = CircuitBreaker::new(1, Duration::from_millis(10));
        b.record_failure(); // opens
        assert_eq!(b.state(), BreakerState::Open);
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.failures_since_close(), 0);
    }

    #[test]
    fn half_open_failure_reopens_and_resets_cooldown() {
        let mut b = CircuitBreaker::new(1, Duration::from_millis(10));
        b.record_failure();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(b.state(), BreakerState::HalfOpen);
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
        // cooldown timer reset: should not immediately be half_open again
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn open_blocks_requests_without_reaching_the_adapter() {
        let mut b = CircuitBreaker::new(1, Duration::from_secs(30));
        b.record_failure();
        assert!(!b.admits_request());
    }
}
