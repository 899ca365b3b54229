//! CompoundLearning: EMA-based per-backend confidence plus per-pattern
//! (complexity, task_type) success-rate recommendations (§4.7).
//!
//! State is process-wide and persisted to `data/learning/learning-state.json`
//! via temp-file-plus-rename (`crate::persist`), loaded once at startup and
//! saved after every `save_every_n`th recorded outcome.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::LearningConfig;
use crate::router::{Complexity, RoutingOutcome, TaskType};

const HISTORY_EVICT_BATCH: usize = 500;
const TREND_WINDOW: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Trend {
    Improving,
    Stable,
    Degrading,
}

/// Per-backend rolling statistics (§3 `BackendMetrics`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendMetrics {
    pub confidence: f64,
    pub total_calls: u64,
    pub successful_calls: u64,
    pub trend: Trend,
}

impl Default for BackendMetrics {
    fn default() -> Self {
        Self {
            confidence: 0.5,
            total_calls: 0,
            successful_calls: 0,
            trend: Trend::Stable,
        }
    }
}

/// Per-backend tally inside one `PatternKey` bucket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternBackendStats {
    pub calls: u64,
    pub success_sum: u64,
}

/// `PatternKey → {per_backend, total_samples}` (§3 `PatternKey`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternStats {
    pub per_backend: HashMap<String, PatternBackendStats>,
    pub total_samples: u64,
}

fn pattern_key(complexity: Complexity, task_type: TaskType) -> String {
    format!("{}:{}", complexity, task_type)
}

/// A non-null `getRecommendation` result.
#[derive(Debug, Clone)]
pub struct Recommendation {
    pub backend: String,
    pub confidence: f64,
    pub reason: String,
}

/// The durable snapshot written to `learning-state.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LearningState {
    metrics: HashMap<String, BackendMetrics>,
    patterns: HashMap<String, PatternStats>,
    history: VecDeque<RoutingOutcome>,
}

pub struct LearningEngine {
    state: LearningState,
    config: LearningConfig,
    outcomes_since_save: u32,
}

impl LearningEngine {
    pub fn new(config: LearningConfig) -> Self {
        Self {
            state: LearningState::default(),
            config,
            outcomes_since_save: 0,
        }
    }

    pub fn from_state(state: LearningState, config: LearningConfig) -> Self {
        Self {
            state,
            config,
            outcomes_since_save: 0,
        }
    }

    pub fn snapshot(&self) -> &LearningState {
        &self.state
    }

    /// `recordOutcome(o) → void` (§4.7). Returns `true` when the caller
    /// should persist the snapshot (every `save_every_n`th outcome).
    pub fn record_outcome(&mut self, outcome: RoutingOutcome) -> bool {
        let metrics = self
            .state
            .metrics
            .entry(outcome.backend.clone())
            .or_default();
        let observed = if outcome.success { 1.0 } else { 0.0 };
        metrics.confidence = self.config.alpha * observed + (1.0 - self.config.alpha) * metrics.confidence;
        metrics.total_calls += 1;
        if outcome.success {
            metrics.successful_calls += 1;
        }

        let key = pattern_key(outcome.complexity, outcome.task_type);
        let pattern = self.state.patterns.entry(key).or_default();
        let backend_stats = pattern.per_backend.entry(outcome.backend.clone()).or_default();
        backend_stats.calls += 1;
        if outcome.success {
            backend_stats.success_sum += 1;
        }
        pattern.total_samples += 1;

        self.state.history.push_back(outcome);
        if self.state.history.len() > self.config.history_cap {
            let drain = HISTORY_EVICT_BATCH.min(self.state.history.len());
            self.state.history.drain(0..drain);
        }

        self.recompute_trend();

        self.outcomes_since_save += 1;
        if self.outcomes_since_save >= self.config.save_every_n {
            self.outcomes_since_save = 0;
            true
        } else {
            false
        }
    }

    fn recompute_trend(&mut self) {
        let backends: Vec<String> = self.state.metrics.keys().cloned().collect();
        for backend in backends {
            let relevant: Vec<&RoutingOutcome> = self
                .state
                .history
                .iter()
                .filter(|o| o.backend == backend)
                .collect();
            if relevant.len() < 4 {
                continue;
            }
            let window = TREND_WINDOW.min(relevant.len() / 2).max(1);
            let recent = &relevant[relevant.len() - window..];
            let older_end = relevant.len() - window;
            let older_start = older_end.saturating_sub(window);
            let older = &relevant[older_start..older_end];
            if older.is_empty() {
                continue;
            }
            let recent_rate = success_rate(recent);
            let older_rate = success_rate(older);
            let trend = if recent_rate > older_rate + 0.05 {
                Trend::Improving
            } else if recent_rate < older_rate - 0.05 {
                Trend::Degrading
            } else {
                Trend::Stable
            };
            if let Some(metrics) = self.state.metrics.get_mut(&backend) {
                metrics.trend = trend;
            }
        }
    }

    /// `getRecommendation(context) → {backend, confidence, reason} | null` (§4.7).
    pub fn recommendation(&self, complexity: Complexity, task_type: TaskType) -> Option<Recommendation> {
        let key = pattern_key(complexity, task_type);
        let pattern = self.state.patterns.get(&key)?;
        if pattern.total_samples < self.config.min_samples as u64 {
            return None;
        }

        let mut best: Option<(String, f64)> = None;
        for (backend, stats) in &pattern.per_backend {
            if stats.calls < 3 {
                continue;
            }
            let success_rate = stats.success_sum as f64 / stats.calls as f64;
            let confidence = self
                .state
                .metrics
                .get(backend)
                .map(|m| m.confidence)
                .unwrap_or(0.5);
            let score = (0.7 * success_rate + 0.3 * confidence).clamp(0.0, 1.0);
            if best.as_ref().map(|(_, s)| score > *s).unwrap_or(true) {
                best = Some((backend.clone(), score));
            }
        }

        let (backend, score) = best?;
        if score < self.config.confidence_threshold {
            return None;
        }
        Some(Recommendation {
            backend,
            confidence: score,
            reason: format!("pattern `{key}` favors this backend with score {score:.2}"),
        })
    }

    pub fn metrics_for(&self, backend: &str) -> Option<&BackendMetrics> {
        self.state.metrics.get(backend)
    }
}

fn success_rate(outcomes: &[&RoutingOutcome]) -> f64 {
    if outcomes.is_empty() {
        return 0.0;
    }
    let successes = outcomes.iter().filter(|o| o.success).count();
    successes as f64 / outcomes.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(backend: &str, success: bool) -> RoutingOutcome {
        RoutingOutcome {
            backend: backend.to_string(),
            complexity: Complexity::Simple,
            task_type: TaskType::Code,
            success,
            latency_ms: 100,
            source: crate::router::DecisionSource::Fallback,
        }
    }

    fn config() -> LearningConfig {
        LearningConfig {
            alpha: 0.2,
            min_samples: 5,
            confidence_threshold: 0.6,
            history_cap: 1000,
            save_every_n: 10,
        }
    }

    #[test]
    fn ema_moves_confidence_toward_observed_value() {
        let mut engine = LearningEngine::new(config());
        for _ in 0..20 {
            engine.record_outcome(outcome("a", true));
        }
        let confidence = engine.metrics_for("a").unwrap().confidence;
        assert!(confidence > 0.9, "confidence should converge near 1.0, got {confidence}");
    }

    #[test]
    fn no_recommendation_below_min_samples() {
        let mut engine = LearningEngine::new(config());
        for _ in 0..4 {
            engine.record_outcome(outcome("a", true));
        }
        assert!(engine.recommendation(Complexity::Simple, TaskType::Code).is_none());
    }

    #[test]
    fn recommends_high_scoring_backend_once_threshold_met() {
        let mut engine = LearningEngine::new(config());
        for _ in 0..10 {
            engine.record_outcome(outcome("a", true));
        }
        let rec = engine.recommendation(Complexity::Simple, TaskType::Code);
        assert!(rec.is_some());
        let rec = rec.unwrap();
        assert_eq!(rec.backend, "a");
        assert!(rec.confidence >= 0.6);
    }

    #[test]
    fn no_recommendation_when_score_below_threshold() {
        let mut engine = LearningEngine::new(config());
        for i in 0..10 {
            engine.record_outcome(outcome("a", i % 2 == 0));
        }
        assert!(engine.recommendation(Complexity::Simple, TaskType::Code).is_none());
    }

    #[test]
    fn history_is_capped_and_evicted_in_batches() {
        let mut engine = LearningEngine::new(config());
        for _ in 0..1100 {
            engine.record_outcome(outcome("a", true));
        }
        let len = engine.state.history.len();
        assert!(len <= 1000 && len >= 500, "expected history between 500 and 1000, got {len}");
    }
}
