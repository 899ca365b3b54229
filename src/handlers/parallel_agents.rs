//! ParallelAgents: decompose → {RED → GREEN → REFACTOR → QUALITY}, iterating
//! until the quality gate passes or `max_iterations` is exhausted (§4.11).
//!
//! The hardest workflow in the surface: each TDD phase runs one
//! role-specialized subagent per subtask, batched to `max_parallel` so total
//! concurrency never exceeds that bound; a single subtask's failure is
//! recorded, not propagated — downstream phases simply see empty artifacts
//! for it.

use std::time::Duration;

use futures_util::future::join_all;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::AppError;
use crate::registry::BackendRegistry;

use super::subagent::SubagentHandler;
use super::{cancellable, extract_code_block, parse_verdict, spawn_deadline, SubagentRole};

/// Upper bound on total workflow wall-clock (§5): several sequential TDD
/// phases, each itself fanning out per subtask, need more headroom than a
/// single council round.
const PARALLEL_AGENTS_DEADLINE: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct Subtask {
    pub id: String,
    pub description: String,
    pub feedback: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PhaseOutput {
    pub subtask_id: String,
    pub success: bool,
    pub content: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct QualityGateResult {
    pub passed: bool,
    pub score: f64,
    pub issues: Vec<String>,
    pub feedback: Vec<String>,
}

pub struct ParallelAgentsResult {
    pub passed: bool,
    pub score: f64,
    pub iterations: u32,
    pub subtasks: Vec<Subtask>,
    pub red: Vec<PhaseOutput>,
    pub green: Vec<PhaseOutput>,
    pub refactor: Vec<PhaseOutput>,
    pub quality: QualityGateResult,
    pub files_written: Vec<String>,
}

pub struct ParallelAgentsOptions {
    pub max_parallel: usize,
    pub max_iterations: u32,
    pub iterate_until_quality: bool,
    pub work_directory: Option<String>,
    pub write_files: bool,
}

const QUICK_FAIL_SCORE: f64 = 0.3;
const GREEN_SUCCESS_QUORUM: f64 = 0.5;

pub struct ParallelAgentsHandler;

impl ParallelAgentsHandler {
    pub async fn run(
        registry: &BackendRegistry,
        task: &str,
        options: ParallelAgentsOptions,
    ) -> Result<ParallelAgentsResult, AppError> {
        let max_parallel = options.max_parallel.clamp(1, 6);
        let max_iterations = options.max_iterations.clamp(1, 5);

        let token = CancellationToken::new();
        spawn_deadline(token.clone(), PARALLEL_AGENTS_DEADLINE);

        let mut subtasks = Self::decompose(registry, &token, task).await?;

        let mut red;
        let mut green;
        let mut refactor;
        let mut quality;
        let mut iterations = 0;

        loop {
            iterations += 1;
            red = Self::run_phase(registry, &token, &subtasks, SubagentRole::TddTestWriter, max_parallel, |s| {
                format!("Subtask: {}\nWrite a failing test.{}", s.description, feedback_suffix(s))
            })
            .await;

            green = Self::run_phase(registry, &token, &subtasks, SubagentRole::TddImplementer, max_parallel, |s| {
                let test_code = red
                    .iter()
                    .find(|r| r.subtask_id == s.id)
                    .map(|r| r.content.as_str())
                    .unwrap_or("");
                format!(
                    "Subtask: {}\nFailing test:\n{test_code}\nWrite the implementation that makes it pass.{}",
                    s.description,
                    feedback_suffix(s)
                )
            })
            .await;

            refactor = Self::run_phase(registry, &token, &subtasks, SubagentRole::CodeReviewer, max_parallel, |s| {
                let impl_code = green
                    .iter()
                    .find(|r| r.subtask_id == s.id)
                    .map(|r| r.content.as_str())
                    .unwrap_or("");
                format!("Subtask: {}\nImplementation:\n{impl_code}\nRefactor for clarity without changing behavior.", s.description)
            })
            .await;

            if let Some(dir) = options.write_files.then_some(()).and(options.work_directory.as_deref()) {
                Self::persist_phase_outputs(dir, "red", &red).await;
                Self::persist_phase_outputs(dir, "green", &green).await;
                Self::persist_phase_outputs(dir, "refactor", &refactor).await;
            }

            quality = Self::quality_gate(registry, &token, &subtasks, &green, &refactor).await?;

            let should_stop = quality.passed || !options.iterate_until_quality || iterations >= max_iterations;
            if should_stop {
                break;
            }

            Self::annotate_feedback(&mut subtasks, &quality);
        }

        let files_written = if options.write_files {
            options
                .work_directory
                .iter()
                .flat_map(|dir| {
                    ["red", "green", "refactor"].iter().flat_map(move |phase| {
                        subtasks
                            .iter()
                            .map(move |s| format!("{dir}/{phase}/{}_{phase}.txt", s.id))
                    })
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(ParallelAgentsResult {
            passed: quality.passed,
            score: quality.score,
            iterations,
            subtasks,
            red,
            green,
            refactor,
            quality,
            files_written,
        })
    }

    /// Decomposes `task` into 2-5 atomic subtasks via the `tdd-decomposer`
    /// role, parsing a JSON array of descriptions; falls back to a simple
    /// two-way split when the subagent's output isn't parseable (§4.11).
    async fn decompose(registry: &BackendRegistry, token: &CancellationToken, task: &str) -> Result<Vec<Subtask>, AppError> {
        let prompt = format!(
            "Task:\n{task}\n\nDecompose into 2-5 atomic, independently testable subtasks. \
             Respond with a JSON array of short descriptions only, e.g. [\"...\", \"...\"]."
        );
        let result = cancellable(
            token,
            SubagentHandler::invoke(registry, SubagentRole::TddDecomposer, &[], &prompt),
        )
        .await?;

        let descriptions = serde_json::from_str::<Vec<String>>(result.text_content.trim())
            .ok()
            .filter(|v| v.len() >= 2)
            .unwrap_or_else(|| fallback_split(task));

        Ok(descriptions
            .into_iter()
            .take(5)
            .map(|description| Subtask {
                id: Uuid::new_v4().to_string(),
                description,
                feedback: None,
            })
            .collect())
    }

    /// Runs one phase: partitions `subtasks` into batches of `max_parallel`,
    /// each batch dispatched in parallel, batches executed sequentially
    /// (§4.11). A subagent failure is captured, not propagated.
    async fn run_phase<F>(
        registry: &BackendRegistry,
        token: &CancellationToken,
        subtasks: &[Subtask],
        role: SubagentRole,
        max_parallel: usize,
        prompt_for: F,
    ) -> Vec<PhaseOutput>
    where
        F: Fn(&Subtask) -> String,
    {
        let mut outputs = Vec::with_capacity(subtasks.len());
        for batch in subtasks.chunks(max_parallel) {
            let calls = batch.iter().map(|subtask| {
                let prompt = prompt_for(subtask);
                async move {
                    let result = cancellable(token, SubagentHandler::invoke(registry, role, &[], &prompt)).await;
                    match result {
                        Ok(r) => PhaseOutput {
                            subtask_id: subtask.id.clone(),
                            success: true,
                            content: extract_code_block(&r.text_content),
                            error: None,
                        },
                        Err(e) => PhaseOutput {
                            subtask_id: subtask.id.clone(),
                            success: false,
                            content: String::new(),
                            error: Some(e.redacted_message()),
                        },
                    }
                }
            });
            outputs.extend(join_all(calls).await);
        }
        outputs
    }

    async fn persist_phase_outputs(work_directory: &str, phase: &str, outputs: &[PhaseOutput]) {
        let dir = format!("{work_directory}/{phase}");
        if tokio::fs::create_dir_all(&dir).await.is_err() {
            return;
        }
        for output in outputs.iter().filter(|o| o.success) {
            let path = format!("{dir}/{}_{phase}.txt", output.subtask_id);
            let _ = tokio::fs::write(path, &output.content).await;
        }
    }

    /// QUALITY gate (§4.11): quick-fails below a 50% GREEN success quorum,
    /// otherwise defers to the `tdd-quality-reviewer` subagent on truncated
    /// samples.
    async fn quality_gate(
        registry: &BackendRegistry,
        token: &CancellationToken,
        subtasks: &[Subtask],
        green: &[PhaseOutput],
        refactor: &[PhaseOutput],
    ) -> Result<QualityGateResult, AppError> {
        let total = subtasks.len().max(1);
        let green_successes = green.iter().filter(|o| o.success).count();
        if (green_successes as f64 / total as f64) < GREEN_SUCCESS_QUORUM {
            return Ok(QualityGateResult {
                passed: false,
                score: QUICK_FAIL_SCORE,
                issues: vec!["fewer than half of subtasks produced a passing implementation".to_string()],
                feedback: vec!["retry-simpler-scope".to_string()],
            });
        }

        let samples: String = subtasks
            .iter()
            .map(|s| {
                let test = "n/a";
                let implementation = refactor
                    .iter()
                    .find(|o| o.subtask_id == s.id && o.success)
                    .or_else(|| green.iter().find(|o| o.subtask_id == s.id))
                    .map(|o| truncate(&o.content, 500))
                    .unwrap_or_default();
                format!("Subtask: {}\nTest: {}\nImplementation: {}\n", s.description, test, implementation)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!("Review these TDD cycles and judge overall quality:\n{samples}\n\nRespond with strict JSON: {{\"score\": 0-1, \"issues\": [...], \"suggestions\": [...]}}");
        let result = cancellable(
            token,
            SubagentHandler::invoke(registry, SubagentRole::TddQualityReviewer, &[], &prompt),
        )
        .await?;
        let verdict = parse_verdict(&result.text_content);

        Ok(QualityGateResult {
            passed: verdict.score >= 0.7,
            score: verdict.score,
            issues: verdict.issues,
            feedback: verdict.suggestions,
        })
    }

    fn annotate_feedback(subtasks: &mut [Subtask], quality: &QualityGateResult) {
        for (index, subtask) in subtasks.iter_mut().enumerate() {
            subtask.feedback = quality
                .issues
                .get(index)
                .or_else(|| quality.issues.first())
                .cloned();
        }
    }
}

fn feedback_suffix(subtask: &Subtask) -> String {
    subtask
        .feedback
        .as_ref()
        .map(|f| format!("\nPrevious feedback: {f}"))
        .unwrap_or_default()
}

fn truncate(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn fallback_split(task: &str) -> Vec<String> {
    let midpoint = task.len() / 2;
    let boundary = task[..midpoint].rfind(' ').unwrap_or(midpoint).max(1);
    vec![task[..boundary].trim().to_string(), task[boundary..].trim().to_string()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        BackendDescriptor, BackendKind, CircuitBreakerConfig, CouncilConfig, DualIterateConfig,
        LearningConfig, PatternStoreConfig, ServerConfig,
    };

    fn descriptor(name: &str, url: &str) -> BackendDescriptor {
        BackendDescriptor {
            name: name.into(),
            kind: BackendKind::OpenaiCompatible,
            endpoint_url: url.into(),
            model_id: "m".into(),
            api_key_env: None,
            priority: 0,
            max_tokens_cap: 4096,
            default_timeout_ms: 2000,
        }
    }

    fn registry(backends: Vec<BackendDescriptor>) -> BackendRegistry {
        let config = ServerConfig {
            backends,
            council: CouncilConfig::default(),
            dual_iterate: DualIterateConfig {
                default_coder: "a".into(),
                default_reviewer: "a".into(),
            },
            learning: LearningConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            patterns: PatternStoreConfig::default(),
            data_dir: "data".into(),
            log_level: None,

            max_concurrent: 250,
        };
        BackendRegistry::new(&config).unwrap()
    }

    #[test]
    fn fallback_split_produces_two_nonempty_subtasks() {
        let parts = fallback_split("write a function that parses csv rows into structs");
        assert_eq!(parts.len(), 2);
        assert!(!parts[0].is_empty());
        assert!(!parts[1].is_empty());
    }

    #[tokio::test]
    async fn quality_gate_quick_fails_below_green_success_quorum() {
        let server = wiremock::MockServer::start().await;
        let registry = registry(vec![descriptor("a", &server.uri())]);
        let subtasks = vec![
            Subtask { id: "1".into(), description: "a".into(), feedback: None },
            Subtask { id: "2".into(), description: "b".into(), feedback: None },
        ];
        let green = vec![
            PhaseOutput { subtask_id: "1".into(), success: false, content: String::new(), error: Some("boom".into()) },
            PhaseOutput { subtask_id: "2".into(), success: false, content: String::new(), error: Some("boom".into()) },
        ];
        let refactor = vec![];
        let token = CancellationToken::new();
        let result = ParallelAgentsHandler::quality_gate(&registry, &token, &subtasks, &green, &refactor)
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(result.score <= QUICK_FAIL_SCORE);
    }

    #[test]
    fn annotate_feedback_assigns_per_index_or_first_issue() {
        let mut subtasks = vec![
            Subtask { id: "1".into(), description: "a".into(), feedback: None },
            Subtask { id: "2".into(), description: "b".into(), feedback: None },
        ];
        let quality = QualityGateResult {
            passed: false,
            score: 0.4,
            issues: vec!["issue for first".to_string()],
            feedback: vec![],
        };
        ParallelAgentsHandler::annotate_feedback(&mut subtasks, &quality);
        assert_eq!(subtasks[0].feedback.as_deref(), Some("issue for first"));
        assert_eq!(subtasks[1].feedback.as_deref(), Some("issue for first"));
    }
}
