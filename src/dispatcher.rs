//! Tool dispatch: translates a `{name, arguments}` MCP tool call into a call
//! against the appropriate handler and serializes its result into the
//! response envelope every tool returns (§6).

use std::path::PathBuf;
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::backends::ProbeResult;
use crate::config::ServerConfig;
use crate::error::AppError;
use crate::handlers::ask::AskHandler;
use crate::handlers::council::{ConfidenceNeeded, CouncilHandler, Topic};
use crate::handlers::dual_iterate::DualIterateHandler;
use crate::handlers::parallel_agents::{ParallelAgentsHandler, ParallelAgentsOptions};
use crate::handlers::subagent::SubagentHandler;
use crate::handlers::SubagentRole;
use crate::learning::{LearningEngine, LearningState};
use crate::patterns::{PatternSnapshot, PatternStore};
use crate::persist;
use crate::registry::BackendRegistry;

/// Process-wide state shared across every tool call.
pub struct AppState {
    pub config: ServerConfig,
    pub registry: BackendRegistry,
    pub learning: Mutex<LearningEngine>,
    pub patterns: Mutex<PatternStore>,
}

impl AppState {
    pub async fn load(config: ServerConfig) -> anyhow::Result<Self> {
        let registry = BackendRegistry::new(&config)?;

        let learning_state: LearningState = persist::load_or_default(&config.learning_state_path()).await?;
        let learning = Mutex::new(LearningEngine::from_state(learning_state, config.learning.clone()));

        let pattern_snapshot: PatternSnapshot = persist::load_or_default(&config.patterns_path()).await?;
        let patterns = Mutex::new(PatternStore::from_snapshot(pattern_snapshot, config.patterns.clone()));

        info!(backends = config.backends.len(), data_dir = %config.data_dir, "state loaded");

        Ok(Self {
            config,
            registry,
            learning,
            patterns,
        })
    }

    async fn persist_learning_if_due(&self, due: bool) {
        if !due {
            return;
        }
        let snapshot = self.learning.lock().await.snapshot().clone();
        if let Err(e) = persist::save_atomic(&self.config.learning_state_path(), &snapshot).await {
            tracing::warn!(error = %e, "learning state persistence failed — continuing");
        }
    }

    async fn persist_patterns(&self) {
        let snapshot = self.patterns.lock().await.to_snapshot();
        if let Err(e) = persist::save_atomic(&self.config.patterns_path(), &snapshot).await {
            tracing::warn!(error = %e, "pattern store persistence failed — continuing");
        }
    }
}

/// Dispatches one tool call and returns the JSON response envelope. Never
/// returns an `Err` at this layer — handler failures are folded into
/// `{success: false, error, detail}` per §7's propagation policy.
pub async fn dispatch(state: &AppState, tool: &str, arguments: Value) -> Value {
    let request_id = Uuid::new_v4().to_string();
    let span = info_span!("tool_call", tool = %tool, request_id = %request_id);
    let started = Instant::now();

    let body = async {
        match tool {
            "ask" => ask(state, arguments).await,
            "council" => council(state, arguments).await,
            "dual_iterate" => dual_iterate(state, arguments).await,
            "parallel_agents" => parallel_agents(state, arguments).await,
            "spawn_subagent" => spawn_subagent(state, arguments).await,
            "check_backend_health" => check_backend_health(state, arguments).await,
            other => Err(AppError::Validation(format!("unknown tool `{other}`"))),
        }
    }
    .instrument(span)
    .await;

    let duration_ms = started.elapsed().as_millis() as u64;
    match body {
        Ok(mut value) => {
            if let Some(obj) = value.as_object_mut() {
                obj.insert("success".to_string(), json!(true));
                obj.insert("metadata".to_string(), json!({ "tool": tool, "duration_ms": duration_ms }));
            }
            value
        }
        Err(e) => json!({
            "success": false,
            "error": e.to_string(),
            "detail": e.redacted_message(),
            "metadata": { "tool": tool, "duration_ms": duration_ms },
        }),
    }
}

fn arg_str(args: &Value, key: &str) -> Option<String> {
    args.get(key).and_then(Value::as_str).map(str::to_string)
}

fn arg_u32(args: &Value, key: &str, default: u32) -> u32 {
    args.get(key).and_then(Value::as_u64).map(|v| v as u32).unwrap_or(default)
}

fn arg_bool(args: &Value, key: &str, default: bool) -> bool {
    args.get(key).and_then(Value::as_bool).unwrap_or(default)
}

async fn ask(state: &AppState, args: Value) -> Result<Value, AppError> {
    let prompt = arg_str(&args, "prompt").ok_or_else(|| AppError::Validation("`prompt` is required".to_string()))?;
    let max_tokens = arg_u32(&args, "max_tokens", 0);
    let force_backend = match arg_str(&args, "model").or_else(|| arg_str(&args, "force_backend")) {
        Some(model) if model != "auto" => Some(model),
        _ => None,
    };
    let enable_chunking = arg_bool(&args, "enable_chunking", false);
    let thinking = arg_bool(&args, "thinking", false);

    let learning = state.learning.lock().await;
    let outcome = AskHandler::ask(
        &state.registry,
        &learning,
        prompt,
        max_tokens,
        0.7,
        thinking,
        force_backend,
        enable_chunking,
    )
    .await?;
    drop(learning);

    debug!(backend = %outcome.response.backend_used, source = ?outcome.routing_outcome.source, "ask routed");
    let due = state.learning.lock().await.record_outcome(outcome.routing_outcome);
    state.persist_learning_if_due(due).await;

    Ok(json!({
        "content": outcome.response.content,
        "backend_used": outcome.response.backend_used,
        "fallback_chain": outcome.response.fallback_chain,
        "latency_ms": outcome.response.latency_ms,
        "routing": {
            "backend": outcome.response.routing.backend,
            "source": format!("{:?}", outcome.response.routing.source),
            "confidence": outcome.response.routing.confidence,
            "reasoning_tag": outcome.response.routing.reasoning_tag,
        },
    }))
}

fn parse_topic(value: &str) -> Result<Topic, AppError> {
    Ok(match value {
        "coding" => Topic::Coding,
        "reasoning" => Topic::Reasoning,
        "architecture" => Topic::Architecture,
        "security" => Topic::Security,
        "performance" => Topic::Performance,
        "general" => Topic::General,
        "creative" => Topic::Creative,
        other => return Err(AppError::Validation(format!("unknown council topic `{other}`"))),
    })
}

fn parse_confidence(value: Option<&str>) -> ConfidenceNeeded {
    match value {
        Some("high") => ConfidenceNeeded::High,
        Some("low") => ConfidenceNeeded::Low,
        _ => ConfidenceNeeded::Medium,
    }
}

async fn council(state: &AppState, args: Value) -> Result<Value, AppError> {
    let prompt = arg_str(&args, "prompt").ok_or_else(|| AppError::Validation("`prompt` is required".to_string()))?;
    let topic = parse_topic(&arg_str(&args, "topic").unwrap_or_else(|| "general".to_string()))?;
    let confidence = parse_confidence(arg_str(&args, "confidence_needed").as_deref());
    let num_backends = args.get("num_backends").and_then(Value::as_u64).map(|v| v as usize);
    let max_tokens = arg_u32(&args, "max_tokens", 0);

    let result = CouncilHandler::run(&state.registry, &state.config, &prompt, topic, confidence, num_backends, max_tokens).await?;

    Ok(json!({
        "responses": result.responses.iter().map(|r| json!({ "backend": r.backend, "content": r.content })).collect::<Vec<_>>(),
        "failed": result.failed.iter().map(|f| json!({ "backend": f.backend, "error": f.error })).collect::<Vec<_>>(),
        "synthesis": {
            "backends_queried": result.synthesis.backends_queried,
            "backends_succeeded": result.synthesis.backends_succeeded,
            "duration_ms": result.synthesis.duration_ms,
            "agreement_level": format!("{:?}", result.synthesis.agreement_level),
            "recommendation": format!("{:?}", result.synthesis.recommendation),
        },
    }))
}

async fn dual_iterate(state: &AppState, args: Value) -> Result<Value, AppError> {
    let task = arg_str(&args, "task").ok_or_else(|| AppError::Validation("`task` is required".to_string()))?;
    let max_iterations = arg_u32(&args, "max_iterations", 3);
    let quality_threshold = args.get("quality_threshold").and_then(Value::as_f64);
    let include_history = arg_bool(&args, "include_history", false);

    let result = DualIterateHandler::run(
        &state.registry,
        &state.config.dual_iterate.default_coder,
        &state.config.dual_iterate.default_reviewer,
        &task,
        max_iterations,
        quality_threshold,
        include_history,
    )
    .await?;

    Ok(json!({
        "approved": result.approved,
        "code": result.code,
        "final_score": result.final_score,
        "iterations": result.iterations,
        "final_review": {
            "score": result.final_review.score,
            "issues": result.final_review.issues,
            "suggestions": result.final_review.suggestions,
            "summary": result.final_review.summary,
        },
        "history": result.history.map(|h| h.into_iter().map(|r| json!({
            "iter": r.iter,
            "generated_code": r.generated_code,
            "review": { "score": r.review.score, "issues": r.review.issues, "suggestions": r.review.suggestions },
        })).collect::<Vec<_>>()),
    }))
}

async fn parallel_agents(state: &AppState, args: Value) -> Result<Value, AppError> {
    let task = arg_str(&args, "task").ok_or_else(|| AppError::Validation("`task` is required".to_string()))?;
    let options = ParallelAgentsOptions {
        max_parallel: args.get("max_parallel").and_then(Value::as_u64).unwrap_or(2) as usize,
        max_iterations: arg_u32(&args, "max_iterations", 3),
        iterate_until_quality: arg_bool(&args, "iterate_until_quality", false),
        work_directory: arg_str(&args, "work_directory"),
        write_files: arg_bool(&args, "write_files", false),
    };

    let result = ParallelAgentsHandler::run(&state.registry, &task, options).await?;

    Ok(json!({
        "passed": result.passed,
        "score": result.score,
        "iterations": result.iterations,
        "subtasks": result.subtasks.iter().map(|s| json!({ "id": s.id, "description": s.description, "feedback": s.feedback })).collect::<Vec<_>>(),
        "quality": {
            "passed": result.quality.passed,
            "score": result.quality.score,
            "issues": result.quality.issues,
            "feedback": result.quality.feedback,
        },
        "files_written": result.files_written,
    }))
}

fn parse_role(value: &str) -> Result<SubagentRole, AppError> {
    Ok(match value {
        "code-reviewer" => SubagentRole::CodeReviewer,
        "security-auditor" => SubagentRole::SecurityAuditor,
        "planner" => SubagentRole::Planner,
        "refactor-specialist" => SubagentRole::RefactorSpecialist,
        "test-generator" => SubagentRole::TestGenerator,
        "documentation-writer" => SubagentRole::DocumentationWriter,
        "tdd-decomposer" => SubagentRole::TddDecomposer,
        "tdd-test-writer" => SubagentRole::TddTestWriter,
        "tdd-implementer" => SubagentRole::TddImplementer,
        "tdd-quality-reviewer" => SubagentRole::TddQualityReviewer,
        other => return Err(AppError::Validation(format!("unknown subagent role `{other}`"))),
    })
}

async fn spawn_subagent(state: &AppState, args: Value) -> Result<Value, AppError> {
    let role = parse_role(&arg_str(&args, "role").ok_or_else(|| AppError::Validation("`role` is required".to_string()))?)?;
    let task = arg_str(&args, "task").ok_or_else(|| AppError::Validation("`task` is required".to_string()))?;
    let context = arg_str(&args, "context").unwrap_or_default();
    let prompt = if context.is_empty() { task } else { format!("{task}\n\nContext:\n{context}") };

    let result = SubagentHandler::invoke(&state.registry, role, &[], &prompt).await?;

    Ok(json!({
        "role": result.role.as_str(),
        "verdict": result.verdict,
        "text_content": result.text_content,
        "backend_used": result.backend_used,
    }))
}

async fn check_backend_health(state: &AppState, args: Value) -> Result<Value, AppError> {
    let force = arg_bool(&args, "force", false);
    if let Some(backend) = arg_str(&args, "backend") {
        let probe = state.registry.check_backend_health(&backend, force).await?;
        return Ok(json!({ "backend": backend, "healthy": probe.healthy, "latency_ms": probe.latency_ms, "detail": probe.detail }));
    }

    let results: Vec<(String, ProbeResult)> = state.registry.check_health().await;
    Ok(json!({
        "backends": results.into_iter().map(|(name, probe)| json!({
            "backend": name, "healthy": probe.healthy, "latency_ms": probe.latency_ms, "detail": probe.detail,
        })).collect::<Vec<_>>(),
    }))
}

/// Resolves `MCP_CONFIG`/`LMO_CONFIG`, defaulting to `backends.json` in the
/// current directory.
pub fn config_path() -> PathBuf {
    std::env::var("MCP_CONFIG")
        .or_else(|_| std::env::var("LMO_CONFIG"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("backends.json"))
}
