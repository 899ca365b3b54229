use std::sync::Arc;

use anyhow::Context;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{error, info, warn};

mod backends;
mod circuit_breaker;
mod concurrency;
mod config;
mod dispatcher;
mod error;
mod handlers;
mod health;
mod learning;
mod patterns;
mod persist;
mod registry;
mod router;

pub use config::ServerConfig;
pub use dispatcher::AppState;
pub use error::AppError;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config_path = dispatcher::config_path();
    let config = ServerConfig::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        backends = config.backends.len(),
        data_dir = %config.data_dir,
        "mcp-orchestrator starting"
    );

    let state = Arc::new(AppState::load(config).await.context("failed to initialize state")?);

    let health_state = Arc::clone(&state);
    tokio::spawn(async move {
        health::HealthMonitor::new()
            .run_periodic(|| async {
                let results = health_state.registry.check_health().await;
                for (name, probe) in results {
                    if !probe.healthy {
                        warn!(backend = %name, detail = ?probe.detail, "periodic health probe unhealthy");
                    }
                }
            })
            .await;
    });

    let result = stdio_loop(Arc::clone(&state)).await;
    flush_state(&state).await;

    result
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| tracing_subscriber::EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| "info".into());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn flush_state(state: &AppState) {
    let snapshot = state.learning.lock().await.snapshot().clone();
    if let Err(e) = persist::save_atomic(&state.config.learning_state_path(), &snapshot).await {
        warn!(error = %e, "final learning state flush failed");
    }
    let patterns = state.patterns.lock().await.to_snapshot();
    if let Err(e) = persist::save_atomic(&state.config.patterns_path(), &patterns).await {
        warn!(error = %e, "final pattern store flush failed");
    }
}

/// Minimal line-delimited JSON-RPC 2.0 loop over stdin/stdout (§6). Each line
/// is one request `{jsonrpc, id, method, params}`; `tools/call` is the only
/// method that reaches the dispatcher, `tools/list` returns the static
/// catalog, anything else yields a JSON-RPC error object. A production
/// deployment may swap this for a dedicated MCP transport crate without
/// touching `dispatcher::dispatch`.
async fn stdio_loop(state: Arc<AppState>) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    let mut lines = BufReader::new(stdin).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(&line) {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "failed to parse JSON-RPC request line");
                continue;
            }
        };

        let id = request.get("id").cloned().unwrap_or(Value::Null);
        let method = request.get("method").and_then(Value::as_str).unwrap_or_default();

        let response = match method {
            "tools/list" => json!({ "jsonrpc": "2.0", "id": id, "result": { "tools": tool_catalog() } }),
            "tools/call" => {
                let name = request
                    .pointer("/params/name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let arguments = request.pointer("/params/arguments").cloned().unwrap_or(json!({}));
                let result = dispatcher::dispatch(&state, &name, arguments).await;
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "content": [{ "type": "text", "text": result.to_string() }] },
                })
            }
            other => json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("method not found: {other}") },
            }),
        };

        let line = format!("{}\n", response);
        stdout.write_all(line.as_bytes()).await?;
        stdout.flush().await?;
    }

    Ok(())
}

fn tool_catalog() -> Value {
    json!([
        { "name": "ask", "description": "Single-backend ask, direct or auto-routed" },
        { "name": "council", "description": "Query several backends in parallel and report agreement" },
        { "name": "dual_iterate", "description": "Generate/review/fix loop between two roles" },
        { "name": "parallel_agents", "description": "TDD workflow across decomposed subtasks" },
        { "name": "spawn_subagent", "description": "Single role-templated subagent call" },
        { "name": "check_backend_health", "description": "On-demand or all-backend health probe" },
    ])
}
