//! Multi-AI handlers: the tool surface exposed by the dispatcher (§4.8–4.12).
//!
//! Each handler is a thin stateless struct — all mutable state (registry,
//! learning, patterns) is threaded in by reference from `dispatcher.rs`.

pub mod ask;
pub mod council;
pub mod dual_iterate;
pub mod parallel_agents;
pub mod subagent;

use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Races `fut` against `token`'s cancellation (§5). A workflow deadline
/// firing mid-call surfaces as `AppError::Cancelled` rather than waiting for
/// the child request to finish on its own.
pub async fn cancellable<F, T>(token: &CancellationToken, fut: F) -> Result<T, AppError>
where
    F: std::future::Future<Output = Result<T, AppError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(AppError::Cancelled),
        result = fut => result,
    }
}

/// Spawns a detached task that cancels `token` once `deadline` elapses,
/// unless something else cancels it first (§5 workflow deadlines).
pub fn spawn_deadline(token: CancellationToken, deadline: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(deadline) => token.cancel(),
            _ = token.cancelled() => {}
        }
    });
}

/// Extracts the first fenced code block (```lang\n...\n```), falling back to
/// the trimmed full text when no fence is present (§4.10 step 2, §4.11).
pub fn extract_code_block(text: &str) -> String {
    if let Some(start) = text.find("```") {
        let after_open = &text[start + 3..];
        // skip an optional language tag up to the first newline
        let body_start = after_open.find('\n').map(|i| i + 1).unwrap_or(0);
        let body = &after_open[body_start..];
        if let Some(end) = body.find("```") {
            return body[..end].trim().to_string();
        }
    }
    text.trim().to_string()
}

/// Extracts the first `{...}` balanced JSON substring and parses it. Used by
/// both DualIterate and ParallelAgents quality gates (§4.10 step 4, §4.11).
pub fn extract_json_object(text: &str) -> Option<Value> {
    let bytes = text.as_bytes();
    let start = bytes.iter().position(|&b| b == b'{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    let end = start + offset + 1;
                    return serde_json::from_str(&text[start..end]).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// A parsed review verdict, shared by DualIterate and the ParallelAgents
/// quality gate (§4.10 step 4).
#[derive(Debug, Clone)]
pub struct Verdict {
    pub score: f64,
    pub issues: Vec<String>,
    pub suggestions: Vec<String>,
    pub summary: String,
}

const POSITIVE_KEYWORDS: &[&str] = &["good", "solid", "correct", "well-structured", "passes", "looks great"];
const NEGATIVE_KEYWORDS: &[&str] = &["broken", "incorrect", "fails", "bug", "missing", "wrong"];

/// Parses a reviewer's JSON verdict, falling back to keyword-based heuristic
/// scoring on parse failure (§4.10 step 4).
pub fn parse_verdict(text: &str) -> Verdict {
    if let Some(json) = extract_json_object(text) {
        let score = json.get("score").and_then(Value::as_f64).unwrap_or(0.6).clamp(0.0, 1.0);
        let issues = string_array(&json, "issues");
        let suggestions = string_array(&json, "suggestions");
        let summary = json
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        return Verdict {
            score,
            issues,
            suggestions,
            summary,
        };
    }

    let lower = text.to_lowercase();
    let positive = POSITIVE_KEYWORDS.iter().any(|k| lower.contains(k));
    let negative = NEGATIVE_KEYWORDS.iter().any(|k| lower.contains(k));
    let score = match (positive, negative) {
        (true, false) => 0.8,
        (false, true) => 0.4,
        _ => 0.6,
    };
    Verdict {
        score,
        issues: vec!["Could not parse structured review".to_string()],
        suggestions: Vec::new(),
        summary: text.trim().to_string(),
    }
}

fn string_array(json: &Value, key: &str) -> Vec<String> {
    json.get(key)
        .and_then(Value::as_array)
        .map(|items| items.iter().filter_map(Value::as_str).map(str::to_string).collect())
        .unwrap_or_default()
}

/// Heuristic truncation detector (§4.8): output close to the requested cap
/// and not ending on a natural boundary.
pub fn looks_truncated(content: &str, tokens_used: u32, max_tokens: u32) -> bool {
    if max_tokens == 0 {
        return false;
    }
    let near_cap = tokens_used as f64 >= 0.9 * max_tokens as f64;
    let trimmed = content.trim_end();
    let ends_cleanly = trimmed.ends_with(['.', '!', '?', '"']) || trimmed.ends_with("```");
    near_cap && !ends_cleanly
}

/// Fixed role templates for [`subagent::SubagentHandler`] (§4.12).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubagentRole {
    CodeReviewer,
    SecurityAuditor,
    Planner,
    RefactorSpecialist,
    TestGenerator,
    DocumentationWriter,
    TddDecomposer,
    TddTestWriter,
    TddImplementer,
    TddQualityReviewer,
}

impl SubagentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CodeReviewer => "code-reviewer",
            Self::SecurityAuditor => "security-auditor",
            Self::Planner => "planner",
            Self::RefactorSpecialist => "refactor-specialist",
            Self::TestGenerator => "test-generator",
            Self::DocumentationWriter => "documentation-writer",
            Self::TddDecomposer => "tdd-decomposer",
            Self::TddTestWriter => "tdd-test-writer",
            Self::TddImplementer => "tdd-implementer",
            Self::TddQualityReviewer => "tdd-quality-reviewer",
        }
    }

    pub fn system_prompt(&self) -> &'static str {
        match self {
            Self::CodeReviewer => "You are a meticulous code reviewer. Identify correctness and style issues.",
            Self::SecurityAuditor => "You are a security auditor. Identify vulnerabilities and unsafe patterns.",
            Self::Planner => "You are a technical planner. Break work into an ordered, actionable plan.",
            Self::RefactorSpecialist => "You are a refactoring specialist. Improve structure without changing behavior.",
            Self::TestGenerator => "You write thorough, focused unit tests.",
            Self::DocumentationWriter => "You write clear, concise developer documentation.",
            Self::TddDecomposer => "You decompose a task into 2-5 atomic, independently testable subtasks.",
            Self::TddTestWriter => "You write a failing test for the given subtask (TDD red phase).",
            Self::TddImplementer => "You write the minimal implementation that makes the given test pass (TDD green phase).",
            Self::TddQualityReviewer => "You judge whether a TDD cycle's tests and implementation meet quality bar.",
        }
    }

    pub fn max_tokens(&self) -> u32 {
        match self {
            Self::Planner | Self::TddDecomposer => 1024,
            _ => 2048,
        }
    }

    pub fn temperature(&self) -> f32 {
        match self {
            Self::TddTestWriter | Self::TddImplementer => 0.2,
            _ => 0.4,
        }
    }

    pub fn parse_verdict(&self) -> bool {
        matches!(self, Self::TddQualityReviewer)
    }

    pub fn all() -> [SubagentRole; 10] {
        [
            Self::CodeReviewer,
            Self::SecurityAuditor,
            Self::Planner,
            Self::RefactorSpecialist,
            Self::TestGenerator,
            Self::DocumentationWriter,
            Self::TddDecomposer,
            Self::TddTestWriter,
            Self::TddImplementer,
            Self::TddQualityReviewer,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_code_block_prefers_fenced_content() {
        let text = "here you go:\n```rust\nfn main() {}\n```\nthanks";
        assert_eq!(extract_code_block(text), "fn main() {}");
    }

    #[test]
    fn extract_code_block_falls_back_to_trimmed_text() {
        let text = "  just plain text  ";
        assert_eq!(extract_code_block(text), "just plain text");
    }

    #[test]
    fn extract_json_object_finds_balanced_braces_amid_prose() {
        let text = r#"Sure, here is the verdict: {"score": 0.9, "issues": []} - done."#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["score"], 0.9);
    }

    #[test]
    fn parse_verdict_falls_back_to_heuristic_on_invalid_json() {
        let verdict = parse_verdict("This looks broken and has a bug.");
        assert_eq!(verdict.score, 0.4);
        assert_eq!(verdict.issues, vec!["Could not parse structured review".to_string()]);
    }

    #[test]
    fn truncation_detected_when_near_cap_and_mid_sentence() {
        assert!(looks_truncated("and then the function starts to", 95, 100));
        assert!(!looks_truncated("A complete sentence.", 95, 100));
        assert!(!looks_truncated("short response", 10, 100));
    }
}
