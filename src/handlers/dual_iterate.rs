//! DualIterate: generate → review → fix loop between two fixed roles,
//! gated by a reviewer-assigned quality score (§4.10).

use crate::backends::CallRequest;
use crate::error::AppError;
use crate::registry::BackendRegistry;

use super::{extract_code_block, parse_verdict, Verdict};

const DEFAULT_QUALITY_THRESHOLD: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct IterationRecord {
    pub iter: u32,
    pub generated_code: String,
    pub review: Verdict,
}

pub struct DualIterateResult {
    pub approved: bool,
    pub code: String,
    pub final_score: f64,
    pub iterations: u32,
    pub final_review: Verdict,
    pub history: Option<Vec<IterationRecord>>,
}

pub struct DualIterateHandler;

impl DualIterateHandler {
    /// Runs the generate/review/fix loop (§4.10). `quality_threshold` is
    /// clamped into `[0.5, 1.0]`; `max_iterations` into `[1, 5]`.
    pub async fn run(
        registry: &BackendRegistry,
        coder: &str,
        reviewer: &str,
        task: &str,
        max_iterations: u32,
        quality_threshold: Option<f64>,
        include_history: bool,
    ) -> Result<DualIterateResult, AppError> {
        let max_iterations = max_iterations.clamp(1, 5);
        let quality_threshold = quality_threshold.unwrap_or(DEFAULT_QUALITY_THRESHOLD).clamp(0.5, 1.0);

        let mut history = Vec::new();
        let mut code = String::new();
        let mut review = Verdict {
            score: 0.0,
            issues: Vec::new(),
            suggestions: Vec::new(),
            summary: String::new(),
        };

        for iter in 1..=max_iterations {
            let generate_prompt = if iter == 1 {
                format!("Task:\n{task}\n\nWrite the implementation.")
            } else {
                format!(
                    "Task:\n{task}\n\nCurrent code:\n{code}\n\nPrevious review issues:\n{}\n\nPrevious review suggestions:\n{}\n\nRevise the code to address these.",
                    review.issues.join("\n"),
                    review.suggestions.join("\n"),
                )
            };

            let gen_response = registry
                .request_with_fallback(coder, CallRequest::new(generate_prompt, 2048, 0.3, false))
                .await?;
            code = extract_code_block(&gen_response.response.content);

            let review_prompt = format!(
                "Task:\n{task}\n\nCode to review:\n{code}\n\n\
                 Respond with strict JSON only: {{\"score\": 0-1, \"issues\": [...], \"suggestions\": [...], \"summary\": \"...\"}}"
            );
            let review_response = registry
                .request_with_fallback(reviewer, CallRequest::new(review_prompt, 1024, 0.2, false))
                .await?;
            review = parse_verdict(&review_response.response.content);

            history.push(IterationRecord {
                iter,
                generated_code: code.clone(),
                review: review.clone(),
            });

            if review.score >= quality_threshold {
                return Ok(DualIterateResult {
                    approved: true,
                    code,
                    final_score: review.score,
                    iterations: iter,
                    final_review: review,
                    history: include_history.then_some(history),
                });
            }
        }

        Ok(DualIterateResult {
            approved: false,
            final_score: review.score,
            code,
            iterations: max_iterations,
            final_review: review,
            history: include_history.then_some(history),
        })
    }
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
                default_coder: "coder".into(),
                default_reviewer: "reviewer".into(),
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

    fn chat_response(content: &str) -> serde_json::Value {
        serde_json::json!({
            "choices": [{ "message": { "content": content } }],
            "usage": { "completion_tokens": 10 },
        })
    }

    #[tokio::test]
    async fn approves_on_first_iteration_when_score_meets_threshold() {
        let coder = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(chat_response("```\nfn add(a: i32, b: i32) -> i32 { a + b }\n```")))
            .mount(&coder)
            .await;

        let reviewer = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(chat_response(
                r#"{"score": 0.9, "issues": [], "suggestions": [], "summary": "looks good"}"#,
            )))
            .mount(&reviewer)
            .await;

        let registry = registry(vec![descriptor("coder", &coder.uri()), descriptor("reviewer", &reviewer.uri())]);
        let result = DualIterateHandler::run(&registry, "coder", "reviewer", "add two numbers", 3, None, false)
            .await
            .unwrap();

        assert!(result.approved);
        assert_eq!(result.iterations, 1);
        assert!(result.code.contains("fn add"));
    }

    #[tokio::test]
    async fn exhausts_max_iterations_when_score_never_clears_threshold() {
        let coder = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(chat_response("```\nfn broken() {}\n```")))
            .mount(&coder)
            .await;

        let reviewer = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(chat_response(
                r#"{"score": 0.2, "issues": ["incomplete"], "suggestions": ["finish it"], "summary": "not done"}"#,
            )))
            .mount(&reviewer)
            .await;

        let registry = registry(vec![descriptor("coder", &coder.uri()), descriptor("reviewer", &reviewer.uri())]);
        let result = DualIterateHandler::run(&registry, "coder", "reviewer", "do something", 2, None, true)
            .await
            .unwrap();

        assert!(!result.approved);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.history.unwrap().len(), 2);
    }
}
