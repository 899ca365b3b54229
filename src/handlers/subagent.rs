//! Subagent: a single role-templated call against the best available
//! backend for that role (§4.12).

use crate::backends::CallRequest;
use crate::error::AppError;
use crate::registry::BackendRegistry;

use super::{extract_json_object, SubagentRole};

pub struct SubagentResult {
    pub role: SubagentRole,
    pub verdict: Option<serde_json::Value>,
    pub text_content: String,
    pub backend_used: String,
}

pub struct SubagentHandler;

impl SubagentHandler {
    /// Picks the first healthy backend in `recommended_backends`, falling
    /// through the global fallback chain if none are healthy, then issues a
    /// single role-templated request (§4.12).
    pub async fn invoke(
        registry: &BackendRegistry,
        role: SubagentRole,
        recommended_backends: &[String],
        task_prompt: &str,
    ) -> Result<SubagentResult, AppError> {
        let backend = recommended_backends
            .iter()
            .find(|b| registry.is_available(b))
            .or_else(|| registry.global_chain().iter().find(|b| registry.is_available(b)))
            .or_else(|| registry.global_chain().first())
            .cloned()
            .ok_or_else(|| AppError::Validation("no backends configured".to_string()))?;

        let prompt = format!("{}\n\n{}", role.system_prompt(), task_prompt);
        let request = CallRequest::new(prompt, role.max_tokens(), role.temperature(), false);

        let response = registry.request(&backend, request).await?;

        let verdict = if role.parse_verdict() {
            extract_json_object(&response.content)
        } else {
            None
        };

        Ok(SubagentResult {
            role,
            verdict,
            text_content: response.content,
            backend_used: backend,
        })
    }
}
