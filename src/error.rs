//! Typed error taxonomy shared by the registry, router, and handlers.
//!
//! `AppError` is behavioral, not syntactic: callers match on *kind*, not on
//! message text. `anyhow::Error` is reserved for the startup/config/
//! persistence boundary, where a human-readable chain of context is more
//! useful than a typed variant and failures are either fatal (startup) or
//! silently logged (persistence) rather than surfaced to a tool caller.

use thiserror::Error;

/// The error taxonomy a `BackendAdapter::call` / `probe` can fail with.
#[derive(Debug, Error)]
pub enum AppError {
    /// Credentials missing or rejected by the provider. Not retried; marks
    /// the backend `degraded` for the health monitor.
    #[error("authentication failed for backend `{backend}`")]
    Auth { backend: String },

    /// Provider-side throttling (HTTP 429). Counts as a circuit-breaker
    /// failure; not retried within the same call.
    #[error("backend `{backend}` rate limited the request")]
    RateLimited { backend: String },

    /// Deadline exceeded locally, or an upstream gateway timeout.
    #[error("request to backend `{backend}` timed out after {elapsed_ms}ms")]
    Timeout { backend: String, elapsed_ms: u64 },

    /// Connection refused/reset, DNS failure, or 5xx.
    #[error("transport error calling backend `{backend}`: {detail}")]
    Transport { backend: String, detail: String },

    /// Valid HTTP response but unparseable or empty content.
    #[error("backend `{backend}` returned an unparseable or empty response")]
    InvalidResponse { backend: String },

    /// Any other non-2xx status that doesn't map cleanly onto the categories
    /// above.
    #[error("backend `{backend}` returned HTTP {status}")]
    Http { backend: String, status: u16 },

    /// The circuit breaker rejected the request before any transport call
    /// was made. Downstream behavior is identical to any other failure.
    #[error("circuit breaker open for backend `{backend}`")]
    CircuitOpen { backend: String },

    /// A workflow-level deadline elapsed before this call finished (§5).
    /// Not the backend's fault — it may still be perfectly healthy — so it
    /// never counts as a breaker failure.
    #[error("request cancelled: workflow deadline exceeded")]
    Cancelled,

    /// Tool input failed schema validation. Returned synchronously; never
    /// touches a backend.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Every candidate in a fallback chain failed. Carries the per-backend
    /// causes in attempt order.
    #[error("all backends in fallback chain failed: {}", summarize_attempts(.0))]
    AllBackendsFailed(Vec<(String, String)>),

    /// Startup, config, or persistence failures that never reach a tool
    /// caller as a typed error.
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn summarize_attempts(attempts: &[(String, String)]) -> String {
    attempts
        .iter()
        .map(|(backend, cause)| format!("{backend}: {cause}"))
        .collect::<Vec<_>>()
        .join("; ")
}

impl AppError {
    /// Whether this error should increment the circuit breaker's failure
    /// counter (§4.2 / §7). Validation errors never touch a backend at all,
    /// and `CircuitOpen` is itself a consequence of the breaker, not a new
    /// failure to count.
    pub fn counts_as_breaker_failure(&self) -> bool {
        !matches!(
            self,
            AppError::Validation(_)
                | AppError::CircuitOpen { .. }
                | AppError::Internal(_)
                | AppError::Cancelled
        )
    }

    /// Whether this error should additionally mark the backend `degraded`
    /// for the health monitor (§4.2: auth failures do).
    pub fn marks_degraded(&self) -> bool {
        matches!(self, AppError::Auth { .. })
    }

    /// Maps an HTTP status code to the taxonomy per §4.1/§7.
    pub fn from_status(backend: &str, status: u16) -> Self {
        match status {
            401 | 403 => AppError::Auth {
                backend: backend.to_string(),
            },
            429 => AppError::RateLimited {
                backend: backend.to_string(),
            },
            408 | 504 => AppError::Timeout {
                backend: backend.to_string(),
                elapsed_ms: 0,
            },
            500..=599 => AppError::Transport {
                backend: backend.to_string(),
                detail: format!("server error {status}"),
            },
            _ => AppError::Http {
                backend: backend.to_string(),
                status,
            },
        }
    }

    /// Redacts any substring that looks like a credential before the error
    /// is allowed into a log line or tool response (§7 user-visible
    /// behavior: sensitive strings must never leak).
    pub fn redacted_message(&self) -> String {
        redact(&self.to_string())
    }
}

/// Strips common credential shapes (`Bearer <token>`, `x-api-key: ...`,
/// `Authorization: ...`) from a string before it is logged or returned to a
/// caller.
pub fn redact(input: &str) -> String {
    let mut out = input.to_string();
    for marker in ["Bearer ", "bearer ", "x-api-key: ", "Authorization: "] {
        if let Some(idx) = out.find(marker) {
            let start = idx + marker.len();
            let end = out[start..]
                .find(char::is_whitespace)
                .map(|i| start + i)
                .unwrap_or(out.len());
            out.replace_range(start..end, "[REDACTED]");
        }
    }
    out
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_does_not_count_as_breaker_failure() {
        assert!(!AppError::Validation("bad".into()).counts_as_breaker_failure());
    }

    #[test]
    fn transport_counts_as_breaker_failure() {
        let err = AppError::Transport {
            backend: "a".into(),
            detail: "refused".into(),
        };
        assert!(err.counts_as_breaker_failure());
    }

    #[test]
    fn auth_marks_degraded_and_counts_as_failure() {
        let err = AppError::Auth { backend: "a".into() };
        assert!(err.marks_degraded());
        assert!(err.counts_as_breaker_failure());
    }

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert!(matches!(
            AppError::from_status("a", 401),
            AppError::Auth { .. }
        ));
        assert!(matches!(
            AppError::from_status("a", 429),
            AppError::RateLimited { .. }
        ));
        assert!(matches!(
            AppError::from_status("a", 503),
            AppError::Transport { .. }
        ));
        assert!(matches!(
            AppError::from_status("a", 404),
            AppError::Http { status: 404, .. }
        ));
    }

    #[test]
    fn redacts_bearer_token() {
        let msg = "request failed: Bearer sk-abc123 rejected";
        assert_eq!(redact(msg), "request failed: Bearer [REDACTED] rejected");
    }
}
