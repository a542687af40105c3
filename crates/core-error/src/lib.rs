//! Closed error taxonomy shared by the cancellation agent (Core A) and the
//! analyst gateway (Core B).
//!
//! Mirrors the teacher's `AgentError` / `RunError` shape (one `thiserror` enum
//! per failure domain) but collapses both cores onto a single closed set so
//! that `core()` can be called from either side of the workspace and mapped
//! to an HTTP status only where one applies (§7 of the spec).

use serde::Serialize;
use thiserror::Error;

/// The closed set of failure kinds from spec.md §7. Variants used only by
/// Core A carry no HTTP mapping; variants used only by Core B always do.
///
/// `Clone` lets the gateway's provider singleton cache an init failure and
/// hand the same error back to every subsequent request without retrying
/// initialization (spec.md §4.9).
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    /// Invalid env/state at startup. Fatal; the process should not serve.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Caller violated an input contract (e.g. oversized request body).
    #[error("input validation error: {0}")]
    InputValidation(String),

    /// The request named a model this gateway does not serve (Core B only).
    /// Distinct from `InputValidation` so the two don't share a machine code:
    /// spec.md §4.6 requires `model == "claude-da/analyst"`, and a mismatch
    /// here is a different failure than an oversized request body.
    #[error("unsupported model: {0}")]
    UnsupportedModel(String),

    /// Upstream language-model endpoint throttled the request.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// The database tool server could not be started or reached.
    #[error("database unavailable: {0}")]
    DatabaseUnavailable(String),

    /// A per-request deadline was exceeded.
    #[error("agent timeout: {0}")]
    AgentTimeout(String),

    /// A targeting strategy did not resolve to an element (Core A only).
    #[error("element not found: {0}")]
    ElementNotFound(String),

    /// The planner refused or returned a low-confidence plan (Core A only).
    #[error("state detection error: {0}")]
    StateDetection(String),

    /// A transient browser/network flake; retryable with backoff (Core A only).
    #[error("transient error: {0}")]
    Transient(String),

    /// A human checkpoint is required and has not been satisfied (Core A only).
    #[error("human intervention required: {0}")]
    HumanInterventionRequired(String),

    /// The operator aborted a human checkpoint, or its timeout elapsed (Core A only).
    #[error("user aborted: {0}")]
    UserAborted(String),

    /// Anything uncaught; never exposes internals past this message.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// HTTP status for Core B's gateway, or `None` for Core A-only kinds and
    /// for kinds that never reach the HTTP boundary directly.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            CoreError::Configuration(_) => Some(500),
            CoreError::InputValidation(_) => Some(400),
            CoreError::UnsupportedModel(_) => Some(400),
            CoreError::RateLimit(_) => Some(429),
            CoreError::DatabaseUnavailable(_) => Some(503),
            CoreError::AgentTimeout(_) => Some(504),
            CoreError::Internal(_) => Some(500),
            CoreError::ElementNotFound(_)
            | CoreError::StateDetection(_)
            | CoreError::Transient(_)
            | CoreError::HumanInterventionRequired(_)
            | CoreError::UserAborted(_) => None,
        }
    }

    /// Machine-readable code, e.g. for the OpenAI-shaped error body.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Configuration(_) => "internal_error",
            CoreError::InputValidation(_) => "input_too_long",
            CoreError::UnsupportedModel(_) => "unsupported_model",
            CoreError::RateLimit(_) => "rate_limited",
            CoreError::DatabaseUnavailable(_) => "database_unavailable",
            CoreError::AgentTimeout(_) => "agent_timeout",
            CoreError::Internal(_) => "internal_error",
            CoreError::ElementNotFound(_) => "element_not_found",
            CoreError::StateDetection(_) => "state_detection_error",
            CoreError::Transient(_) => "transient_error",
            CoreError::HumanInterventionRequired(_) => "human_intervention_required",
            CoreError::UserAborted(_) => "user_aborted",
        }
    }

    /// True for Core A errors that the caller should retry (with backoff, up to a cap).
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Transient(_) | CoreError::RateLimit(_))
    }
}

/// OpenAI-shaped error body for Core B's HTTP surface: `{"error": {...}}`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
}

impl From<&CoreError> for ErrorBody {
    fn from(err: &CoreError) -> Self {
        let error_type = match err.http_status() {
            Some(400) => "invalid_request_error",
            Some(429) => "rate_limit_error",
            Some(503) | Some(504) => "service_unavailable_error",
            _ => "internal_error",
        };
        ErrorBody {
            error: ErrorDetail {
                // Never leak internals: use the Display message, which every
                // variant constructs from caller-provided, already-sanitized text.
                message: err.to_string(),
                error_type: error_type.to_string(),
                code: err.code().to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_validation_maps_to_400_input_too_long() {
        let e = CoreError::InputValidation("too long".into());
        assert_eq!(e.http_status(), Some(400));
        assert_eq!(e.code(), "input_too_long");
    }

    #[test]
    fn unsupported_model_maps_to_400_with_a_distinct_code() {
        let e = CoreError::UnsupportedModel("claude-da/analyst".into());
        assert_eq!(e.http_status(), Some(400));
        assert_eq!(e.code(), "unsupported_model");
        assert_ne!(e.code(), CoreError::InputValidation("x".into()).code());
    }

    #[test]
    fn agent_timeout_maps_to_504() {
        let e = CoreError::AgentTimeout("deadline exceeded".into());
        assert_eq!(e.http_status(), Some(504));
        assert_eq!(e.code(), "agent_timeout");
    }

    #[test]
    fn core_a_only_kinds_have_no_http_mapping() {
        assert_eq!(CoreError::ElementNotFound("x".into()).http_status(), None);
        assert_eq!(CoreError::UserAborted("x".into()).http_status(), None);
    }

    #[test]
    fn transient_and_rate_limit_are_retryable() {
        assert!(CoreError::Transient("flake".into()).is_retryable());
        assert!(CoreError::RateLimit("429".into()).is_retryable());
        assert!(!CoreError::Configuration("bad".into()).is_retryable());
    }

    #[test]
    fn error_body_never_contains_type_name_only_message() {
        let e = CoreError::DatabaseUnavailable("tool server exited".into());
        let body = ErrorBody::from(&e);
        assert_eq!(body.error.code, "database_unavailable");
        assert!(body.error.message.contains("tool server exited"));
    }
}
