//! Maps [`CoreError`] to an axum response: HTTP status plus the
//! OpenAI-shaped `{"error": {...}}` body (spec.md §7 "Propagation policy" —
//! "any uncaught exception becomes 500 internal_error with a generic
//! message, never a stack trace").

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use subterm_error::{CoreError, ErrorBody};

pub struct GatewayError(pub CoreError);

impl From<CoreError> for GatewayError {
    fn from(err: CoreError) -> Self {
        GatewayError(err)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.0.http_status().unwrap_or(500);
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body: ErrorBody = (&self.0).into();
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn input_validation_maps_to_400() {
        let resp = GatewayError(CoreError::InputValidation("too long".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn database_unavailable_maps_to_503() {
        let resp = GatewayError(CoreError::DatabaseUnavailable("down".into())).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn agent_timeout_maps_to_504() {
        let resp = GatewayError(CoreError::AgentTimeout("deadline".into())).into_response();
        assert_eq!(resp.status(), StatusCode::GATEWAY_TIMEOUT);
    }

    #[test]
    fn internal_error_maps_to_500() {
        let resp = GatewayError(CoreError::Internal("boom".into())).into_response();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn unsupported_model_maps_to_400_with_its_own_code() {
        let resp = GatewayError(CoreError::UnsupportedModel("bad model".into())).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }
}
