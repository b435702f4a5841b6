//! HTTP error mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use memberpay_pipeline::PipelineError;

/// API-level error: a status code plus an operator-readable message.
/// Retryable pipeline failures surface as 500 so the gateway re-delivers.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn unauthorized(message: &str) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.to_string(),
        }
    }

    pub fn bad_request(message: &str) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.to_string(),
        }
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        let status = match &err {
            PipelineError::EmptyBody
            | PipelineError::MalformedPayload(_)
            | PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::SignatureInvalid(_) => StatusCode::UNAUTHORIZED,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::Conflict(_) => StatusCode::CONFLICT,
            PipelineError::Database(_)
            | PipelineError::Serialization(_)
            | PipelineError::Config(_)
            | PipelineError::Publish(_)
            | PipelineError::Processing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // Internal details stay in the logs, not the response body
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!(error = %err, "Request failed");
            "internal error".to_string()
        } else {
            err.to_string()
        };

        Self { status, message }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(serde_json::json!({ "error": self.message }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_failures_map_to_401() {
        let err = ApiError::from(PipelineError::SignatureInvalid("mismatch".into()));
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn retryable_failures_map_to_500_without_detail() {
        let err = ApiError::from(PipelineError::Processing("tx aborted".into()));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.message, "internal error");
    }

    #[test]
    fn caller_errors_keep_their_detail() {
        let err = ApiError::from(PipelineError::EmptyBody);
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("empty"));
    }
}
