//! Pipeline error types

use thiserror::Error;

/// Errors produced by the payment-event pipeline
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Webhook body is empty")]
    EmptyBody,

    #[error("Malformed webhook payload: {0}")]
    MalformedPayload(String),

    #[error("Webhook signature invalid: {0}")]
    SignatureInvalid(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Webhook processing failed: {0}")]
    Processing(String),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

impl PipelineError {
    /// True for failures the gateway should re-deliver (surfaced as 5xx)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::Database(_) | PipelineError::Publish(_) | PipelineError::Processing(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caller_errors_are_not_retryable() {
        assert!(!PipelineError::EmptyBody.is_retryable());
        assert!(!PipelineError::MalformedPayload("bad json".into()).is_retryable());
        assert!(!PipelineError::SignatureInvalid("mismatch".into()).is_retryable());
    }

    #[test]
    fn processing_errors_are_retryable() {
        assert!(PipelineError::Processing("boom".into()).is_retryable());
        assert!(PipelineError::Publish("downstream down".into()).is_retryable());
    }
}
