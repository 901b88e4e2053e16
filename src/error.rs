// src/error.rs
// Standardized error types for the analysis engine

use thiserror::Error;

/// Main error type for the sleuth library
#[derive(Error, Debug)]
pub enum SleuthError {
    /// The chosen backend could not be reached. Transient: callers retry
    /// with backoff, then escalate or abort.
    #[error("analyzer backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend answered, but its output does not fit the result
    /// contract (bad JSON, missing field, confidence out of range).
    /// Never surfaced raw to callers; forces escalation instead.
    #[error("malformed analyzer response: {0}")]
    MalformedResponse(String),

    /// The cost ledger refused the reservation. Terminal for the current
    /// record, not for the batch.
    #[error("analysis budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("pattern library error: {0}")]
    Patterns(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),
}

/// Convenience type alias for Result using SleuthError
pub type Result<T> = std::result::Result<T, SleuthError>;

impl From<tokio::task::JoinError> for SleuthError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            SleuthError::Cancelled
        } else {
            SleuthError::Config(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_unavailable_message() {
        let err = SleuthError::BackendUnavailable("connection refused".to_string());
        assert!(err.to_string().contains("unavailable"));
        assert!(err.to_string().contains("connection refused"));
    }

    #[test]
    fn test_malformed_response_message() {
        let err = SleuthError::MalformedResponse("confidence out of range".to_string());
        assert!(err.to_string().contains("malformed"));
    }

    #[test]
    fn test_budget_exceeded_message() {
        let err = SleuthError::BudgetExceeded("daily ceiling reached".to_string());
        assert!(err.to_string().contains("budget exceeded"));
    }

    #[test]
    fn test_from_json_error() {
        let json_err = serde_json::from_str::<i32>("not json").unwrap_err();
        let err: SleuthError = json_err.into();
        assert!(matches!(err, SleuthError::Json(_)));
    }
}
