use std::time::Duration;
use thiserror::Error;

pub type CoreResult<T> = Result<T, CoreError>;

/// Error kinds surfaced by the control plane. The HTTP layer maps each kind to
/// one status code; reconcilers log them and move on.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid {field}: {message}")]
    Validation { field: String, message: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("backend rejected the request: {0}")]
    BackendRejected(String),

    #[error("circuit open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: Duration },

    #[error("rate limited")]
    RateLimited,

    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::Validation {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound(what.into())
    }

    pub fn internal(e: impl std::fmt::Display) -> Self {
        CoreError::Internal(e.to_string())
    }

    /// Short machine-readable tag used in responses and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::Validation { .. } => "validation",
            CoreError::NotFound(_) => "not_found",
            CoreError::Conflict(_) => "conflict",
            CoreError::BackendUnavailable(_) => "backend_unavailable",
            CoreError::BackendRejected(_) => "backend_rejected",
            CoreError::CircuitOpen { .. } => "circuit_open",
            CoreError::RateLimited => "rate_limited",
            CoreError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::RowNotFound => CoreError::NotFound("row".to_string()),
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                CoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                CoreError::Conflict(db.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                CoreError::BackendUnavailable(format!("database: {e}"))
            }
            _ => CoreError::Internal(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Internal(format!("json: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_not_found_maps_to_not_found() {
        let e: CoreError = sqlx::Error::RowNotFound.into();
        assert_eq!(e.kind(), "not_found");
    }

    #[test]
    fn validation_message_names_field() {
        let e = CoreError::validation("ports", "expected ext:int");
        assert_eq!(e.to_string(), "invalid ports: expected ext:int");
    }
}
