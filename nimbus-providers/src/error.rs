use nimbus_common::CoreError;
use thiserror::Error;

pub type BackendResult<T> = Result<T, BackendError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackendError {
    /// The call never reached the daemon (socket down, connect refused).
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// The daemon answered and refused.
    #[error("backend rejected: {0}")]
    Rejected(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("ip not yet assigned for {0}")]
    IpNotAssigned(String),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("cancelled")]
    Cancelled,

    #[error("invalid identifier {field}: {value:?}")]
    InvalidIdentifier { field: String, value: String },

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("binary not found: {0}")]
    BinaryMissing(String),
}

impl BackendError {
    /// Errors that say nothing about the daemon's health.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Unavailable(_) | BackendError::DeadlineExceeded | BackendError::BinaryMissing(_)
        )
    }
}

/// Fails fast before any side effect when `value` is not a safe identifier.
pub fn check_identifier(field: &str, value: &str) -> BackendResult<()> {
    if nimbus_common::validate::is_identifier(value) {
        Ok(())
    } else {
        Err(BackendError::InvalidIdentifier {
            field: field.to_string(),
            value: value.to_string(),
        })
    }
}

impl From<BackendError> for CoreError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::Unavailable(_)
            | BackendError::DeadlineExceeded
            | BackendError::Cancelled
            | BackendError::IpNotAssigned(_)
            | BackendError::BinaryMissing(_) => CoreError::BackendUnavailable(e.to_string()),
            BackendError::Rejected(_) | BackendError::Unsupported(_) => {
                CoreError::BackendRejected(e.to_string())
            }
            BackendError::NotFound(what) => CoreError::NotFound(what),
            BackendError::InvalidIdentifier { field, value } => {
                CoreError::validation(field, format!("{value:?} must match ^[A-Za-z0-9_-]+$"))
            }
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => BackendError::NotFound(e.to_string()),
            _ => BackendError::Unavailable(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_into_core_kinds() {
        let e: CoreError = BackendError::DeadlineExceeded.into();
        assert_eq!(e.kind(), "backend_unavailable");
        let e: CoreError = BackendError::Rejected("no such image".into()).into();
        assert_eq!(e.kind(), "backend_rejected");
        let e: CoreError = BackendError::InvalidIdentifier {
            field: "name".into(),
            value: "../x".into(),
        }
        .into();
        assert_eq!(e.kind(), "validation");
    }

    #[test]
    fn identifier_check() {
        assert!(check_identifier("name", "vm-1").is_ok());
        assert!(matches!(
            check_identifier("name", "vm/1"),
            Err(BackendError::InvalidIdentifier { .. })
        ));
    }
}
