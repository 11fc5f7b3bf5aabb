use thiserror::Error;

/// Core error type for Cinch operations.
#[derive(Error, Debug)]
pub enum CinchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("SQL error: {0}")]
    Sql(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CinchError {
    /// Whether retrying the operation may succeed.
    ///
    /// Only upstream (forge API) failures are retryable; auth and
    /// validation failures never are.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Upstream(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for CinchError {
    fn from(e: serde_json::Error) -> Self {
        CinchError::Serialization(e.to_string())
    }
}

/// Result type alias using CinchError.
pub type Result<T> = std::result::Result<T, CinchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CinchError::Upstream("502 from forge".into()).is_transient());
        assert!(!CinchError::Auth("bad signature".into()).is_transient());
        assert!(!CinchError::Validation("missing build".into()).is_transient());
    }

    #[test]
    fn test_json_error_conversion() {
        let bad: std::result::Result<serde_json::Value, _> = serde_json::from_str("{nope");
        let err: CinchError = bad.unwrap_err().into();
        assert!(matches!(err, CinchError::Serialization(_)));
    }
}
