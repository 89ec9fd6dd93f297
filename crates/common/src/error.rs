use thiserror::Error;

/// Common error types used across the workers.
#[derive(Debug, Error)]
pub enum AppError {
    /// Non-2xx response or network failure talking to an upstream feed.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// The upstream payload carried an explicit error field.
    #[error("Upstream reported an error: {0}")]
    UpstreamReportedError(String),

    #[error("Malformed upstream payload: {0}")]
    MalformedUpstreamPayload(String),

    #[error("Duplicate resolution failed: {0}")]
    DuplicateResolution(String),

    #[error("Push delivery failed with status {status}: {body}")]
    PushDeliveryFailed { status: u16, body: String },

    /// The push went out but the notification row could not be marked sent.
    #[error("Notification row {0} not updated after send")]
    NotificationRowMissing(i64),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Errors that will fail identically on every retry of the same message.
    ///
    /// Consumers acknowledge and discard messages that fail this way instead of
    /// leaving them claimed forever.
    pub fn is_permanent(&self) -> bool {
        matches!(self, AppError::Decode(_))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Decode(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_decode_errors_are_permanent() {
        assert!(AppError::Decode("bad json".into()).is_permanent());
        assert!(!AppError::PushDeliveryFailed {
            status: 410,
            body: String::new()
        }
        .is_permanent());
        assert!(!AppError::NotificationRowMissing(7).is_permanent());
        assert!(!AppError::UpstreamUnavailable("timeout".into()).is_permanent());
    }

    #[test]
    fn test_serde_error_converts_to_decode() {
        let err: AppError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(matches!(err, AppError::Decode(_)));
    }
}
