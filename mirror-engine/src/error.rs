use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MirrorError>;

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Signals raised by the transport collaborator for a single outbound call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Scheduling signal, not a failure.
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },

    #[error("forbidden to write: {0}")]
    Forbidden(String),

    #[error("message not modified")]
    NotModified,

    #[error("content unavailable: {0}")]
    ContentUnavailable(String),

    #[error("transient error: {0}")]
    Transient(String),

    /// Non-retryable request error.
    #[error("rejected: {0}")]
    Rejected(String),
}

impl TransportError {
    pub fn label(&self) -> &'static str {
        match self {
            Self::RateLimited { .. } => "rate_limited",
            Self::Forbidden(_) => "forbidden",
            Self::NotModified => "not_modified",
            Self::ContentUnavailable(_) => "content_unavailable",
            Self::Transient(_) => "transient",
            Self::Rejected(_) => "rejected",
        }
    }
}

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("settings error: {0}")]
    Settings(String),
}

impl From<serde_json::Error> for MirrorError {
    fn from(e: serde_json::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}
