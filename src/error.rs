use axum::http::StatusCode;
use std::time::Duration;
use thiserror::Error;

/// Message returned to clients for any failure past validation.
pub const INTERNAL_ERROR_MESSAGE: &str = "internal error";

/// Message returned to clients when neither `url` nor `html` is supplied.
pub const ARGUMENTS_ERROR_MESSAGE: &str = "arguments error";

/// Message returned to clients that exceed their request window.
pub const RATE_LIMIT_MESSAGE: &str = "please slow";

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Invalid arguments: {0}")]
    Validation(String),

    #[error("Selector not found: {0}")]
    SelectorNotFound(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Capture failed: {0}")]
    Capture(String),

    #[error("Browser launch failed: {0}")]
    PoolLaunchFailure(String),

    #[error("Rate limit exceeded for {0}")]
    RateLimitExceeded(String),

    #[error("Task queue closed before the job completed")]
    QueueClosed,

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl RenderError {
    /// Status code the gateway answers with for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            RenderError::Validation(_) => StatusCode::BAD_REQUEST,
            RenderError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-facing body. Never carries internal detail.
    pub fn client_message(&self) -> &'static str {
        match self {
            RenderError::Validation(_) => ARGUMENTS_ERROR_MESSAGE,
            RenderError::RateLimitExceeded(_) => RATE_LIMIT_MESSAGE,
            _ => INTERNAL_ERROR_MESSAGE,
        }
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            RenderError::Validation(_) => "validation",
            RenderError::SelectorNotFound(_) => "selector_not_found",
            RenderError::Navigation(_) => "navigation",
            RenderError::Timeout(_) => "timeout",
            RenderError::Capture(_) => "capture",
            RenderError::PoolLaunchFailure(_) => "pool_launch",
            RenderError::RateLimitExceeded(_) => "rate_limited",
            RenderError::QueueClosed => "queue_closed",
            RenderError::Configuration(_) => "configuration",
            RenderError::Io(_) => "io",
            RenderError::Serialization(_) => "serialization",
        }
    }
}

impl From<std::io::Error> for RenderError {
    fn from(err: std::io::Error) -> Self {
        RenderError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for RenderError {
    fn from(err: serde_json::Error) -> Self {
        RenderError::Serialization(err.to_string())
    }
}
