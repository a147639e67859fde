//! Error types for AlarmSage.

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Unknown machine model, missing credentials, bad config file.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Tool arguments or alarm fields failed validation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The language model produced a tool call that could not be decoded.
    #[error("Malformed tool call: {0}")]
    MalformedToolCall(String),

    /// Network / provider failure of an embedding, rerank or model call.
    #[error("Upstream error ({service}): {message}")]
    Upstream { service: String, message: String },

    #[error("Rate limited by {service}")]
    RateLimited {
        service: String,
        retry_after: Option<Duration>,
    },

    #[error("Timed out after {elapsed:?}: {operation}")]
    Timeout { operation: String, elapsed: Duration },

    /// Indexes or rerank output disagree with the candidate set.
    #[error("Consistency error: {0}")]
    Consistency(String),

    #[error("Agent exceeded {0} iterations without a final answer")]
    IterationLimit(usize),

    #[error("Turn cancelled: {0}")]
    Cancelled(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn upstream(service: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Error::Upstream {
            service: service.into(),
            message: message.to_string(),
        }
    }

    pub fn timeout(operation: impl Into<String>, elapsed: Duration) -> Self {
        Error::Timeout {
            operation: operation.into(),
            elapsed,
        }
    }

    /// Map a non-success HTTP status from an external service.
    ///
    /// 429 becomes `RateLimited` (carrying any `Retry-After` hint); 401/403
    /// mean bad credentials and are configuration errors; everything else is
    /// a transient upstream failure.
    pub fn from_http_status(
        service: &str,
        status: u16,
        retry_after: Option<Duration>,
        body: &str,
    ) -> Self {
        match status {
            429 => Error::RateLimited {
                service: service.to_string(),
                retry_after,
            },
            401 | 403 => Error::Config(format!("{} rejected credentials ({}): {}", service, status, body)),
            _ => Error::upstream(service, format!("HTTP {}: {}", status, body)),
        }
    }

    /// Transient failures that an idempotent caller may retry with backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Upstream { .. } | Error::RateLimited { .. } | Error::Timeout { .. }
        )
    }

    /// Errors that must end the current turn instead of being fed back to the model.
    pub fn is_fatal_for_turn(&self) -> bool {
        matches!(
            self,
            Error::Config(_) | Error::MalformedToolCall(_) | Error::Cancelled(_)
        )
    }

    /// Short machine-readable kind, used in SSE error frames and tool results.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "configuration",
            Error::Validation(_) => "validation",
            Error::MalformedToolCall(_) => "malformed_tool_call",
            Error::Upstream { .. } => "upstream",
            Error::RateLimited { .. } => "rate_limited",
            Error::Timeout { .. } => "timeout",
            Error::Consistency(_) => "consistency",
            Error::IterationLimit(_) => "iteration_limit",
            Error::Cancelled(_) => "cancelled",
            Error::Storage(_) | Error::Database(_) => "storage",
            Error::NotFound(_) => "not_found",
            Error::Search(_) => "search",
            Error::Io(_) => "io",
            Error::Json(_) => "json",
            Error::Internal(_) => "internal",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
