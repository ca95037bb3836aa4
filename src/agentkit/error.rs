//! Error types for the agent development kit.
//!
//! Every fallible surface in the crate returns [`AgentError`], a closed
//! taxonomy that maps one-to-one onto wire status codes.  Middleware may wrap
//! an error with extra context (component, request id, elapsed time) via
//! [`AgentError::wrap`], but wrapping preserves the original kind so that the
//! outermost conversion layer still produces the right status.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Main error type for the kit.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Malformed message, empty required field, unknown protocol mode.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Authentication or signature verification failure, invalid API key.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Unknown provider name, missing cache or storage key.
    #[error("not found: {0}")]
    NotFound(String),

    /// Admission control denial.
    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Deadline exceeded.  Distinct from user cancellation so that callers
    /// can tell the two apart in metrics.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Upstream service 5xx or network failure after exhausted retries.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Uncaught failure or programmer error (e.g. double reply).
    #[error("internal error: {0}")]
    Internal(String),

    /// Optional capability not supported by this provider or mode.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Builder validation failure.  Carries every violation found so the
    /// caller can fix them all in one pass.
    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    /// An error wrapped with middleware context.  The inner kind is
    /// authoritative for status mapping.
    #[error("{context}: {source}")]
    Wrapped {
        /// Where the error was observed (middleware name, component).
        context: String,
        /// The original error.
        #[source]
        source: Box<AgentError>,
    },
}

impl AgentError {
    /// Create an invalid-input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        AgentError::InvalidInput(msg.into())
    }

    /// Create an unauthorized error.
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        AgentError::Unauthorized(msg.into())
    }

    /// Create a not-found error.
    pub fn not_found(msg: impl Into<String>) -> Self {
        AgentError::NotFound(msg.into())
    }

    /// Create a rate-limit-exceeded error.
    pub fn rate_limited(msg: impl Into<String>) -> Self {
        AgentError::RateLimitExceeded(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(msg: impl Into<String>) -> Self {
        AgentError::Timeout(msg.into())
    }

    /// Create an unavailable error.
    pub fn unavailable(msg: impl Into<String>) -> Self {
        AgentError::Unavailable(msg.into())
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        AgentError::Internal(msg.into())
    }

    /// Create a not-implemented error.
    pub fn not_implemented(msg: impl Into<String>) -> Self {
        AgentError::NotImplemented(msg.into())
    }

    /// Wrap this error with middleware context, preserving the inner kind.
    pub fn wrap(self, context: impl Into<String>) -> Self {
        AgentError::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// The innermost error, unwrapping any middleware context layers.
    pub fn root(&self) -> &AgentError {
        match self {
            AgentError::Wrapped { source, .. } => source.root(),
            other => other,
        }
    }

    /// Stable kind string used on the wire.
    pub fn kind(&self) -> &'static str {
        match self.root() {
            AgentError::InvalidInput(_) | AgentError::Validation(_) => "invalid_input",
            AgentError::Unauthorized(_) => "unauthorized",
            AgentError::NotFound(_) => "not_found",
            AgentError::RateLimitExceeded(_) => "rate_limit_exceeded",
            AgentError::Timeout(_) => "timeout",
            AgentError::Unavailable(_) => "unavailable",
            AgentError::Internal(_) => "internal",
            AgentError::NotImplemented(_) => "not_implemented",
            AgentError::Wrapped { .. } => unreachable!("root() never returns Wrapped"),
        }
    }

    /// HTTP-equivalent status code for this error's kind.
    pub fn status_code(&self) -> u16 {
        match self.root() {
            AgentError::InvalidInput(_) | AgentError::Validation(_) => 400,
            AgentError::Unauthorized(_) => 401,
            AgentError::NotFound(_) => 404,
            AgentError::RateLimitExceeded(_) => 429,
            AgentError::Timeout(_) => 504,
            AgentError::Unavailable(_) => 503,
            AgentError::Internal(_) => 500,
            AgentError::NotImplemented(_) => 501,
            AgentError::Wrapped { .. } => unreachable!("root() never returns Wrapped"),
        }
    }

    /// Whether a client is allowed to retry the operation that produced
    /// this error.  Invalid input and failed authentication never heal on
    /// their own; everything else might.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self.root(),
            AgentError::InvalidInput(_)
                | AgentError::Validation(_)
                | AgentError::Unauthorized(_)
                | AgentError::NotImplemented(_)
        )
    }

    /// Rebuild an error from its wire kind string.  Unknown kinds land on
    /// `internal` so a newer peer cannot confuse an older client.
    pub fn from_wire_kind(kind: &str, message: impl Into<String>) -> Self {
        let message = message.into();
        match kind {
            "invalid_input" => AgentError::InvalidInput(message),
            "unauthorized" => AgentError::Unauthorized(message),
            "not_found" => AgentError::NotFound(message),
            "rate_limit_exceeded" => AgentError::RateLimitExceeded(message),
            "timeout" => AgentError::Timeout(message),
            "unavailable" => AgentError::Unavailable(message),
            "not_implemented" => AgentError::NotImplemented(message),
            _ => AgentError::Internal(message),
        }
    }

    /// Serialize into the wire representation.
    pub fn to_wire(&self) -> ErrorBody {
        ErrorBody {
            error: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            AgentError::Timeout(err.to_string())
        } else {
            AgentError::Unavailable(err.to_string())
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::InvalidInput(err.to_string())
    }
}

/// JSON error body sent to clients: `{"error": <kind>, "message": <human>}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Stable kind string from the taxonomy.
    pub error: String,
    /// Human-readable description.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        assert_eq!(AgentError::invalid_input("x").kind(), "invalid_input");
        assert_eq!(AgentError::unauthorized("x").kind(), "unauthorized");
        assert_eq!(AgentError::not_found("x").kind(), "not_found");
        assert_eq!(AgentError::rate_limited("x").kind(), "rate_limit_exceeded");
        assert_eq!(AgentError::timeout("x").kind(), "timeout");
        assert_eq!(AgentError::unavailable("x").kind(), "unavailable");
        assert_eq!(AgentError::internal("x").kind(), "internal");
        assert_eq!(AgentError::not_implemented("x").kind(), "not_implemented");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(AgentError::invalid_input("x").status_code(), 400);
        assert_eq!(AgentError::unauthorized("x").status_code(), 401);
        assert_eq!(AgentError::not_found("x").status_code(), 404);
        assert_eq!(AgentError::rate_limited("x").status_code(), 429);
        assert_eq!(AgentError::timeout("x").status_code(), 504);
        assert_eq!(AgentError::unavailable("x").status_code(), 503);
        assert_eq!(AgentError::internal("x").status_code(), 500);
        assert_eq!(AgentError::not_implemented("x").status_code(), 501);
    }

    #[test]
    fn test_wrap_preserves_kind() {
        let err = AgentError::rate_limited("key k1")
            .wrap("limiter middleware")
            .wrap("dispatch");
        assert_eq!(err.kind(), "rate_limit_exceeded");
        assert_eq!(err.status_code(), 429);
        // Context layers show up in the display chain.
        assert!(err.to_string().contains("dispatch"));
        assert!(err.to_string().contains("limiter middleware"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(!AgentError::invalid_input("x").is_retryable());
        assert!(!AgentError::unauthorized("x").is_retryable());
        assert!(AgentError::timeout("x").is_retryable());
        assert!(AgentError::unavailable("x").is_retryable());
        assert!(AgentError::rate_limited("x").is_retryable());
        assert!(AgentError::internal("x").is_retryable());
    }

    #[test]
    fn test_validation_joins_violations() {
        let err = AgentError::Validation(vec![
            "name must not be empty".to_string(),
            "sage protocol requires a signing key".to_string(),
        ]);
        assert_eq!(err.kind(), "invalid_input");
        assert!(err.to_string().contains("name must not be empty"));
        assert!(err.to_string().contains("signing key"));
    }

    #[test]
    fn test_wire_body_round_trip() {
        let body = AgentError::not_found("provider \"mistral\"").to_wire();
        let json = serde_json::to_string(&body).unwrap();
        let back: ErrorBody = serde_json::from_str(&json).unwrap();
        assert_eq!(back.error, "not_found");
        assert!(back.message.contains("not found"));
    }
}
