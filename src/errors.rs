//! Crate-wide error taxonomy.
//!
//! Every component translates lower-level failures into one of these kinds;
//! kinds are never demoted on the way up. The HTTP layer maps each kind to a
//! status code and serializes the wire body, so nothing below the handlers
//! needs to know about HTTP at all.

use serde::Serialize;
use thiserror::Error;

/// The error kind taxonomy, independent of the carrying variant.
///
/// Serialized into the `error` field of the wire error body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    InvariantViolation,
    ExternalStorage,
    ExternalLlm,
    ExternalEmbedding,
    RateLimited,
    DeadlineExceeded,
    Internal,
}

impl ErrorKind {
    /// Stable machine-readable code for the wire `code` field.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation_failed",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvariantViolation => "invariant_violation",
            ErrorKind::ExternalStorage => "external_storage_failed",
            ErrorKind::ExternalLlm => "external_llm_failed",
            ErrorKind::ExternalEmbedding => "external_embedding_failed",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::DeadlineExceeded => "deadline_exceeded",
            ErrorKind::Internal => "internal_error",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Unified error type for the core.
///
/// Variants carry enough structure for the wire `details` field without
/// forcing callers to format messages themselves.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Input shape or invariant pre-check failed before any write.
    #[error("validation failed: {message}")]
    Validation {
        message: String,
        details: serde_json::Value,
    },

    /// The addressed entity does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Duplicate, concurrent-write conflict, or a cycle would be created.
    #[error("conflict: {message}")]
    Conflict { message: String },

    /// A post-write check caught a bug. Surfaced as a server error and logged.
    #[error("invariant violated: {message}")]
    InvariantViolation { message: String },

    /// The storage backend rejected the call after retries were exhausted.
    #[error("storage backend error: {message}")]
    ExternalStorage { message: String, retryable: bool },

    /// The LLM service rejected the call after retries were exhausted.
    #[error("llm service error: {message}")]
    ExternalLlm { message: String },

    /// The embedding service rejected the call after retries were exhausted.
    #[error("embedding service error: {message}")]
    ExternalEmbedding { message: String },

    /// Worker queue full or the caller exceeded a rate cap.
    #[error("rate limited: {message}")]
    RateLimited { message: String },

    /// A deadline expired at a suspension point.
    #[error("deadline exceeded during {operation}")]
    DeadlineExceeded { operation: String },

    /// Catch-all for bugs and unclassifiable failures.
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CoreError::Validation { .. } => ErrorKind::Validation,
            CoreError::NotFound { .. } => ErrorKind::NotFound,
            CoreError::Conflict { .. } => ErrorKind::Conflict,
            CoreError::InvariantViolation { .. } => ErrorKind::InvariantViolation,
            CoreError::ExternalStorage { .. } => ErrorKind::ExternalStorage,
            CoreError::ExternalLlm { .. } => ErrorKind::ExternalLlm,
            CoreError::ExternalEmbedding { .. } => ErrorKind::ExternalEmbedding,
            CoreError::RateLimited { .. } => ErrorKind::RateLimited,
            CoreError::DeadlineExceeded { .. } => ErrorKind::DeadlineExceeded,
            CoreError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// True when a fresh attempt at the same call could succeed.
    ///
    /// Drives the data-layer retry loop: validation and not-found failures
    /// never heal on retry, transient backend failures might.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::ExternalStorage { retryable, .. } => *retryable,
            CoreError::DeadlineExceeded { .. } => false,
            CoreError::ExternalLlm { .. } | CoreError::ExternalEmbedding { .. } => false,
            _ => false,
        }
    }

    /// Structured payload for the wire `details` field.
    pub fn details(&self) -> serde_json::Value {
        match self {
            CoreError::Validation { details, .. } => details.clone(),
            CoreError::NotFound { entity, id } => {
                serde_json::json!({ "entity": entity, "id": id })
            }
            _ => serde_json::Value::Null,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation {
            message: message.into(),
            details: serde_json::Value::Null,
        }
    }

    pub fn validation_with(message: impl Into<String>, details: serde_json::Value) -> Self {
        CoreError::Validation {
            message: message.into(),
            details,
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        CoreError::Conflict {
            message: message.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        CoreError::InvariantViolation {
            message: message.into(),
        }
    }

    pub fn storage(message: impl Into<String>, retryable: bool) -> Self {
        CoreError::ExternalStorage {
            message: message.into(),
            retryable,
        }
    }

    pub fn llm(message: impl Into<String>) -> Self {
        CoreError::ExternalLlm {
            message: message.into(),
        }
    }

    pub fn embedding(message: impl Into<String>) -> Self {
        CoreError::ExternalEmbedding {
            message: message.into(),
        }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        CoreError::RateLimited {
            message: message.into(),
        }
    }

    pub fn deadline(operation: impl Into<String>) -> Self {
        CoreError::DeadlineExceeded {
            operation: operation.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        CoreError::Internal {
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Internal {
            message: format!("serialization failure: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_carry_stable_codes() {
        assert_eq!(ErrorKind::Validation.code(), "validation_failed");
        assert_eq!(ErrorKind::DeadlineExceeded.code(), "deadline_exceeded");
        assert_eq!(
            CoreError::not_found("chunk", "abc").kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn retryability_follows_storage_flag() {
        assert!(CoreError::storage("503 from engine", true).is_retryable());
        assert!(!CoreError::storage("bad request", false).is_retryable());
        assert!(!CoreError::validation("nope").is_retryable());
        assert!(!CoreError::llm("exhausted").is_retryable());
    }

    #[test]
    fn not_found_details_name_the_entity() {
        let err = CoreError::not_found("template", "t-1");
        assert_eq!(err.details()["entity"], "template");
        assert_eq!(err.details()["id"], "t-1");
    }
}
