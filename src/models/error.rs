//! Error types for curator.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (unsupported model, invalid input)
//! - I^B materialized: Infrastructure failures (network, timeout, remote errors)
//! - K_i violated: Internal invariant violations (bugs)
//!
//! Validation verdicts are not errors: a rejected conversation is a counted
//! [`RejectReason`], never a `CuratorError`.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use super::FailureKind;

/// Top-level error type for curator.
#[derive(Debug, Error)]
pub enum CuratorError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Configuration error: {0}")]
    Config(#[from] super::ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Token accounting is not implemented for model '{0}'")]
    UnsupportedModel(String),

    #[error("Estimated cost of {requested} tokens exceeds limiter capacity of {capacity}")]
    CapacityExceeded { requested: u64, capacity: u64 },

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════
    #[error("API error: {0}")]
    Api(#[from] ApiError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(Duration),

    #[error("Rate limited: retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: f64 },

    #[error("Cancelled before completion")]
    Cancelled,

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════
    #[error("Token encoding unavailable: {0}")]
    Encoding(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Remote chat-completion endpoint errors.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed: invalid API key")]
    AuthenticationFailed,

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("API error (status {status}): {message}")]
    Status { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Request failed after {attempts} attempts: {last_error}")]
    MaxRetriesExceeded { attempts: u32, last_error: String },
}

impl CuratorError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is retryable.
    ///
    /// Server-side (5xx) statuses count as transient alongside throttling
    /// and connectivity failures.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::RateLimited { .. } | Self::Network(_) => true,
            Self::Api(ApiError::Status { status, .. }) => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Get retry delay hint in seconds, if applicable.
    pub fn retry_after(&self) -> Option<f64> {
        match self {
            Self::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Classify this error for a per-item dispatch outcome.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::CapacityExceeded { .. } => FailureKind::CapacityExceeded,
            Self::Cancelled => FailureKind::Cancelled,
            Self::Internal(_) | Self::Encoding(_) => FailureKind::Internal,
            // Retries ran out on a transient condition
            Self::Api(ApiError::MaxRetriesExceeded { .. }) => FailureKind::Transient,
            e if e.is_retryable() => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }
}

/// Why a conversation was turned away by the validator.
///
/// Variants are declared in the order the validator checks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Error)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The record is not an object carrying a `messages` list
    #[error("record has no messages list")]
    MalformedRecord,
    #[error("conversation is empty")]
    Empty,
    #[error("conversation has an even number of messages")]
    EvenLength,
    #[error("first message is not a system message")]
    FirstNotSystem,
    /// Needs exactly one of `content` / `function_call`, and textual content
    #[error("message needs exactly one of textual content or function_call")]
    InvalidContent,
    #[error("message carries an unrecognized field")]
    UnrecognizedField,
    #[error("message role is not recognized")]
    UnrecognizedRole,
    #[error("user message is not followed by an assistant message")]
    UserNotFollowedByAssistant,
    #[error("conversation has no assistant message")]
    MissingAssistant,
}

impl RejectReason {
    /// Stable key used in reports and manifests.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MalformedRecord => "malformed_record",
            Self::Empty => "empty",
            Self::EvenLength => "even_length",
            Self::FirstNotSystem => "first_not_system",
            Self::InvalidContent => "invalid_content",
            Self::UnrecognizedField => "unrecognized_field",
            Self::UnrecognizedRole => "unrecognized_role",
            Self::UserNotFollowedByAssistant => "user_not_followed_by_assistant",
            Self::MissingAssistant => "missing_assistant",
        }
    }
}

/// Result type alias for curator.
pub type Result<T> = std::result::Result<T, CuratorError>;
