//! Layered error definitions
//!
//! Categorized by source: session / subscription / token / runtime / config

use thiserror::Error;

use crate::StreamId;

/// Unified error type
#[derive(Debug, Error)]
pub enum StreamingError {
    // ===== Session Errors =====
    /// Handshake referenced a stream id the dispatcher does not know
    #[error("handshake rejected: unknown stream id {stream_id}")]
    HandshakeRejected { stream_id: StreamId },

    /// No write completed within the session deadline
    #[error("session {session_id} timed out after {timeout_ms}ms")]
    SessionTimeout { session_id: u64, timeout_ms: u64 },

    /// Read/write/accept failure from the transport
    #[error("io failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// Frame violated the wire format
    #[error("malformed frame: {message}")]
    MalformedFrame { message: String },

    // ===== Subscription Errors =====
    /// Unsubscribe on a token that has no subscription
    #[error("no subscription for token {token}")]
    SubscriptionNotFound { token: String },

    /// Token bytes or text could not be decoded
    #[error("invalid token: {message}")]
    InvalidToken { message: String },

    // ===== Runtime Errors =====
    /// I/O service has not been started
    #[error("io service '{name}' is not running")]
    RuntimeNotRunning { name: String },

    /// I/O service has been stopped and cannot be restarted
    #[error("io service '{name}' has been stopped")]
    RuntimeStopped { name: String },

    // ===== Configuration Errors =====
    /// Configuration parse error
    #[error("config parse error: {message}")]
    ConfigParse {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration validation error
    #[error("config validation error at '{field}': {message}")]
    ConfigValidation { field: String, message: String },
}

impl StreamingError {
    /// Create malformed frame error
    pub fn malformed_frame(message: impl Into<String>) -> Self {
        Self::MalformedFrame {
            message: message.into(),
        }
    }

    /// Create invalid token error
    pub fn invalid_token(message: impl Into<String>) -> Self {
        Self::InvalidToken {
            message: message.into(),
        }
    }

    /// Create runtime-not-running error
    pub fn not_running(name: impl Into<String>) -> Self {
        Self::RuntimeNotRunning { name: name.into() }
    }

    /// Create configuration parse error
    pub fn config_parse(message: impl Into<String>) -> Self {
        Self::ConfigParse {
            message: message.into(),
            source: None,
        }
    }

    /// Create configuration validation error
    pub fn config_validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Whether this error ends a single session without affecting others
    pub fn is_session_local(&self) -> bool {
        matches!(
            self,
            Self::HandshakeRejected { .. }
                | Self::SessionTimeout { .. }
                | Self::IoFailure(_)
                | Self::MalformedFrame { .. }
        )
    }
}
