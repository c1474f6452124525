//! Subscriber error types

use std::net::SocketAddr;

use contracts::StreamingError;
use thiserror::Error;

/// Subscriber errors
#[derive(Debug, Error)]
pub enum SubscriberError {
    /// Producer endpoint refused or failed the connection
    #[error("failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Producer endpoint did not accept within the connect timeout
    #[error("connecting to {endpoint} timed out after {timeout_ms}ms")]
    ConnectTimeout { endpoint: SocketAddr, timeout_ms: u64 },

    /// Streaming contract error
    #[error("streaming error: {0}")]
    Contract(#[from] StreamingError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl SubscriberError {
    /// Create a connect error
    pub fn connect(endpoint: SocketAddr, source: std::io::Error) -> Self {
        Self::Connect { endpoint, source }
    }
}

/// Subscriber Result alias
pub type Result<T> = std::result::Result<T, SubscriberError>;
