//! Streaming configuration contracts shared by server, client and loader.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::frame::{DEFAULT_MAX_FRAME_SIZE, HANDSHAKE_SIZE};

/// Default streaming port
pub const DEFAULT_STREAMING_PORT: u16 = 2001;

/// Fewest worker threads an I/O service runs with
///
/// The accept loop may occupy one worker, so a single worker could starve
/// completion processing.
pub const MIN_WORKER_THREADS: usize = 2;

/// Producer-side configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on (port 0 picks a free port)
    pub bind_addr: SocketAddr,

    /// Host written into tokens; defaults to the bind address, or loopback
    /// when binding the unspecified address
    pub advertised_host: Option<IpAddr>,

    /// Worker threads for an owned I/O service
    #[validate(range(min = 1, max = 1024))]
    pub worker_threads: usize,

    /// Longest a session may go without completing a write, in milliseconds
    #[validate(range(min = 1))]
    pub timeout_ms: u64,

    /// Deadline for the subscriber handshake, in milliseconds
    #[validate(range(min = 1))]
    pub handshake_timeout_ms: u64,

    /// Outbound frames buffered per session before dropping new ones
    #[validate(range(min = 1))]
    pub session_queue_capacity: usize,

    /// Enable TCP_NODELAY on accepted sockets
    pub tcp_nodelay: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_STREAMING_PORT)),
            advertised_host: None,
            worker_threads: MIN_WORKER_THREADS,
            timeout_ms: 10_000,
            handshake_timeout_ms: 5_000,
            session_queue_capacity: 512,
            tcp_nodelay: true,
        }
    }
}

impl ServerConfig {
    /// Create a config listening on `addr`
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            bind_addr: addr,
            ..Default::default()
        }
    }

    /// Set the session liveness timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = duration_to_ms(timeout);
        self
    }

    /// Set the worker thread count
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the per-session queue capacity
    pub fn session_queue_capacity(mut self, capacity: usize) -> Self {
        self.session_queue_capacity = capacity;
        self
    }

    /// Set the host advertised in tokens
    pub fn advertised_host(mut self, host: IpAddr) -> Self {
        self.advertised_host = Some(host);
        self
    }

    /// Session liveness timeout
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

/// Subscriber-side configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct ClientConfig {
    /// Worker threads for an owned I/O service
    #[validate(range(min = 1, max = 1024))]
    pub worker_threads: usize,

    /// Deadline for connecting to a producer, in milliseconds
    #[validate(range(min = 1))]
    pub connect_timeout_ms: u64,

    /// Largest frame accepted from a producer
    #[validate(range(min = 8))]
    pub max_frame_size: usize,

    /// Enable TCP_NODELAY on subscriber sockets
    pub tcp_nodelay: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            worker_threads: MIN_WORKER_THREADS,
            connect_timeout_ms: 5_000,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            tcp_nodelay: true,
        }
    }
}

impl ClientConfig {
    /// Set the worker thread count
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Set the largest accepted frame
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size.max(HANDSHAKE_SIZE);
        self
    }

    /// Connect timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Complete configuration file layout
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StreamingConfig {
    /// Producer settings
    #[validate(nested)]
    pub server: ServerConfig,

    /// Subscriber settings
    #[validate(nested)]
    pub client: ClientConfig,
}

fn duration_to_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = StreamingConfig::default();

        assert_eq!(config.server.bind_addr.port(), DEFAULT_STREAMING_PORT);
        assert_eq!(config.server.worker_threads, MIN_WORKER_THREADS);
        assert_eq!(config.server.session_timeout(), Duration::from_secs(10));
        assert!(config.server.tcp_nodelay);
        assert_eq!(config.client.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chaining() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = ServerConfig::with_addr(addr)
            .timeout(Duration::from_millis(250))
            .worker_threads(4)
            .session_queue_capacity(8)
            .advertised_host("10.0.0.5".parse().unwrap());

        assert_eq!(config.bind_addr, addr);
        assert_eq!(config.timeout_ms, 250);
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.session_queue_capacity, 8);
        assert_eq!(config.advertised_host, Some("10.0.0.5".parse().unwrap()));
    }

    #[test]
    fn test_sub_millisecond_timeout_rounds_up() {
        let config = ServerConfig::default().timeout(Duration::from_micros(10));
        assert_eq!(config.timeout_ms, 1);
    }

    #[test]
    fn test_max_frame_size_floor() {
        let config = ClientConfig::default().max_frame_size(1);
        assert_eq!(config.max_frame_size, HANDSHAKE_SIZE);
    }

    #[test]
    fn test_validation_rejects_zero_capacity() {
        let config = StreamingConfig {
            server: ServerConfig::default().session_queue_capacity(0),
            client: ClientConfig::default(),
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let json = r#"{ "server": { "timeout_ms": 1000 } }"#;
        let config: StreamingConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.server.timeout_ms, 1000);
        assert_eq!(config.server.session_queue_capacity, 512);
        assert_eq!(config.client.worker_threads, MIN_WORKER_THREADS);
    }
}
