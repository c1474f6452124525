//! Server - producer endpoint
//!
//! Binds a listener, owns the [`Dispatcher`] and accepts subscriber
//! connections on an [`IoService`]. Accepting starts with `async_run`
//! (owned runtime) or immediately with `with_handle` (borrowed runtime).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use contracts::{IoContext, IoService, ServerConfig};
use tokio::net::TcpListener;
use tokio::runtime::Handle;
use tracing::{debug, error, info, instrument};

use crate::dispatcher::Dispatcher;
use crate::error::DispatcherError;
use crate::session::{serve_connection, SessionId};
use crate::stream::Stream;

/// Pause after a failed accept before retrying
const ACCEPT_BACKOFF: Duration = Duration::from_millis(10);

/// Producer endpoint: listener, dispatcher and I/O service
pub struct Server {
    config: ServerConfig,
    io: IoService,
    dispatcher: Arc<Dispatcher>,
    listener: Mutex<Option<StdTcpListener>>,
    local_addr: SocketAddr,
    next_session_id: Arc<AtomicU64>,
}

impl Server {
    /// Bind the listener; no connection is accepted until `async_run`
    ///
    /// # Errors
    /// [`DispatcherError::Bind`] if the address cannot be bound.
    #[instrument(name = "server_new", skip(config), fields(bind = %config.bind_addr))]
    pub fn new(config: ServerConfig) -> Result<Self, DispatcherError> {
        Self::build(config, IoService::new("stream-server"))
    }

    /// Bind the listener and start accepting on an existing runtime
    ///
    /// # Errors
    /// [`DispatcherError::Bind`] if the address cannot be bound.
    pub fn with_handle(config: ServerConfig, handle: Handle) -> Result<Self, DispatcherError> {
        let server = Self::build(config, IoService::from_handle("stream-server", handle))?;
        let ctx = server.io.context()?;
        server.start_accepting(&ctx);
        Ok(server)
    }

    fn build(config: ServerConfig, io: IoService) -> Result<Self, DispatcherError> {
        let listener = StdTcpListener::bind(config.bind_addr)
            .map_err(|e| DispatcherError::bind(config.bind_addr, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| DispatcherError::bind(config.bind_addr, e))?;
        let local_addr = listener.local_addr()?;

        let endpoint = advertised_endpoint(&config, local_addr);
        let dispatcher = Arc::new(Dispatcher::with_config(endpoint, &config));
        info!(%local_addr, %endpoint, "Stream server bound");

        Ok(Self {
            config,
            io,
            dispatcher,
            listener: Mutex::new(Some(listener)),
            local_addr,
            next_session_id: Arc::new(AtomicU64::new(1)),
        })
    }

    /// Start an owned runtime with `worker_threads` workers and accept
    ///
    /// Calling this again on a running server is a no-op.
    ///
    /// # Errors
    /// Runtime construction failure, or the server was stopped.
    pub fn async_run(&self, worker_threads: usize) -> Result<(), DispatcherError> {
        let ctx = self.io.async_run(worker_threads)?;
        self.start_accepting(&ctx);
        Ok(())
    }

    /// Start with the configured number of worker threads
    pub fn run(&self) -> Result<(), DispatcherError> {
        self.async_run(self.config.worker_threads)
    }

    fn start_accepting(&self, ctx: &IoContext) {
        let Some(listener) = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        else {
            debug!("Accept loop already running");
            return;
        };

        let accept = AcceptLoop {
            ctx: ctx.clone(),
            dispatcher: Arc::downgrade(&self.dispatcher),
            next_session_id: Arc::clone(&self.next_session_id),
            handshake_timeout: self.config.handshake_timeout(),
            tcp_nodelay: self.config.tcp_nodelay,
        };
        ctx.spawn(accept.run(listener));
    }

    /// Allocate a new stream on this server
    pub fn make_stream(&self) -> Stream {
        self.dispatcher.make_stream()
    }

    /// Change the liveness timeout of current and future sessions
    pub fn set_timeout(&self, timeout: Duration) {
        self.dispatcher.set_timeout(timeout);
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoint written into tokens
    pub fn endpoint(&self) -> SocketAddr {
        self.dispatcher.endpoint()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn is_running(&self) -> bool {
        self.io.is_running()
    }

    /// Stop accepting, close every session and shut the I/O service down
    ///
    /// Idempotent. Streams stay valid; their writes become no-ops once the
    /// server is dropped.
    pub fn stop(&self) {
        if self.io.is_running() {
            info!(local_addr = %self.local_addr, "Stopping stream server");
        }
        self.io.stop();
        self.dispatcher.clear();
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

struct AcceptLoop {
    ctx: IoContext,
    dispatcher: Weak<Dispatcher>,
    next_session_id: Arc<AtomicU64>,
    handshake_timeout: Duration,
    tcp_nodelay: bool,
}

impl AcceptLoop {
    #[instrument(name = "server_accept_loop", skip_all)]
    async fn run(self, listener: StdTcpListener) {
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "Failed to register listener");
                return;
            }
        };
        info!("Accepting subscribers");

        loop {
            let (socket, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            };

            if self.dispatcher.strong_count() == 0 {
                return;
            }
            if let Err(e) = socket.set_nodelay(self.tcp_nodelay) {
                debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
            }

            let session_id: SessionId = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            debug!(%peer, session_id, "Connection accepted");
            self.ctx.spawn(serve_connection(
                socket,
                peer,
                session_id,
                self.dispatcher.clone(),
                self.handshake_timeout,
            ));
        }
    }
}

fn advertised_endpoint(config: &ServerConfig, local_addr: SocketAddr) -> SocketAddr {
    let host = match config.advertised_host {
        Some(host) => host,
        None if local_addr.ip().is_unspecified() => match local_addr.ip() {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
        },
        None => local_addr.ip(),
    };
    SocketAddr::new(host, local_addr.port())
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::frame::{read_frame, write_frame, write_handshake};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn loopback_config() -> ServerConfig {
        ServerConfig::with_addr("127.0.0.1:0".parse().unwrap())
    }

    async fn wait_for_subscribers(stream: &Stream, expected: usize) {
        for _ in 0..200 {
            if stream.subscriber_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "expected {expected} subscribers, have {}",
            stream.subscriber_count()
        );
    }

    #[test]
    fn test_advertised_endpoint() {
        let local: SocketAddr = "0.0.0.0:4000".parse().unwrap();
        let config = ServerConfig::default();
        assert_eq!(
            advertised_endpoint(&config, local),
            "127.0.0.1:4000".parse().unwrap()
        );

        let config = ServerConfig::default().advertised_host("10.1.2.3".parse().unwrap());
        assert_eq!(
            advertised_endpoint(&config, local),
            "10.1.2.3:4000".parse().unwrap()
        );

        let bound: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        assert_eq!(advertised_endpoint(&ServerConfig::default(), bound), bound);
    }

    #[test]
    fn test_bind_conflict() {
        let first = Server::new(loopback_config()).unwrap();
        let err = Server::new(ServerConfig::with_addr(first.local_addr())).err();
        assert!(matches!(err, Some(DispatcherError::Bind { .. })));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_subscriber_receives_frames() {
        let server = Server::with_handle(loopback_config(), Handle::current()).unwrap();
        let stream = server.make_stream();

        let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
        write_handshake(&mut socket, stream.stream_id()).await.unwrap();
        wait_for_subscribers(&stream, 1).await;

        assert_eq!(stream.write(&b"first"[..]), 1);
        assert_eq!(stream.write(&b"second"[..]), 1);

        let first = read_frame(&mut socket, 1024).await.unwrap().unwrap();
        let second = read_frame(&mut socket, 1024).await.unwrap().unwrap();
        assert_eq!(first, "first");
        assert_eq!(second, "second");

        drop(socket);
        wait_for_subscribers(&stream, 0).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unknown_stream_closes_connection() {
        let server = Server::with_handle(loopback_config(), Handle::current()).unwrap();

        let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
        write_handshake(&mut socket, 9999).await.unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert_eq!(server.dispatcher().session_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_malformed_handshake_closes_connection() {
        let server = Server::with_handle(loopback_config(), Handle::current()).unwrap();

        let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
        write_frame(&mut socket, b"abc").await.unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_silent_connection_dropped_after_handshake_timeout() {
        let mut config = loopback_config();
        config.handshake_timeout_ms = 100;
        let server = Server::with_handle(config, Handle::current()).unwrap();
        let _stream = server.make_stream();

        let started = std::time::Instant::now();
        let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(server.dispatcher().session_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_closes_sessions() {
        let server = Server::with_handle(loopback_config(), Handle::current()).unwrap();
        let stream = server.make_stream();

        let mut socket = TcpStream::connect(server.local_addr()).await.unwrap();
        write_handshake(&mut socket, stream.stream_id()).await.unwrap();
        wait_for_subscribers(&stream, 1).await;

        server.stop();
        assert_eq!(stream.subscriber_count(), 0);
        assert!(!server.is_running());

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(2), socket.read(&mut buf))
            .await
            .unwrap();
        assert!(matches!(read, Ok(0) | Err(_)));
    }
}
