//! Session - one subscriber connection on the producer side
//!
//! A session owns a bounded outbound queue and a single writer loop, so at
//! most one frame is in flight per connection and frames leave in FIFO
//! order. The session timeout is a liveness deadline: it restarts whenever a
//! write completes, and if it expires before the next completion the session
//! is closed. This catches both a stuck write and a connection that has gone
//! quiet. The read half is watched for EOF because subscribers never send
//! after the handshake.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use contracts::{frame, Buffer, StreamId, StreamingError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, instrument, trace, warn};

use crate::dispatcher::Dispatcher;
use crate::metrics::SessionMetrics;

/// Session identifier, unique per server
pub type SessionId = u64;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    /// Created from a handshake, not yet in a subscriber set
    Connecting = 0,
    /// In a subscriber set; frames flow
    Active = 1,
    /// Error, timeout or close requested; no new frames accepted
    Closing = 2,
    /// Removed from the dispatcher
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Closing,
            _ => Self::Closed,
        }
    }
}

/// Why a session ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Subscriber closed its side of the connection
    PeerClosed,
    /// Closed locally (dispatcher teardown or explicit close)
    Closed,
}

impl CloseReason {
    /// Metric label
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::Closed => "closed",
        }
    }
}

/// Producer-side state of one subscriber connection
///
/// Shared between the dispatcher's registry and the connection task, so a
/// removal never frees state the task still uses.
pub struct Session {
    id: SessionId,
    stream_id: StreamId,
    peer: SocketAddr,
    tx: mpsc::Sender<Buffer>,
    state: AtomicU8,
    timeout_ms: AtomicU64,
    close: Notify,
    metrics: SessionMetrics,
}

impl Session {
    /// Create a session in `Connecting` state and its queue receiver
    pub fn new(
        id: SessionId,
        stream_id: StreamId,
        peer: SocketAddr,
        queue_capacity: usize,
        timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<Buffer>) {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let session = Arc::new(Self {
            id,
            stream_id,
            peer,
            tx,
            state: AtomicU8::new(SessionState::Connecting as u8),
            timeout_ms: AtomicU64::new(duration_ms(timeout)),
            close: Notify::new(),
            metrics: SessionMetrics::new(),
        });
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn metrics(&self) -> &SessionMetrics {
        &self.metrics
    }

    /// Current liveness timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// Change the liveness timeout; the running deadline is recomputed from
    /// the last completed write
    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms.store(duration_ms(timeout), Ordering::Relaxed);
    }

    /// Move `Connecting -> Active`
    pub(crate) fn activate(&self) -> bool {
        self.state
            .compare_exchange(
                SessionState::Connecting as u8,
                SessionState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Advance the state; states never move backwards
    fn advance(&self, next: SessionState) {
        self.state.fetch_max(next as u8, Ordering::AcqRel);
    }

    /// Queue a frame without blocking
    ///
    /// Returns false if the session is not active or its queue is full, in
    /// which case the frame is dropped.
    pub fn enqueue(&self, buffer: Buffer) -> bool {
        if self.state() != SessionState::Active {
            return false;
        }

        match self.tx.try_send(buffer) {
            Ok(()) => {
                self.metrics
                    .set_queue_len(self.tx.max_capacity() - self.tx.capacity());
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.metrics.inc_dropped_count();
                observability::record_frame_dropped();
                if dropped.is_power_of_two() {
                    warn!(
                        session_id = self.id,
                        stream_id = self.stream_id,
                        dropped,
                        "Queue full, frame dropped"
                    );
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(session_id = self.id, "Session writer gone, frame dropped");
                false
            }
        }
    }

    /// Ask the connection task to stop; idempotent
    pub fn close(&self) {
        self.advance(SessionState::Closing);
        self.close.notify_one();
    }

    /// Writer loop: drains the queue until close, peer EOF, error or timeout
    ///
    /// The deadline starts when the loop starts and is pushed back after
    /// every completed write.
    pub async fn run<R, W>(
        &self,
        mut rx: mpsc::Receiver<Buffer>,
        mut reader: R,
        mut writer: W,
    ) -> Result<CloseReason, StreamingError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut scratch = [0u8; 64];
        let mut last_write = Instant::now();

        loop {
            if self.state() >= SessionState::Closing {
                return Ok(CloseReason::Closed);
            }

            let deadline = last_write + self.timeout();

            tokio::select! {
                biased;
                _ = self.close.notified() => return Ok(CloseReason::Closed),
                _ = tokio::time::sleep_until(deadline) => {
                    self.metrics.inc_failure_count();
                    return Err(self.timed_out());
                }
                read = reader.read(&mut scratch) => match read {
                    Ok(0) => return Ok(CloseReason::PeerClosed),
                    Ok(n) => trace!(session_id = self.id, bytes = n, "Ignoring subscriber data"),
                    Err(e) => return Err(e.into()),
                },
                next = rx.recv() => {
                    let Some(buffer) = next else {
                        return Ok(CloseReason::Closed);
                    };
                    self.metrics.set_queue_len(rx.len());
                    self.write_one(&mut writer, &buffer, deadline).await?;
                    last_write = Instant::now();
                }
            }
        }
    }

    async fn write_one<W>(
        &self,
        writer: &mut W,
        buffer: &Buffer,
        deadline: Instant,
    ) -> Result<(), StreamingError>
    where
        W: AsyncWrite + Unpin,
    {
        match tokio::time::timeout_at(deadline, frame::write_frame(writer, buffer)).await {
            Ok(Ok(())) => {
                self.metrics.inc_write_count();
                observability::record_frame_written(buffer.len());
                Ok(())
            }
            Ok(Err(e)) => {
                self.metrics.inc_failure_count();
                Err(e.into())
            }
            Err(_) => {
                self.metrics.inc_failure_count();
                Err(self.timed_out())
            }
        }
    }

    fn timed_out(&self) -> StreamingError {
        StreamingError::SessionTimeout {
            session_id: self.id,
            timeout_ms: duration_ms(self.timeout()),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Drive one accepted connection from handshake to close
#[instrument(name = "session", skip(socket, dispatcher), fields(peer = %peer))]
pub(crate) async fn serve_connection(
    socket: TcpStream,
    peer: SocketAddr,
    session_id: SessionId,
    dispatcher: Weak<Dispatcher>,
    handshake_timeout: Duration,
) {
    let (mut reader, writer) = socket.into_split();

    let stream_id =
        match tokio::time::timeout(handshake_timeout, frame::read_handshake(&mut reader)).await {
            Ok(Ok(stream_id)) => stream_id,
            Ok(Err(e)) => {
                observability::record_handshake_rejected();
                warn!(error = %e, "Malformed handshake, closing connection");
                return;
            }
            Err(_) => {
                observability::record_handshake_rejected();
                warn!(timeout_ms = duration_ms(handshake_timeout), "Handshake timed out");
                return;
            }
        };

    let (session, rx) = {
        let Some(dispatcher) = dispatcher.upgrade() else {
            debug!("Dispatcher gone, dropping connection");
            return;
        };
        let (session, rx) = Session::new(
            session_id,
            stream_id,
            peer,
            dispatcher.queue_capacity(),
            dispatcher.timeout(),
        );
        if let Err(e) = dispatcher.register_session(Arc::clone(&session)) {
            observability::record_handshake_rejected();
            warn!(error = %e, "Handshake rejected, closing connection");
            return;
        }
        (session, rx)
    };

    debug!(stream_id, "Session active");
    let result = session.run(rx, reader, writer).await;
    session.advance(SessionState::Closing);

    if let Some(dispatcher) = dispatcher.upgrade() {
        dispatcher.remove_session(stream_id, session_id);
    }
    session.advance(SessionState::Closed);

    match result {
        Ok(reason) => {
            debug!(stream_id, reason = reason.as_str(), "Session closed");
            observability::record_session_closed(reason.as_str());
        }
        Err(StreamingError::SessionTimeout { timeout_ms, .. }) => {
            warn!(stream_id, timeout_ms, "Session timed out, closing");
            observability::record_session_closed("timeout");
        }
        Err(e) => {
            debug!(stream_id, error = %e, "Session failed, closing");
            observability::record_session_closed("io_failure");
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use contracts::frame::{read_frame, DEFAULT_MAX_FRAME_SIZE};
    use tokio::io::{duplex, split};

    fn test_session(capacity: usize, timeout: Duration) -> (Arc<Session>, mpsc::Receiver<Buffer>) {
        Session::new(1, 7, "127.0.0.1:5000".parse().unwrap(), capacity, timeout)
    }

    #[test]
    fn test_state_transitions() {
        let (session, _rx) = test_session(4, Duration::from_secs(1));
        assert_eq!(session.state(), SessionState::Connecting);

        assert!(session.activate());
        assert_eq!(session.state(), SessionState::Active);
        assert!(!session.activate());

        session.close();
        assert_eq!(session.state(), SessionState::Closing);

        session.advance(SessionState::Closed);
        session.advance(SessionState::Active);
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_enqueue_requires_active() {
        let (session, mut rx) = test_session(4, Duration::from_secs(1));
        assert!(!session.enqueue(Bytes::from_static(b"early")));

        session.activate();
        assert!(session.enqueue(Bytes::from_static(b"on time")));
        assert_eq!(rx.try_recv().unwrap(), "on time");

        session.close();
        assert!(!session.enqueue(Bytes::from_static(b"late")));
    }

    #[test]
    fn test_full_queue_drops_newest() {
        let (session, mut rx) = test_session(2, Duration::from_secs(1));
        session.activate();

        assert!(session.enqueue(Bytes::from_static(b"1")));
        assert!(session.enqueue(Bytes::from_static(b"2")));
        assert!(!session.enqueue(Bytes::from_static(b"3")));

        assert_eq!(session.metrics().dropped_count(), 1);
        assert_eq!(session.metrics().queue_len(), 2);
        assert_eq!(rx.try_recv().unwrap(), "1");
        assert_eq!(rx.try_recv().unwrap(), "2");
    }

    #[tokio::test]
    async fn test_run_writes_frames_in_order() {
        let (session, rx) = test_session(16, Duration::from_secs(1));
        session.activate();

        let (local, mut remote) = duplex(4096);
        let (reader, writer) = split(local);

        for i in 0..5 {
            session.enqueue(Bytes::from(format!("frame {i}")));
        }

        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run(rx, reader, writer).await })
        };

        for i in 0..5 {
            let frame = read_frame(&mut remote, DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame, format!("frame {i}"));
        }

        session.close();
        let reason = runner.await.unwrap().unwrap();
        assert_eq!(reason, CloseReason::Closed);
        assert_eq!(session.metrics().write_count(), 5);
    }

    #[tokio::test]
    async fn test_run_detects_peer_close() {
        let (session, rx) = test_session(4, Duration::from_secs(1));
        session.activate();

        let (local, remote) = duplex(64);
        let (reader, writer) = split(local);
        drop(remote);

        let reason = session.run(rx, reader, writer).await.unwrap();
        assert_eq!(reason, CloseReason::PeerClosed);
    }

    #[tokio::test]
    async fn test_stalled_write_times_out() {
        let (session, rx) = test_session(4, Duration::from_millis(50));
        session.activate();

        // The peer never reads, so a write larger than the pipe stalls.
        let (local, _remote) = duplex(64);
        let (reader, writer) = split(local);
        session.enqueue(Bytes::from(vec![0u8; 4096]));

        let err = session.run(rx, reader, writer).await.unwrap_err();
        assert!(matches!(err, StreamingError::SessionTimeout { session_id: 1, .. }));
        assert_eq!(session.metrics().failure_count(), 1);
    }

    #[tokio::test]
    async fn test_idle_session_times_out_after_last_write() {
        let (session, rx) = test_session(4, Duration::from_millis(100));
        session.activate();

        let (local, mut remote) = duplex(4096);
        let (reader, writer) = split(local);
        session.enqueue(Bytes::from_static(b"last"));

        let started = Instant::now();
        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run(rx, reader, writer).await })
        };

        let frame = read_frame(&mut remote, DEFAULT_MAX_FRAME_SIZE)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, "last");

        let err = tokio::time::timeout(Duration::from_secs(2), runner)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, StreamingError::SessionTimeout { timeout_ms: 100, .. }));
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(session.metrics().write_count(), 1);
    }

    #[tokio::test]
    async fn test_writes_push_deadline_back() {
        let (session, rx) = test_session(4, Duration::from_millis(300));
        session.activate();

        let (local, mut remote) = duplex(4096);
        let (reader, writer) = split(local);
        let runner = {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.run(rx, reader, writer).await })
        };

        // Six writes 100ms apart span twice the timeout.
        for i in 0..6 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert!(session.enqueue(Bytes::from(format!("tick {i}"))));
            let frame = read_frame(&mut remote, DEFAULT_MAX_FRAME_SIZE)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(frame, format!("tick {i}"));
        }
        assert!(!runner.is_finished());

        session.close();
        assert_eq!(runner.await.unwrap().unwrap(), CloseReason::Closed);
    }

    #[test]
    fn test_set_timeout() {
        let (session, _rx) = test_session(4, Duration::from_secs(1));
        session.set_timeout(Duration::from_millis(250));
        assert_eq!(session.timeout(), Duration::from_millis(250));
    }
}
