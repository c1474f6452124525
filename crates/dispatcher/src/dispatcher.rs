//! Dispatcher - stream registry and fan-out to sessions
//!
//! Maps each stream id to its current set of subscriber sessions. A write
//! snapshots the set under a read lock and enqueues outside of it, so a slow
//! session or a concurrent registration never blocks producers.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use contracts::{Buffer, ServerConfig, StreamId, StreamingError, Token};
use tracing::{debug, info, instrument, trace};

use crate::metrics::MetricsSnapshot;
use crate::session::{Session, SessionId};
use crate::stream::Stream;

type SessionSet = HashMap<SessionId, Arc<Session>>;

/// Stream registry for one server endpoint
pub struct Dispatcher {
    endpoint: SocketAddr,
    next_stream_id: AtomicU64,
    streams: RwLock<HashMap<StreamId, SessionSet>>,
    timeout_ms: AtomicU64,
    queue_capacity: usize,
}

impl Dispatcher {
    /// Create a dispatcher that advertises `endpoint` in its tokens
    pub fn new(endpoint: SocketAddr) -> Self {
        Self::with_config(endpoint, &ServerConfig::default())
    }

    /// Create a dispatcher with timeout and queue settings from `config`
    pub fn with_config(endpoint: SocketAddr, config: &ServerConfig) -> Self {
        Self {
            endpoint,
            next_stream_id: AtomicU64::new(1),
            streams: RwLock::new(HashMap::new()),
            timeout_ms: AtomicU64::new(config.timeout_ms.max(1)),
            queue_capacity: config.session_queue_capacity.max(1),
        }
    }

    /// Endpoint written into tokens
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Per-session queue capacity
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    /// Allocate a new stream id with an empty subscriber set
    ///
    /// Ids are unique and strictly increasing for the dispatcher's lifetime.
    pub fn make_stream(self: &Arc<Self>) -> Stream {
        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        self.write_streams().insert(stream_id, SessionSet::new());
        observability::record_stream_created();
        debug!(stream_id, "Stream created");

        Stream::new(Arc::downgrade(self), Token::new(self.endpoint, stream_id))
    }

    /// Add a handshaken session to the subscriber set of its stream
    ///
    /// The session picks up the current timeout and becomes active.
    ///
    /// # Errors
    /// [`StreamingError::HandshakeRejected`] if the stream id was never
    /// allocated here.
    #[instrument(name = "dispatcher_register_session", skip(self, session), fields(session_id = session.id()))]
    pub fn register_session(&self, session: Arc<Session>) -> Result<(), StreamingError> {
        let stream_id = session.stream_id();
        let total = {
            let mut streams = self.write_streams();
            let Some(sessions) = streams.get_mut(&stream_id) else {
                return Err(StreamingError::HandshakeRejected { stream_id });
            };

            session.set_timeout(self.timeout());
            session.activate();
            sessions.insert(session.id(), session);
            streams.values().map(HashMap::len).sum::<usize>()
        };

        observability::record_session_opened();
        observability::record_active_sessions(total);
        info!(stream_id, sessions = total, "Subscriber connected");
        Ok(())
    }

    /// Enqueue `buffer` on every current subscriber of `stream_id`
    ///
    /// Returns the number of sessions the buffer was queued on. Writing to a
    /// stream without subscribers, or to an unknown id, is a no-op.
    pub fn write(&self, stream_id: StreamId, buffer: Buffer) -> usize {
        let sessions: Vec<Arc<Session>> = match self.read_streams().get(&stream_id) {
            Some(sessions) if !sessions.is_empty() => sessions.values().cloned().collect(),
            _ => return 0,
        };

        let queued = sessions
            .iter()
            .filter(|session| session.enqueue(buffer.clone()))
            .count();

        observability::record_broadcast(queued);
        trace!(stream_id, fanout = sessions.len(), queued, "Broadcast");
        queued
    }

    /// Remove a session from its subscriber set
    ///
    /// Returns false if it was already gone.
    pub fn remove_session(&self, stream_id: StreamId, session_id: SessionId) -> bool {
        let (removed, total) = {
            let mut streams = self.write_streams();
            let removed = streams
                .get_mut(&stream_id)
                .and_then(|sessions| sessions.remove(&session_id));
            (removed, streams.values().map(HashMap::len).sum::<usize>())
        };

        match removed {
            Some(session) => {
                session.close();
                observability::record_active_sessions(total);
                info!(stream_id, session_id, sessions = total, "Subscriber removed");
                true
            }
            None => false,
        }
    }

    /// Session liveness timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Relaxed))
    }

    /// Change the session liveness timeout, including existing sessions
    pub fn set_timeout(&self, timeout: Duration) {
        let ms = u64::try_from(timeout.as_millis())
            .unwrap_or(u64::MAX)
            .max(1);
        self.timeout_ms.store(ms, Ordering::Relaxed);

        for sessions in self.read_streams().values() {
            for session in sessions.values() {
                session.set_timeout(timeout);
            }
        }
        debug!(timeout_ms = ms, "Session timeout updated");
    }

    /// Number of sessions subscribed to `stream_id`
    pub fn subscriber_count(&self, stream_id: StreamId) -> usize {
        self.read_streams().get(&stream_id).map_or(0, HashMap::len)
    }

    /// Whether `stream_id` was allocated by this dispatcher
    pub fn has_stream(&self, stream_id: StreamId) -> bool {
        self.read_streams().contains_key(&stream_id)
    }

    /// Number of allocated streams
    pub fn stream_count(&self) -> usize {
        self.read_streams().len()
    }

    /// Number of registered sessions across all streams
    pub fn session_count(&self) -> usize {
        self.read_streams().values().map(HashMap::len).sum()
    }

    /// Metrics of every session on `stream_id`
    pub fn session_metrics(&self, stream_id: StreamId) -> Vec<(SessionId, MetricsSnapshot)> {
        let mut snapshots: Vec<_> = self
            .read_streams()
            .get(&stream_id)
            .map(|sessions| {
                sessions
                    .iter()
                    .map(|(id, session)| (*id, session.metrics().snapshot()))
                    .collect()
            })
            .unwrap_or_default();
        snapshots.sort_by_key(|(id, _)| *id);
        snapshots
    }

    /// Close every session; allocated stream ids stay valid
    pub fn clear(&self) {
        let closed: Vec<Arc<Session>> = {
            let mut streams = self.write_streams();
            streams
                .values_mut()
                .flat_map(|sessions| sessions.drain().map(|(_, session)| session))
                .collect()
        };

        for session in &closed {
            session.close();
        }
        if !closed.is_empty() {
            observability::record_active_sessions(0);
            info!(sessions = closed.len(), "Dispatcher cleared");
        }
    }

    fn read_streams(&self) -> RwLockReadGuard<'_, HashMap<StreamId, SessionSet>> {
        self.streams.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_streams(&self) -> RwLockWriteGuard<'_, HashMap<StreamId, SessionSet>> {
        self.streams.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.clear();
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("endpoint", &self.endpoint)
            .field("streams", &self.stream_count())
            .field("sessions", &self.session_count())
            .finish()
    }
}
