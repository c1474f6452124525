//! Subscription state shared by the client registry and a connection task

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::{self, ThreadId};

use contracts::{Buffer, Token};
use tokio::task::JoinHandle;

/// Callback invoked once per received frame, on a worker thread
pub type FrameCallback = Arc<dyn Fn(Buffer) + Send + Sync>;

pub(crate) struct SubscriptionEntry {
    id: u64,
    token: Token,
    callback: FrameCallback,
    active: AtomicBool,
    connected: AtomicBool,
    delivered: AtomicU64,
    /// Held shared for the length of a callback, exclusively by `cancel`
    gate: RwLock<()>,
    delivering_on: Mutex<Option<ThreadId>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SubscriptionEntry {
    pub(crate) fn new(id: u64, token: Token, callback: FrameCallback) -> Self {
        Self {
            id,
            token,
            callback,
            active: AtomicBool::new(true),
            connected: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            gate: RwLock::new(()),
            delivering_on: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Release);
    }

    pub(crate) fn attach(&self, task: JoinHandle<()>) {
        let mut slot = self.task.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_active() {
            *slot = Some(task);
        } else {
            task.abort();
        }
    }

    /// Invoke the callback if still active; false once cancelled
    pub(crate) fn deliver(&self, buffer: Buffer) -> bool {
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        if !self.is_active() {
            return false;
        }
        let len = buffer.len();
        self.set_delivering_on(Some(thread::current().id()));
        (self.callback)(buffer);
        self.set_delivering_on(None);
        self.delivered.fetch_add(1, Ordering::Relaxed);
        observability::record_frame_received(len);
        true
    }

    /// Stop deliveries and abort the connection task; idempotent
    ///
    /// Blocks until a callback running on another thread returns. Called
    /// from inside the callback it returns at once.
    pub(crate) fn cancel(&self) {
        self.active.store(false, Ordering::Release);
        self.connected.store(false, Ordering::Release);
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }

        if self.delivering_on() != Some(thread::current().id()) {
            drop(self.gate.write().unwrap_or_else(PoisonError::into_inner));
        }
    }

    fn delivering_on(&self) -> Option<ThreadId> {
        *self
            .delivering_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_delivering_on(&self, thread: Option<ThreadId>) {
        *self
            .delivering_on
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = thread;
    }
}

/// Handle describing one subscription
///
/// Dropping it does not unsubscribe; use `Client::unsubscribe`.
#[derive(Clone)]
pub struct Subscription {
    entry: Arc<SubscriptionEntry>,
}

impl Subscription {
    pub(crate) fn new(entry: Arc<SubscriptionEntry>) -> Self {
        Self { entry }
    }

    pub fn token(&self) -> Token {
        self.entry.token
    }

    /// Frames delivered to the callback so far
    pub fn delivered(&self) -> u64 {
        self.entry.delivered.load(Ordering::Relaxed)
    }

    /// False after unsubscribe, replacement or client drop
    pub fn is_active(&self) -> bool {
        self.entry.is_active()
    }

    /// Whether the handshake completed and the connection is still open
    pub fn is_connected(&self) -> bool {
        self.entry.connected.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("token", &self.entry.token)
            .field("active", &self.is_active())
            .field("delivered", &self.delivered())
            .finish()
    }
}
