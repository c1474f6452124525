//! Client - subscriber registry
//!
//! Keeps one connection per subscribed token. Callbacks run on the client's
//! I/O workers, never on the thread that called `subscribe`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use contracts::{Buffer, ClientConfig, IoService, StreamingError, Token};
use tokio::runtime::Handle;
use tracing::{debug, info, instrument};

use crate::connection;
use crate::error::Result;
use crate::subscription::{FrameCallback, Subscription, SubscriptionEntry};

/// Subscriber registry and its I/O service
pub struct Client {
    config: ClientConfig,
    io: IoService,
    subscriptions: Mutex<HashMap<Token, Arc<SubscriptionEntry>>>,
    next_id: AtomicU64,
}

impl Client {
    /// Create an idle client; call `async_run` before subscribing
    pub fn new(config: ClientConfig) -> Self {
        Self::build(config, IoService::new("stream-client"))
    }

    /// Create a client that runs its connections on an existing runtime
    pub fn with_handle(config: ClientConfig, handle: Handle) -> Self {
        Self::build(config, IoService::from_handle("stream-client", handle))
    }

    fn build(config: ClientConfig, io: IoService) -> Self {
        Self {
            config,
            io,
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start an owned runtime with `worker_threads` workers
    ///
    /// # Errors
    /// Runtime construction failure, or the client was stopped.
    pub fn async_run(&self, worker_threads: usize) -> Result<()> {
        self.io.async_run(worker_threads)?;
        Ok(())
    }

    /// Start with the configured number of worker threads
    pub fn run(&self) -> Result<()> {
        self.async_run(self.config.worker_threads)
    }

    /// Subscribe `callback` to the stream named by `token`
    ///
    /// Returns immediately; connecting and the handshake happen on a worker.
    /// Subscribing a token again replaces the previous subscription.
    ///
    /// # Errors
    /// [`StreamingError::RuntimeNotRunning`] before `async_run`, or
    /// [`StreamingError::RuntimeStopped`] after `stop`.
    #[instrument(name = "client_subscribe", skip(self, callback), fields(token = ?token))]
    pub fn subscribe<F>(&self, token: Token, callback: F) -> Result<Subscription>
    where
        F: Fn(Buffer) + Send + Sync + 'static,
    {
        let ctx = self.io.context()?;
        let callback: FrameCallback = Arc::new(callback);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let entry = Arc::new(SubscriptionEntry::new(id, token, callback));

        let (previous, active) = {
            let mut subscriptions = self.lock();
            let previous = subscriptions.insert(token, Arc::clone(&entry));
            (previous, subscriptions.len())
        };
        if let Some(previous) = previous {
            previous.cancel();
            info!(replaced = previous.id(), "Subscription replaced");
        }

        let task = ctx.spawn(connection::run(Arc::clone(&entry), self.config.clone()));
        entry.attach(task);

        observability::record_subscriptions(active);
        debug!(subscription_id = id, "Subscribed");
        Ok(Subscription::new(entry))
    }

    /// Stop delivering `token` and close its connection
    ///
    /// Returns false for a token that is not subscribed. A callback running
    /// on a worker is allowed to finish before this returns; none starts
    /// afterwards.
    #[instrument(name = "client_unsubscribe", skip(self), fields(token = ?token))]
    pub fn unsubscribe(&self, token: &Token) -> bool {
        let (removed, active) = {
            let mut subscriptions = self.lock();
            let removed = subscriptions.remove(token);
            (removed, subscriptions.len())
        };

        match removed {
            Some(entry) => {
                entry.cancel();
                observability::record_subscriptions(active);
                debug!(subscription_id = entry.id(), "Unsubscribed");
                true
            }
            None => {
                let err = StreamingError::SubscriptionNotFound {
                    token: token.to_string(),
                };
                debug!(error = %err, "Ignoring unsubscribe");
                false
            }
        }
    }

    /// Number of subscribed tokens
    pub fn subscription_count(&self) -> usize {
        self.lock().len()
    }

    pub fn is_subscribed(&self, token: &Token) -> bool {
        self.lock().contains_key(token)
    }

    pub fn is_running(&self) -> bool {
        self.io.is_running()
    }

    /// Unsubscribe everything and stop the I/O service; idempotent
    pub fn stop(&self) {
        let entries: Vec<_> = self.lock().drain().map(|(_, entry)| entry).collect();
        for entry in &entries {
            entry.cancel();
        }
        if !entries.is_empty() {
            observability::record_subscriptions(0);
            info!(subscriptions = entries.len(), "Client unsubscribed all");
        }
        self.io.stop();
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Token, Arc<SubscriptionEntry>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}
