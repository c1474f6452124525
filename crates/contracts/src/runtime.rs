//! IoService - execution context for server and client I/O
//!
//! Wraps a tokio runtime with an explicit stop-and-join lifecycle. A service
//! either owns a multi-thread runtime (`async_run`) or borrows the handle of
//! an application runtime (`from_handle`). Every task spawned through an
//! [`IoContext`] is cancelled when the service stops.

use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::MIN_WORKER_THREADS;
use crate::StreamingError;

/// How long an owned runtime may take to drain on stop
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

enum State {
    Idle,
    Owned(Runtime),
    Borrowed(Handle),
    Stopped,
}

/// Named I/O execution context
pub struct IoService {
    name: String,
    state: Mutex<State>,
    shutdown: watch::Sender<bool>,
}

impl IoService {
    /// Create an idle service; call [`IoService::async_run`] to start it
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_state(name.into(), State::Idle)
    }

    /// Create a service that spawns onto an existing runtime
    pub fn from_handle(name: impl Into<String>, handle: Handle) -> Self {
        Self::with_state(name.into(), State::Borrowed(handle))
    }

    fn with_state(name: String, state: State) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            name,
            state: Mutex::new(state),
            shutdown,
        }
    }

    /// Service name (used for thread names and logs)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Start an owned runtime with `worker_threads` workers
    ///
    /// The worker count is raised to [`MIN_WORKER_THREADS`]. Calling this on a
    /// running service is a no-op.
    ///
    /// # Errors
    /// Runtime construction failure, or the service was already stopped.
    pub fn async_run(&self, worker_threads: usize) -> Result<IoContext, StreamingError> {
        {
            let mut state = self.lock();
            match &*state {
                State::Idle => {
                    let threads = worker_threads.max(MIN_WORKER_THREADS);
                    let runtime = Builder::new_multi_thread()
                        .worker_threads(threads)
                        .thread_name(format!("{}-io", self.name))
                        .enable_all()
                        .build()?;
                    info!(service = %self.name, threads, "I/O service started");
                    *state = State::Owned(runtime);
                }
                State::Owned(_) | State::Borrowed(_) => {
                    debug!(service = %self.name, "I/O service already running");
                }
                State::Stopped => {
                    return Err(StreamingError::RuntimeStopped {
                        name: self.name.clone(),
                    })
                }
            }
        }
        self.context()
    }

    /// Get a spawning context for the running service
    pub fn context(&self) -> Result<IoContext, StreamingError> {
        let handle = match &*self.lock() {
            State::Owned(runtime) => runtime.handle().clone(),
            State::Borrowed(handle) => handle.clone(),
            State::Idle => return Err(StreamingError::not_running(&self.name)),
            State::Stopped => {
                return Err(StreamingError::RuntimeStopped {
                    name: self.name.clone(),
                })
            }
        };

        Ok(IoContext {
            handle,
            shutdown: self.shutdown.subscribe(),
        })
    }

    /// Whether tasks can currently be spawned
    pub fn is_running(&self) -> bool {
        matches!(&*self.lock(), State::Owned(_) | State::Borrowed(_))
    }

    /// Cancel all spawned tasks and shut an owned runtime down
    ///
    /// Idempotent. Blocks for at most [`SHUTDOWN_GRACE`] when called outside
    /// of an async context.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock(), State::Stopped);
        self.shutdown.send_replace(true);

        match previous {
            State::Owned(runtime) => {
                if Handle::try_current().is_ok() {
                    runtime.shutdown_background();
                } else {
                    runtime.shutdown_timeout(SHUTDOWN_GRACE);
                }
                info!(service = %self.name, "I/O service stopped");
            }
            State::Borrowed(_) => {
                debug!(service = %self.name, "I/O service detached from runtime");
            }
            State::Idle | State::Stopped => {}
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for IoService {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Cloneable spawner bound to a running [`IoService`]
#[derive(Clone)]
pub struct IoContext {
    handle: Handle,
    shutdown: watch::Receiver<bool>,
}

impl IoContext {
    /// Spawn a task that is dropped when the owning service stops
    pub fn spawn<F>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let shutdown = self.shutdown.clone();
        self.handle.spawn(async move {
            tokio::select! {
                _ = future => {}
                _ = wait_stopped(shutdown) => {}
            }
        })
    }

    /// Runtime handle
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Whether the owning service has been stopped
    pub fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }
}

async fn wait_stopped(mut shutdown: watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
