//! # Dispatcher
//!
//! Producer side of the streaming transport.
//!
//! - [`Server`] binds a TCP endpoint and accepts subscribers
//! - [`Stream`] is the producer handle for one stream id
//! - [`Dispatcher`] maps stream ids to subscriber [`Session`]s and fans
//!   writes out without blocking producers

pub mod dispatcher;
pub mod error;
pub mod metrics;
pub mod server;
pub mod session;
pub mod stream;

pub use contracts::{Buffer, ServerConfig, StreamId, Token};
pub use dispatcher::Dispatcher;
pub use error::DispatcherError;
pub use metrics::{MetricsSnapshot, SessionMetrics};
pub use server::Server;
pub use session::{CloseReason, Session, SessionId, SessionState};
pub use stream::Stream;
