//! # Contracts
//!
//! Frozen interface contracts shared by the producer (`dispatcher`) and the
//! subscriber (`subscriber`) crates. All business crates depend on this
//! crate, reverse dependencies are prohibited.
//!
//! ## Wire model
//! - A [`Token`] names one stream on one producer endpoint
//! - Connections carry length-prefixed frames ([`frame`])
//! - Payloads are opaque [`Buffer`]s

mod config;
mod error;
pub mod frame;
mod runtime;
mod token;

pub use config::*;
pub use error::*;
pub use runtime::{IoContext, IoService, SHUTDOWN_GRACE};
pub use token::{StreamId, Token, TOKEN_SIZE};

/// Opaque payload carried by a stream
pub type Buffer = bytes::Bytes;
