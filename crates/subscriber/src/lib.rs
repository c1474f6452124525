//! # Subscriber
//!
//! Consumer side of the streaming transport.
//!
//! A [`Client`] subscribes callbacks to [`Token`]s. Each subscription opens
//! its own connection to the producer named in the token, sends the
//! handshake and then invokes the callback once per received frame.

mod client;
mod connection;
pub mod error;
mod subscription;

pub use client::Client;
pub use contracts::{Buffer, ClientConfig, Token};
pub use error::{Result, SubscriberError};
pub use subscription::{FrameCallback, Subscription};
