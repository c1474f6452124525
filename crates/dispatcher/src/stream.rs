//! Stream - producer handle for one stream id

use std::fmt;
use std::sync::Weak;

use contracts::{Buffer, StreamId, Token};

use crate::dispatcher::Dispatcher;

/// Cheap, cloneable producer handle
///
/// Holds only a weak reference to its dispatcher, so a stream may outlive
/// the server that created it. Writes after that point are silently
/// discarded.
#[derive(Clone)]
pub struct Stream {
    dispatcher: Weak<Dispatcher>,
    token: Token,
}

impl Stream {
    pub(crate) fn new(dispatcher: Weak<Dispatcher>, token: Token) -> Self {
        Self { dispatcher, token }
    }

    /// Token subscribers use to reach this stream
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn stream_id(&self) -> StreamId {
        self.token.stream_id()
    }

    /// Send `buffer` to every current subscriber
    ///
    /// Never blocks on network I/O. Returns the number of subscribers the
    /// buffer was queued for.
    pub fn write(&self, buffer: impl Into<Buffer>) -> usize {
        match self.dispatcher.upgrade() {
            Some(dispatcher) => dispatcher.write(self.stream_id(), buffer.into()),
            None => 0,
        }
    }

    /// Whether the owning server still exists
    pub fn is_alive(&self) -> bool {
        self.dispatcher.strong_count() > 0
    }

    /// Current number of subscribers, zero once the server is gone
    pub fn subscriber_count(&self) -> usize {
        self.dispatcher
            .upgrade()
            .map_or(0, |dispatcher| dispatcher.subscriber_count(self.stream_id()))
    }
}

impl fmt::Debug for Stream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("token", &self.token)
            .field("alive", &self.is_alive())
            .finish()
    }
}
