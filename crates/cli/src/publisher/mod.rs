//! Synthetic frame publisher for the `serve` command.
//!
//! Every payload starts with the little-endian frame sequence number so
//! subscribers can detect gaps; the rest is filler.

mod stats;

pub use stats::PublishStats;

use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use dispatcher::Stream;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Bytes of sequence number at the start of each payload
pub const SEQUENCE_SIZE: usize = 8;

/// Publisher configuration
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Frames per stream per second
    pub rate_hz: f64,

    /// Payload size in bytes
    pub payload_size: usize,

    /// Frames per stream before stopping (None = unlimited)
    pub max_frames: Option<u64>,
}

/// Writes synthetic frames to a set of streams at a fixed rate
pub struct Publisher {
    streams: Vec<Stream>,
    config: PublisherConfig,
    stats: PublishStats,
    started: Option<Instant>,
}

impl Publisher {
    pub fn new(streams: Vec<Stream>, config: PublisherConfig) -> Self {
        let stats = PublishStats {
            payload_size: config.payload_size.max(SEQUENCE_SIZE),
            streams: streams.len(),
            ..Default::default()
        };
        Self {
            streams,
            config,
            stats,
            started: None,
        }
    }

    /// Publish until `max_frames` is reached
    ///
    /// Cancel-safe: counters stay accurate if the future is dropped.
    pub async fn run(&mut self) {
        self.started.get_or_insert_with(Instant::now);

        let period = Duration::from_secs_f64(1.0 / self.config.rate_hz.max(f64::EPSILON));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            streams = self.streams.len(),
            rate_hz = self.config.rate_hz,
            payload_size = self.stats.payload_size,
            "Publishing"
        );

        let mut sequence: u64 = 0;
        loop {
            if self.config.max_frames.is_some_and(|max| sequence >= max) {
                info!(frames = sequence, "Frame limit reached");
                return;
            }
            ticker.tick().await;

            let payload = synthetic_payload(sequence, self.stats.payload_size);
            for stream in &self.streams {
                let queued = stream.write(payload.clone());
                self.stats.frames_published += 1;
                self.stats.deliveries_queued += queued as u64;
                if queued == 0 {
                    self.stats.writes_unobserved += 1;
                }
            }

            sequence += 1;
            if sequence.is_multiple_of(100) {
                debug!(frames = sequence, "Publisher progress");
            }
        }
    }

    /// Streams being published to
    pub fn streams(&self) -> &[Stream] {
        &self.streams
    }

    /// Final statistics; `sessions` is filled in by the caller
    pub fn finish(mut self) -> PublishStats {
        self.stats.duration = self
            .started
            .map(|started| started.elapsed())
            .unwrap_or_default();
        self.stats
    }
}

/// Build a payload of `size` bytes carrying `sequence`
pub fn synthetic_payload(sequence: u64, size: usize) -> Bytes {
    let size = size.max(SEQUENCE_SIZE);
    let mut buf = BytesMut::with_capacity(size);
    buf.put_u64_le(sequence);
    buf.put_bytes((sequence % 251) as u8, size - SEQUENCE_SIZE);
    buf.freeze()
}

/// Read the sequence number from a synthetic payload
pub fn payload_sequence(payload: &[u8]) -> Option<u64> {
    let head: [u8; SEQUENCE_SIZE] = payload.get(..SEQUENCE_SIZE)?.try_into().ok()?;
    Some(u64::from_le_bytes(head))
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatcher::Dispatcher;
    use std::sync::Arc;

    #[test]
    fn test_synthetic_payload() {
        let payload = synthetic_payload(42, 64);
        assert_eq!(payload.len(), 64);
        assert_eq!(payload_sequence(&payload), Some(42));
        assert!(payload[SEQUENCE_SIZE..].iter().all(|b| *b == 42));
    }

    #[test]
    fn test_payload_minimum_size() {
        let payload = synthetic_payload(1, 2);
        assert_eq!(payload.len(), SEQUENCE_SIZE);
        assert_eq!(payload_sequence(&payload[..4]), None);
    }

    #[tokio::test]
    async fn test_publisher_stops_at_limit() {
        let dispatcher = Arc::new(Dispatcher::new("127.0.0.1:2001".parse().unwrap()));
        let streams = vec![dispatcher.make_stream(), dispatcher.make_stream()];
        let mut publisher = Publisher::new(
            streams,
            PublisherConfig {
                rate_hz: 100.0,
                payload_size: 16,
                max_frames: Some(5),
            },
        );

        publisher.run().await;
        assert_eq!(publisher.streams().len(), 2);

        let stats = publisher.finish();
        assert_eq!(stats.frames_published, 10);
        assert_eq!(stats.writes_unobserved, 10);
        assert_eq!(stats.deliveries_queued, 0);
    }
}
