//! Streaming metrics
//!
//! Thin recording helpers over the `metrics` facade plus an in-memory
//! delivery aggregator for printing summaries.

use std::collections::HashMap;
use std::time::Instant;

use metrics::{counter, gauge, histogram};

/// Record a stream id allocation
pub fn record_stream_created() {
    counter!("carla_streaming_streams_created_total").increment(1);
}

/// Record a session accepted into a subscriber set
pub fn record_session_opened() {
    counter!("carla_streaming_sessions_opened_total").increment(1);
}

/// Record a session leaving its subscriber set
///
/// `reason` is a short static label such as `peer_closed` or `timeout`.
pub fn record_session_closed(reason: &'static str) {
    counter!("carla_streaming_sessions_closed_total", "reason" => reason).increment(1);
}

/// Record the number of sessions currently registered
pub fn record_active_sessions(active: usize) {
    gauge!("carla_streaming_sessions_active").set(active as f64);
}

/// Record a rejected handshake
pub fn record_handshake_rejected() {
    counter!("carla_streaming_handshakes_rejected_total").increment(1);
}

/// Record one frame fully written to a subscriber
pub fn record_frame_written(bytes: usize) {
    counter!("carla_streaming_frames_written_total").increment(1);
    counter!("carla_streaming_bytes_written_total").increment(bytes as u64);
}

/// Record one frame dropped because a session queue was full
pub fn record_frame_dropped() {
    counter!("carla_streaming_frames_dropped_total").increment(1);
}

/// Record a broadcast and the number of sessions it reached
pub fn record_broadcast(fanout: usize) {
    counter!("carla_streaming_broadcasts_total").increment(1);
    histogram!("carla_streaming_broadcast_fanout").record(fanout as f64);
}

/// Record one frame received by a subscriber
pub fn record_frame_received(bytes: usize) {
    counter!("carla_streaming_frames_received_total").increment(1);
    histogram!("carla_streaming_frame_size_bytes").record(bytes as f64);
}

/// Record the current number of client subscriptions
pub fn record_subscriptions(active: usize) {
    gauge!("carla_streaming_subscriptions_active").set(active as f64);
}

/// Record a subscriber connection that ended with an error
pub fn record_subscriber_error() {
    counter!("carla_streaming_subscriber_errors_total").increment(1);
}

/// Per-stream delivery aggregator
///
/// Keyed by an arbitrary label (usually the token text).
#[derive(Debug, Clone, Default)]
pub struct DeliveryAggregator {
    streams: HashMap<String, StreamDelivery>,
}

#[derive(Debug, Clone, Default)]
struct StreamDelivery {
    frames: u64,
    bytes: u64,
    sizes: RunningStats,
    gaps_ms: RunningStats,
    last_at: Option<Instant>,
}

impl DeliveryAggregator {
    /// Create an empty aggregator
    pub fn new() -> Self {
        Self::default()
    }

    /// Account one received frame
    pub fn update(&mut self, label: &str, bytes: usize, at: Instant) {
        let entry = self.streams.entry(label.to_string()).or_default();
        entry.frames += 1;
        entry.bytes += bytes as u64;
        entry.sizes.push(bytes as f64);
        if let Some(last) = entry.last_at {
            entry
                .gaps_ms
                .push(at.saturating_duration_since(last).as_secs_f64() * 1000.0);
        }
        entry.last_at = Some(at);
    }

    /// Frames received under `label`
    pub fn frames(&self, label: &str) -> u64 {
        self.streams.get(label).map_or(0, |s| s.frames)
    }

    /// Frames received across all labels
    pub fn total_frames(&self) -> u64 {
        self.streams.values().map(|s| s.frames).sum()
    }

    /// Build a summary report
    pub fn summary(&self) -> DeliverySummary {
        let mut streams: Vec<StreamSummary> = self
            .streams
            .iter()
            .map(|(label, s)| StreamSummary {
                label: label.clone(),
                frames: s.frames,
                bytes: s.bytes,
                frame_size: StatsSummary::from(&s.sizes),
                gap_ms: StatsSummary::from(&s.gaps_ms),
            })
            .collect();
        streams.sort_by(|a, b| a.label.cmp(&b.label));

        DeliverySummary {
            total_frames: self.total_frames(),
            total_bytes: self.streams.values().map(|s| s.bytes).sum(),
            streams,
        }
    }

    /// Reset all statistics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Delivery summary across streams
#[derive(Debug, Clone, Default)]
pub struct DeliverySummary {
    pub total_frames: u64,
    pub total_bytes: u64,
    pub streams: Vec<StreamSummary>,
}

/// Delivery summary of one stream
#[derive(Debug, Clone)]
pub struct StreamSummary {
    pub label: String,
    pub frames: u64,
    pub bytes: u64,
    pub frame_size: StatsSummary,
    pub gap_ms: StatsSummary,
}

impl std::fmt::Display for DeliverySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== Delivery Summary ===")?;
        writeln!(f, "Total frames: {}", self.total_frames)?;
        writeln!(f, "Total bytes: {}", self.total_bytes)?;
        for stream in &self.streams {
            writeln!(f, "Stream {}:", stream.label)?;
            writeln!(f, "  frames: {} ({} bytes)", stream.frames, stream.bytes)?;
            writeln!(f, "  frame size (bytes): {}", stream.frame_size)?;
            writeln!(f, "  inter-arrival (ms): {}", stream.gap_ms)?;
        }
        Ok(())
    }
}

/// Statistics summary
#[derive(Debug, Clone, Default)]
pub struct StatsSummary {
    pub count: u64,
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub std_dev: f64,
}

impl From<&RunningStats> for StatsSummary {
    fn from(stats: &RunningStats) -> Self {
        Self {
            count: stats.count,
            min: stats.min,
            max: stats.max,
            mean: stats.mean(),
            std_dev: stats.std_dev(),
        }
    }
}

impl std::fmt::Display for StatsSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.count == 0 {
            write!(f, "N/A")
        } else {
            write!(
                f,
                "min={:.3}, max={:.3}, mean={:.3}, std={:.3} (n={})",
                self.min, self.max, self.mean, self.std_dev, self.count
            )
        }
    }
}

/// Online statistics (Welford's algorithm)
#[derive(Debug, Clone, Default)]
pub struct RunningStats {
    count: u64,
    mean: f64,
    m2: f64,
    min: f64,
    max: f64,
}

impl RunningStats {
    /// Add a sample
    pub fn push(&mut self, value: f64) {
        self.count += 1;

        if self.count == 1 {
            self.min = value;
            self.max = value;
            self.mean = value;
            self.m2 = 0.0;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);

            let delta = value - self.mean;
            self.mean += delta / self.count as f64;
            let delta2 = value - self.mean;
            self.m2 += delta * delta2;
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.mean
        }
    }

    /// Sample variance
    pub fn variance(&self) -> f64 {
        if self.count < 2 {
            0.0
        } else {
            self.m2 / (self.count - 1) as f64
        }
    }

    pub fn std_dev(&self) -> f64 {
        self.variance().sqrt()
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }
}
