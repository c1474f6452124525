//! Publisher statistics.

use std::time::Duration;

use dispatcher::MetricsSnapshot;

/// Statistics from a publishing run
#[derive(Debug, Clone, Default)]
pub struct PublishStats {
    /// Frames handed to `Stream::write`, across all streams
    pub frames_published: u64,

    /// Session enqueues those writes produced
    pub deliveries_queued: u64,

    /// Writes that found no subscriber
    pub writes_unobserved: u64,

    /// Payload bytes per frame
    pub payload_size: usize,

    /// Total duration of the run
    pub duration: Duration,

    /// Streams published to
    pub streams: usize,

    /// Per-session metrics at the end of the run, keyed by stream id
    pub sessions: Vec<(u64, u64, MetricsSnapshot)>,
}

impl PublishStats {
    /// Frames per second across all streams
    pub fn fps(&self) -> f64 {
        if self.duration.as_secs_f64() > 0.0 {
            self.frames_published as f64 / self.duration.as_secs_f64()
        } else {
            0.0
        }
    }

    /// Payload throughput in MiB/s
    pub fn throughput_mib(&self) -> f64 {
        self.fps() * self.payload_size as f64 / (1024.0 * 1024.0)
    }

    /// Print detailed summary
    pub fn print_summary(&self) {
        println!("\n=== Publisher Statistics ===\n");

        println!("Overview");
        println!("  Duration: {:.2}s", self.duration.as_secs_f64());
        println!("  Streams: {}", self.streams);
        println!("  Frames published: {}", self.frames_published);
        println!("  Deliveries queued: {}", self.deliveries_queued);
        println!("  Writes without subscribers: {}", self.writes_unobserved);
        println!("  FPS: {:.2}", self.fps());
        println!("  Throughput: {:.2} MiB/s", self.throughput_mib());

        if !self.sessions.is_empty() {
            println!("\nSessions");
            for (stream_id, session_id, metrics) in &self.sessions {
                println!(
                    "  stream {} / session {}: written={} failed={} dropped={} queued={}",
                    stream_id,
                    session_id,
                    metrics.write_count,
                    metrics.failure_count,
                    metrics.dropped_count,
                    metrics.queue_len
                );
            }
        }

        println!();
    }
}
