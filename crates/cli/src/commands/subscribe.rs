//! `subscribe` command implementation.

use std::collections::HashMap;
use std::time::Instant;

use anyhow::{Context, Result};
use contracts::{Buffer, Token};
use observability::{DeliveryAggregator, DeliverySummary};
use serde::Serialize;
use subscriber::Client;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{deadline, load_config, shutdown_signal};
use crate::cli::SubscribeArgs;
use crate::publisher::payload_sequence;

/// One received frame, forwarded from a callback to the reporting loop
struct Delivery {
    label: usize,
    payload: Buffer,
    at: Instant,
}

/// Execute the `subscribe` command
pub async fn run_subscribe(args: &SubscribeArgs) -> Result<()> {
    let config = load_config(args.config.as_deref()).context("Failed to load configuration")?;
    let client = Client::with_handle(config.client, Handle::current());

    let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
    let labels: Vec<String> = args.tokens.iter().map(label).collect();

    for (index, token) in args.tokens.iter().enumerate() {
        let tx = tx.clone();
        client
            .subscribe(*token, move |payload| {
                let _ = tx.send(Delivery {
                    label: index,
                    payload,
                    at: Instant::now(),
                });
            })
            .with_context(|| format!("Failed to subscribe to {}", labels[index]))?;
        info!(stream = %labels[index], "Subscribed");
    }
    drop(tx);

    let max_frames = (args.max_frames != 0).then_some(args.max_frames);
    let mut report = Report::new(labels);

    let receive = async {
        while let Some(delivery) = rx.recv().await {
            report.record(&delivery);
            if max_frames.is_some_and(|max| report.aggregator.total_frames() >= max) {
                info!(frames = report.aggregator.total_frames(), "Frame limit reached");
                return;
            }
        }
    };

    tokio::select! {
        _ = receive => {}
        _ = deadline(args.timeout) => info!("Timeout elapsed, stopping"),
        _ = shutdown_signal() => warn!("Received shutdown signal, unsubscribing..."),
    }

    client.stop();
    report.print(args.json)?;
    Ok(())
}

fn label(token: &Token) -> String {
    format!("{}/{}", token.endpoint(), token.stream_id())
}

/// Delivery statistics plus sequence-gap tracking per stream
struct Report {
    labels: Vec<String>,
    aggregator: DeliveryAggregator,
    last_sequence: HashMap<usize, u64>,
    gaps: HashMap<usize, u64>,
}

#[derive(Serialize)]
struct JsonReport {
    total_frames: u64,
    total_bytes: u64,
    streams: Vec<JsonStream>,
}

#[derive(Serialize)]
struct JsonStream {
    stream: String,
    frames: u64,
    bytes: u64,
    missing: u64,
    mean_gap_ms: f64,
}

impl Report {
    fn new(labels: Vec<String>) -> Self {
        Self {
            labels,
            aggregator: DeliveryAggregator::new(),
            last_sequence: HashMap::new(),
            gaps: HashMap::new(),
        }
    }

    fn record(&mut self, delivery: &Delivery) {
        let label = &self.labels[delivery.label];
        self.aggregator
            .update(label, delivery.payload.len(), delivery.at);

        let Some(sequence) = payload_sequence(&delivery.payload) else {
            return;
        };
        if let Some(last) = self.last_sequence.insert(delivery.label, sequence) {
            let missing = sequence.saturating_sub(last + 1);
            if missing > 0 {
                *self.gaps.entry(delivery.label).or_default() += missing;
                debug!(stream = %label, last, sequence, "Sequence gap");
            }
        }
    }

    fn missing(&self, label: &str) -> u64 {
        self.labels
            .iter()
            .position(|l| l == label)
            .and_then(|index| self.gaps.get(&index).copied())
            .unwrap_or(0)
    }

    fn to_json(&self, summary: &DeliverySummary) -> JsonReport {
        JsonReport {
            total_frames: summary.total_frames,
            total_bytes: summary.total_bytes,
            streams: summary
                .streams
                .iter()
                .map(|s| JsonStream {
                    stream: s.label.clone(),
                    frames: s.frames,
                    bytes: s.bytes,
                    missing: self.missing(&s.label),
                    mean_gap_ms: s.gap_ms.mean,
                })
                .collect(),
        }
    }

    fn print(&self, json: bool) -> Result<()> {
        let summary = self.aggregator.summary();
        if json {
            let output = serde_json::to_string_pretty(&self.to_json(&summary))
                .context("Failed to serialize summary")?;
            println!("{output}");
            return Ok(());
        }

        print!("\n{summary}");
        for stream in &summary.streams {
            let missing = self.missing(&stream.label);
            if missing > 0 {
                println!("Stream {}: {} frames missing by sequence", stream.label, missing);
            }
        }
        Ok(())
    }
}
