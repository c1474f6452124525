//! `serve` command implementation.

use anyhow::{Context, Result};
use config_loader::ConfigLoader;
use dispatcher::{MetricsSnapshot, Server, Stream};
use tokio::runtime::Handle;
use tracing::{info, warn};

use super::{deadline, load_config, shutdown_signal};
use crate::cli::ServeArgs;
use crate::error::CliError;
use crate::publisher::{PublishStats, Publisher, PublisherConfig, SEQUENCE_SIZE};

/// Highest accepted publish rate
const MAX_RATE_HZ: f64 = 10_000.0;

/// Execute the `serve` command
pub async fn run_serve(args: &ServeArgs) -> Result<()> {
    check_args(args)?;

    let mut config = load_config(args.config.as_deref())
        .context("Failed to load configuration")?;

    // Apply CLI overrides
    if let Some(bind) = args.bind {
        info!(%bind, "Overriding bind address from CLI");
        config.server.bind_addr = bind;
    }
    if let Some(host) = args.advertise_host {
        info!(%host, "Overriding advertised host from CLI");
        config.server.advertised_host = Some(host);
    }
    if let Some(timeout_ms) = args.timeout_ms {
        info!(timeout_ms, "Overriding session timeout from CLI");
        config.server.timeout_ms = timeout_ms;
    }
    ConfigLoader::validate(&config).context("Invalid configuration")?;

    let period_ms = 1000.0 / args.rate_hz;
    if period_ms >= config.server.timeout_ms as f64 {
        warn!(
            period_ms,
            timeout_ms = config.server.timeout_ms,
            "Publish period reaches the session timeout; subscribers will be dropped between frames"
        );
    }

    if args.metrics_port != 0 {
        observability::init_metrics_only(args.metrics_port)?;
        info!("Metrics endpoint available on port {}", args.metrics_port);
    }

    let server = Server::with_handle(config.server.clone(), Handle::current())
        .context("Failed to start stream server")?;
    info!(
        local_addr = %server.local_addr(),
        endpoint = %server.endpoint(),
        timeout_ms = config.server.timeout_ms,
        "Stream server running"
    );

    let streams: Vec<Stream> = (0..args.streams).map(|_| server.make_stream()).collect();
    for stream in &streams {
        // Tokens go to stdout so they can be piped into `subscribe`.
        println!("{}", stream.token());
        info!(stream_id = stream.stream_id(), token = ?stream.token(), "Stream ready");
    }

    let mut publisher = Publisher::new(
        streams,
        PublisherConfig {
            rate_hz: args.rate_hz,
            payload_size: args.payload_size,
            max_frames: (args.max_frames != 0).then_some(args.max_frames),
        },
    );

    tokio::select! {
        _ = publisher.run() => {}
        _ = deadline(args.duration) => info!("Duration elapsed, stopping"),
        _ = shutdown_signal() => warn!("Received shutdown signal, stopping server..."),
    }

    let sessions = session_metrics(&server, publisher.streams());
    let stats = PublishStats {
        sessions,
        ..publisher.finish()
    };
    server.stop();

    stats.print_summary();
    info!("Stream server finished");
    Ok(())
}

fn check_args(args: &ServeArgs) -> std::result::Result<(), CliError> {
    if args.streams == 0 {
        return Err(CliError::invalid_argument("streams", "must be at least 1"));
    }
    if !(args.rate_hz.is_finite() && args.rate_hz > 0.0 && args.rate_hz <= MAX_RATE_HZ) {
        return Err(CliError::invalid_argument(
            "rate-hz",
            format!("must be in (0, {MAX_RATE_HZ}], got {}", args.rate_hz),
        ));
    }
    if args.payload_size < SEQUENCE_SIZE {
        return Err(CliError::invalid_argument(
            "payload-size",
            format!("must be at least {SEQUENCE_SIZE} bytes"),
        ));
    }
    Ok(())
}

fn session_metrics(server: &Server, streams: &[Stream]) -> Vec<(u64, u64, MetricsSnapshot)> {
    streams
        .iter()
        .flat_map(|stream| {
            server
                .dispatcher()
                .session_metrics(stream.stream_id())
                .into_iter()
                .map(move |(session_id, metrics)| (stream.stream_id(), session_id, metrics))
        })
        .collect()
}
