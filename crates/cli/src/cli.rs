//! CLI argument definitions using clap.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use contracts::Token;

/// CARLA Stream - token-addressed streaming transport
#[derive(Parser, Debug)]
#[command(
    name = "carla-stream",
    author,
    version,
    about = "Token-addressed streaming transport",
    long_about = "Publishes opaque byte streams over TCP and subscribes to them by token.\n\n\
                  A server allocates streams and prints their tokens; subscribers \n\
                  connect with a token and receive every frame written afterwards."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "CARLA_STREAM_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "CARLA_STREAM_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a server, print stream tokens and publish synthetic frames
    Serve(ServeArgs),

    /// Subscribe to one or more tokens and report what arrives
    Subscribe(SubscribeArgs),

    /// Decode a stream token
    Token(TokenArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),
}

/// Arguments for the `serve` command
#[derive(Parser, Debug, Clone)]
pub struct ServeArgs {
    /// Path to configuration file (TOML or JSON); defaults apply without it
    #[arg(short, long, env = "CARLA_STREAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override the listen address
    #[arg(long, env = "CARLA_STREAM_BIND")]
    pub bind: Option<SocketAddr>,

    /// Override the host written into tokens
    #[arg(long, env = "CARLA_STREAM_ADVERTISE_HOST")]
    pub advertise_host: Option<IpAddr>,

    /// Override the session liveness timeout in milliseconds
    #[arg(long, env = "CARLA_STREAM_TIMEOUT_MS")]
    pub timeout_ms: Option<u64>,

    /// Number of streams to create
    #[arg(long, default_value = "1", env = "CARLA_STREAM_STREAMS")]
    pub streams: usize,

    /// Frames published per stream per second
    #[arg(long, default_value = "10", env = "CARLA_STREAM_RATE_HZ")]
    pub rate_hz: f64,

    /// Size of each synthetic payload in bytes (at least 8)
    #[arg(long, default_value = "1024", env = "CARLA_STREAM_PAYLOAD_SIZE")]
    pub payload_size: usize,

    /// Stop after this many frames per stream (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub max_frames: u64,

    /// Stop after this many seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "CARLA_STREAM_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `subscribe` command
#[derive(Parser, Debug, Clone)]
pub struct SubscribeArgs {
    /// Stream token to subscribe to (repeatable)
    #[arg(short, long = "token", required = true, env = "CARLA_STREAM_TOKEN", value_delimiter = ',')]
    pub tokens: Vec<Token>,

    /// Path to configuration file (TOML or JSON)
    #[arg(short, long, env = "CARLA_STREAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Stop after this many frames in total (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub max_frames: u64,

    /// Stop after this many seconds (0 = until Ctrl+C)
    #[arg(long, default_value = "0")]
    pub timeout: u64,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `token` command
#[derive(Parser, Debug)]
pub struct TokenArgs {
    /// Token text to decode
    pub token: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(short, long, default_value = "streaming.toml")]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Log output format
#[derive(ValueEnum, Clone, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}
