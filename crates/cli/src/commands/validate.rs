//! `validate` command implementation.

use anyhow::{Context, Result};
use contracts::{StreamingConfig, MIN_WORKER_THREADS};
use serde::Serialize;
use tracing::info;

use crate::cli::ValidateArgs;

/// Timeouts below this are accepted but rarely intended
const SHORT_TIMEOUT_MS: u64 = 100;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    bind_addr: String,
    advertised_host: Option<String>,
    server_worker_threads: usize,
    timeout_ms: u64,
    handshake_timeout_ms: u64,
    session_queue_capacity: usize,
    client_worker_threads: usize,
    connect_timeout_ms: u64,
    max_frame_size: usize,
}

impl From<&StreamingConfig> for ConfigSummary {
    fn from(config: &StreamingConfig) -> Self {
        Self {
            bind_addr: config.server.bind_addr.to_string(),
            advertised_host: config.server.advertised_host.map(|h| h.to_string()),
            server_worker_threads: config.server.worker_threads,
            timeout_ms: config.server.timeout_ms,
            handshake_timeout_ms: config.server.handshake_timeout_ms,
            session_queue_capacity: config.server.session_queue_capacity,
            client_worker_threads: config.client.worker_threads,
            connect_timeout_ms: config.client.connect_timeout_ms,
            max_frame_size: config.client.max_frame_size,
        }
    }
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(config) => {
            let warnings = collect_warnings(&config);
            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: (!warnings.is_empty()).then_some(warnings),
                summary: Some(ConfigSummary::from(&config)),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(config: &StreamingConfig) -> Vec<String> {
    let mut warnings = Vec::new();
    let server = &config.server;

    if server.bind_addr.ip().is_unspecified() && server.advertised_host.is_none() {
        warnings.push(format!(
            "server.bind_addr is {} without advertised_host - tokens will name loopback",
            server.bind_addr.ip()
        ));
    }

    if server.timeout_ms < SHORT_TIMEOUT_MS {
        warnings.push(format!(
            "server.timeout_ms is {}ms - slow subscribers will be dropped quickly",
            server.timeout_ms
        ));
    }

    for (name, threads) in [
        ("server", server.worker_threads),
        ("client", config.client.worker_threads),
    ] {
        if threads < MIN_WORKER_THREADS {
            warnings.push(format!(
                "{name}.worker_threads is {threads} - raised to {MIN_WORKER_THREADS} at runtime"
            ));
        }
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Bind: {}", summary.bind_addr);
            if let Some(ref host) = summary.advertised_host {
                println!("  Advertised host: {}", host);
            }
            println!(
                "  Server: {} workers, timeout {}ms, handshake {}ms, queue {}",
                summary.server_worker_threads,
                summary.timeout_ms,
                summary.handshake_timeout_ms,
                summary.session_queue_capacity
            );
            println!(
                "  Client: {} workers, connect {}ms, max frame {} bytes",
                summary.client_worker_threads, summary.connect_timeout_ms, summary.max_frame_size
            );
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args_for(content: &str, suffix: &str) -> (tempfile::NamedTempFile, ValidateArgs) {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        let args = ValidateArgs {
            config: file.path().to_path_buf(),
            json: true,
        };
        (file, args)
    }

    #[test]
    fn test_valid_config_with_warnings() {
        let (_file, args) = args_for("[server]\ntimeout_ms = 50\nhandshake_timeout_ms = 400\n", ".toml");
        let result = validate_config(&args);

        assert!(result.valid);
        let warnings = result.warnings.unwrap();
        assert_eq!(warnings.len(), 2);
        assert!(warnings[1].contains("timeout_ms"));
        assert_eq!(result.summary.unwrap().timeout_ms, 50);
    }

    #[test]
    fn test_invalid_config() {
        let (_file, args) = args_for(r#"{ "server": { "worker_threads": 0 } }"#, ".json");
        let result = validate_config(&args);

        assert!(!result.valid);
        assert!(result.error.unwrap().contains("server.worker_threads"));
        assert!(run_validate(&args).is_err());
    }

    #[test]
    fn test_missing_file() {
        let args = ValidateArgs {
            config: "/nonexistent/streaming.toml".into(),
            json: false,
        };
        assert!(!validate_config(&args).valid);
    }
}
