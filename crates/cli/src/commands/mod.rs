//! CLI command implementations.

mod serve;
mod subscribe;
mod token;
mod validate;

pub use serve::run_serve;
pub use subscribe::run_subscribe;
pub use token::run_token;
pub use validate::run_validate;

use std::path::Path;

use config_loader::ConfigLoader;
use contracts::StreamingConfig;
use tracing::{info, warn};

use crate::error::{CliError, Result};

/// Load the configuration file, or defaults when no path is given
fn load_config(path: Option<&Path>) -> Result<StreamingConfig> {
    let Some(path) = path else {
        info!("No configuration file given, using defaults");
        return Ok(StreamingConfig::default());
    };

    info!(config = %path.display(), "Loading configuration");
    if !path.exists() {
        return Err(CliError::config_not_found(path.display().to_string()));
    }
    Ok(ConfigLoader::load_from_path(path)?)
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Sleep for `secs` seconds, or forever when zero
async fn deadline(secs: u64) {
    if secs == 0 {
        std::future::pending::<()>().await;
    } else {
        tokio::time::sleep(std::time::Duration::from_secs(secs)).await;
    }
}
