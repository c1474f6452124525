//! # Config Loader
//!
//! Configuration loading and parsing module.
//!
//! Responsibilities:
//! - Parse TOML/JSON configuration files
//! - Validate configuration legality
//! - Produce a [`StreamingConfig`] for the server and client
//!
//! # Example
//!
//! ```no_run
//! use config_loader::ConfigLoader;
//! use std::path::Path;
//!
//! let config = ConfigLoader::load_from_path(Path::new("streaming.toml")).unwrap();
//! println!("Listening on {}", config.server.bind_addr);
//! ```

mod parser;
mod validator;

pub use contracts::StreamingConfig;
pub use parser::ConfigFormat;

use contracts::StreamingError;
use std::path::Path;

/// Configuration loader
///
/// Provides static methods to load configuration from files or strings.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file path
    ///
    /// Automatically detects format from file extension (.toml / .json).
    ///
    /// # Errors
    /// - File read failure
    /// - Unsupported format
    /// - Parse failure
    /// - Validation failure
    pub fn load_from_path(path: &Path) -> Result<StreamingConfig, StreamingError> {
        let format = Self::detect_format(path)?;
        let content = Self::read_file(path)?;
        Self::load_from_str(&content, format)
    }

    /// Load configuration from string
    ///
    /// # Errors
    /// - Parse failure
    /// - Validation failure
    pub fn load_from_str(
        content: &str,
        format: ConfigFormat,
    ) -> Result<StreamingConfig, StreamingError> {
        Self::parse_and_validate(content, format)
    }

    /// Validate an already constructed configuration
    pub fn validate(config: &StreamingConfig) -> Result<(), StreamingError> {
        validator::validate(config)
    }

    /// Serialize StreamingConfig to TOML string
    pub fn to_toml(config: &StreamingConfig) -> Result<String, StreamingError> {
        toml::to_string_pretty(config)
            .map_err(|e| StreamingError::config_parse(format!("TOML serialize error: {e}")))
    }

    /// Serialize StreamingConfig to JSON string
    pub fn to_json(config: &StreamingConfig) -> Result<String, StreamingError> {
        serde_json::to_string_pretty(config)
            .map_err(|e| StreamingError::config_parse(format!("JSON serialize error: {e}")))
    }
}

impl ConfigLoader {
    /// Infer configuration format from file extension
    fn detect_format(path: &Path) -> Result<ConfigFormat, StreamingError> {
        let ext = path.extension().and_then(|e| e.to_str()).ok_or_else(|| {
            StreamingError::config_parse("cannot determine file format from extension")
        })?;

        ConfigFormat::from_extension(ext).ok_or_else(|| {
            StreamingError::config_parse(format!("unsupported config format: .{ext}"))
        })
    }

    /// Read configuration file content
    fn read_file(path: &Path) -> Result<String, StreamingError> {
        Ok(std::fs::read_to_string(path)?)
    }

    /// Parse and validate configuration content
    fn parse_and_validate(
        content: &str,
        format: ConfigFormat,
    ) -> Result<StreamingConfig, StreamingError> {
        let config = parser::parse(content, format)?;
        validator::validate(&config)?;
        Ok(config)
    }
}
