mod gateway_config;
mod logging_config;
mod pipeline_config;
mod receiver_config;

pub use gateway_config::GatewayConfig;
pub use logging_config::LoggingConfig;
pub use pipeline_config::{ChannelsConfig, InferenceConfig, RelayConfig};
pub use receiver_config::ReceiverConfig;

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Default configuration file, relative to the working directory
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("gateway.id cannot be blank")]
    InvalidGatewayId,

    #[error("invalid AE title: {0}")]
    InvalidAeTitle(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("relay.workers must be at least 1")]
    NoWorkers,

    #[error("relay.max_attempts must be at least 1")]
    NoRetryAttempts,

    #[error("inference.{0} cannot be empty")]
    MissingInferenceSetting(&'static str),

    #[error("receiver.accepted_transfer_syntaxes cannot be empty")]
    NoTransferSyntaxes,

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Structure representing application startup arguments
#[derive(Debug)]
pub struct Cli {
    /// Path to the configuration file.
    pub config_path: String,
}

impl Cli {
    pub fn new(config_path: String) -> Self {
        Self { config_path }
    }

    /// Read `--config <path>` (or `--config=<path>`) from an argument list.
    /// The first element is the program name.
    pub fn parse_from<I: IntoIterator<Item = String>>(args: I) -> Self {
        let mut config_path = DEFAULT_CONFIG_PATH.to_string();
        let mut args = args.into_iter().skip(1);
        while let Some(arg) = args.next() {
            if arg == "--config" || arg == "-c" {
                if let Some(path) = args.next() {
                    config_path = path;
                }
            } else if let Some(path) = arg.strip_prefix("--config=") {
                config_path = path.to_string();
            }
        }
        Self::new(config_path)
    }
}

/// Top-level gateway configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub receiver: ReceiverConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
}

impl Config {
    /// Load the file named by `--config` (default `config.toml`)
    pub fn from_args() -> Result<Self, ConfigError> {
        let cli = Cli::parse_from(std::env::args());
        Self::from_file(Path::new(&cli.config_path))
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.gateway.validate()?;
        self.receiver.validate()?;
        self.inference.validate()?;
        self.relay.validate()?;
        self.channels.validate()?;
        Ok(())
    }
}
