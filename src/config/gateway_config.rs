use serde::Deserialize;
use std::path::PathBuf;

use crate::config::ConfigError;

/// Represents the `[gateway]` section
#[derive(Debug, Deserialize, Default)]
pub struct GatewayConfig {
    pub id: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Local data directory; the platform default is used when unset
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::InvalidGatewayId);
        }
        Ok(())
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
