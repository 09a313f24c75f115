use dimse::{DimseConfig, EXPLICIT_VR_LE, IMPLICIT_VR_LE};
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::config::ConfigError;

/// Represents the `[receiver]` section: the inbound storage SCP
#[derive(Debug, Deserialize)]
pub struct ReceiverConfig {
    #[serde(default = "default_local_aet")]
    pub local_aet: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Root of the per-session folders; `<data_dir>/received` when unset
    #[serde(default)]
    pub storage_dir: Option<PathBuf>,
    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u64,
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,
    #[serde(default = "default_association_timeout_ms")]
    pub association_timeout_ms: u64,
    #[serde(default = "default_accepted_transfer_syntaxes")]
    pub accepted_transfer_syntaxes: Vec<String>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            local_aet: default_local_aet(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            storage_dir: None,
            listen_timeout_ms: default_listen_timeout_ms(),
            max_associations: default_max_associations(),
            association_timeout_ms: default_association_timeout_ms(),
            accepted_transfer_syntaxes: default_accepted_transfer_syntaxes(),
        }
    }
}

impl ReceiverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        dimse::config::validate_ae_title(&self.local_aet, "receiver.local_aet")
            .map_err(|e| ConfigError::InvalidAeTitle(e.to_string()))?;
        if self.port == 0 {
            return Err(ConfigError::InvalidPort("receiver.port must be greater than 0".into()));
        }
        if self.max_associations == 0 {
            return Err(ConfigError::InvalidValue(
                "receiver.max_associations must be at least 1".into(),
            ));
        }
        if self.accepted_transfer_syntaxes.iter().all(|ts| ts.trim().is_empty()) {
            return Err(ConfigError::NoTransferSyntaxes);
        }
        Ok(())
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }

    /// Listener settings for the DIMSE SCP
    pub fn dimse_config(&self) -> DimseConfig {
        DimseConfig {
            local_aet: self.local_aet.trim().to_string(),
            bind_addr: self.bind_addr,
            port: self.port,
            max_associations: self.max_associations,
            association_timeout_ms: self.association_timeout_ms,
            ..Default::default()
        }
    }
}

fn default_local_aet() -> String {
    "SEGGATE".to_string()
}

fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    dimse::DEFAULT_DIMSE_PORT
}

fn default_listen_timeout_ms() -> u64 {
    5_000
}

fn default_max_associations() -> u32 {
    10
}

fn default_association_timeout_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_accepted_transfer_syntaxes() -> Vec<String> {
    vec![EXPLICIT_VR_LE.to_string(), IMPLICIT_VR_LE.to_string()]
}
