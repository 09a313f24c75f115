//! Configuration types for DIMSE services

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use crate::DEFAULT_DIMSE_PORT;

/// Configuration for DIMSE services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DimseConfig {
    /// Local Application Entity Title
    pub local_aet: String,

    /// Bind address for SCP listener
    #[serde(default = "default_bind_addr")]
    pub bind_addr: IpAddr,

    /// Port for SCP listener (0 binds an ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum PDU size in bytes
    #[serde(default = "default_max_pdu")]
    pub max_pdu: u32,

    /// Connection timeout in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Association timeout in milliseconds
    #[serde(default = "default_association_timeout")]
    pub association_timeout_ms: u64,

    /// Maximum number of concurrent associations
    #[serde(default = "default_max_associations")]
    pub max_associations: u32,
}

/// Configuration for a remote DICOM node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteNode {
    /// Remote Application Entity Title
    pub ae_title: String,

    /// Remote host address
    pub host: String,

    /// Remote port
    pub port: u16,

    /// Connection timeout in milliseconds (overrides global setting)
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

impl Default for DimseConfig {
    fn default() -> Self {
        Self {
            local_aet: "SEGGATE_SCP".to_string(),
            bind_addr: default_bind_addr(),
            port: default_port(),
            max_pdu: default_max_pdu(),
            connect_timeout_ms: default_connect_timeout(),
            association_timeout_ms: default_association_timeout(),
            max_associations: default_max_associations(),
        }
    }
}

impl DimseConfig {
    /// Get connection timeout as Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Get association timeout as Duration
    pub fn association_timeout(&self) -> Duration {
        Duration::from_millis(self.association_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.local_aet, "Local")?;

        if self.max_pdu < 16384 || self.max_pdu > 131072 {
            return Err(crate::error::DimseError::config(
                "Max PDU size must be between 16384 and 131072 bytes",
            ));
        }

        if self.max_associations == 0 {
            return Err(crate::error::DimseError::config(
                "Maximum associations must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl RemoteNode {
    /// Create a new remote node configuration
    pub fn new(ae_title: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            ae_title: ae_title.into(),
            host: host.into(),
            port,
            connect_timeout_ms: None,
        }
    }

    /// Set connection timeout for this node
    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.connect_timeout_ms = Some(timeout_ms);
        self
    }

    /// Validate the remote node configuration
    pub fn validate(&self) -> crate::error::Result<()> {
        validate_ae_title(&self.ae_title, "Remote")?;

        if self.host.trim().is_empty() {
            return Err(crate::error::DimseError::config("Remote host cannot be empty"));
        }

        if self.port == 0 {
            return Err(crate::error::DimseError::config(
                "Remote port must be greater than 0",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Display for RemoteNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.ae_title, self.host, self.port)
    }
}

/// AE titles are 1-16 characters of non-control ASCII
pub fn validate_ae_title(ae_title: &str, role: &str) -> crate::error::Result<()> {
    let trimmed = ae_title.trim();
    if trimmed.is_empty() || trimmed.len() > 16 {
        return Err(crate::error::DimseError::InvalidAeTitle(format!(
            "{} AE title must be 1-16 characters, got '{}'",
            role, ae_title
        )));
    }
    if trimmed.chars().any(|c| !c.is_ascii() || c.is_ascii_control() || c == '\\') {
        return Err(crate::error::DimseError::InvalidAeTitle(format!(
            "{} AE title contains invalid characters: '{}'",
            role, ae_title
        )));
    }
    Ok(())
}

// Default value functions
fn default_bind_addr() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(0, 0, 0, 0))
}

fn default_port() -> u16 {
    DEFAULT_DIMSE_PORT
}

fn default_max_pdu() -> u32 {
    65536
}

fn default_connect_timeout() -> u64 {
    30_000 // 30 seconds
}

fn default_association_timeout() -> u64 {
    300_000 // 5 minutes
}

fn default_max_associations() -> u32 {
    10
}
