//! Service Class User (SCU) implementation for outbound DIMSE operations

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info};

use crate::config::{validate_ae_title, DimseConfig, RemoteNode};
use crate::{DimseError, Result};

/// Outbound operations the gateway needs from a DICOM client
#[async_trait]
pub trait ScuTransport: Send + Sync {
    /// Send a C-ECHO to `node`, calling as `calling_aet`
    async fn echo(&self, calling_aet: &str, node: &RemoteNode) -> Result<()>;

    /// Send one Part 10 file to `node` with C-STORE
    async fn store(&self, calling_aet: &str, node: &RemoteNode, file: &Path) -> Result<()>;
}

/// DIMSE Service Class User
pub struct DimseScu {
    config: DimseConfig,
}

impl DimseScu {
    /// Create a new SCU with the given configuration
    pub fn new(config: DimseConfig) -> Self {
        Self { config }
    }

    /// Get connection timeout for a node (uses node-specific or global setting)
    fn get_connection_timeout(&self, node: &RemoteNode) -> Duration {
        node.connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.config.connect_timeout())
    }

    #[cfg(feature = "dcmtk_cli")]
    async fn run_dcmtk(&self, program: &str, args: Vec<String>, node: &RemoteNode) -> Result<()> {
        use tokio::process::Command;

        debug!("Running: {} {}", program, args.join(" "));
        let timeout = self.get_connection_timeout(node) + self.config.association_timeout();
        let output = tokio::time::timeout(timeout, Command::new(program).args(&args).output())
            .await
            .map_err(|_| DimseError::Timeout(format!("{} to {} timed out", program, node)))?
            .map_err(|e| DimseError::operation_failed(format!("Failed to spawn {}: {}", program, e)))?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stdout = String::from_utf8_lossy(&output.stdout);
        error!(
            "{} failed: status={:?}, stdout={}, stderr={}",
            program,
            output.status.code(),
            stdout,
            stderr
        );
        Err(DimseError::operation_failed(format!(
            "{} failed: {:?} {}",
            program,
            output.status.code(),
            stderr.trim()
        )))
    }

    fn base_args(&self, calling_aet: &str, node: &RemoteNode) -> Vec<String> {
        let timeout_secs = self.get_connection_timeout(node).as_secs().max(1);
        vec![
            "-aet".into(),
            calling_aet.to_string(),
            "-aec".into(),
            node.ae_title.clone(),
            "-to".into(),
            timeout_secs.to_string(),
        ]
    }
}

#[async_trait]
impl ScuTransport for DimseScu {
    async fn echo(&self, calling_aet: &str, node: &RemoteNode) -> Result<()> {
        info!("Sending C-ECHO to {}", node);
        validate_ae_title(calling_aet, "Calling")?;
        node.validate()?;

        #[cfg(feature = "dcmtk_cli")]
        {
            let mut args = self.base_args(calling_aet, node);
            args.push(node.host.clone());
            args.push(node.port.to_string());
            self.run_dcmtk("echoscu", args, node).await?;
            info!("C-ECHO to {} completed successfully", node);
            Ok(())
        }

        #[cfg(not(feature = "dcmtk_cli"))]
        {
            let _ = self.base_args(calling_aet, node);
            Err(DimseError::NotSupported(
                "C-ECHO requires feature 'dcmtk_cli' or a native UL implementation".into(),
            ))
        }
    }

    async fn store(&self, calling_aet: &str, node: &RemoteNode, file: &Path) -> Result<()> {
        info!("Sending C-STORE of {} to {}", file.display(), node);
        validate_ae_title(calling_aet, "Calling")?;
        node.validate()?;

        if !file.is_file() {
            return Err(DimseError::NotFound(format!(
                "File to send does not exist: {}",
                file.display()
            )));
        }

        #[cfg(feature = "dcmtk_cli")]
        {
            let mut args = self.base_args(calling_aet, node);
            args.push(node.host.clone());
            args.push(node.port.to_string());
            args.push(file.to_string_lossy().to_string());
            self.run_dcmtk("storescu", args, node).await?;
            info!("C-STORE to {} completed successfully", node);
            Ok(())
        }

        #[cfg(not(feature = "dcmtk_cli"))]
        {
            let _ = self.base_args(calling_aet, node);
            Err(DimseError::NotSupported(
                "C-STORE requires feature 'dcmtk_cli' or a native UL implementation".into(),
            ))
        }
    }
}
