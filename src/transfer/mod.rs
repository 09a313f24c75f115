//! Outbound DICOM client: liveness probe and batch send

use async_trait::async_trait;
use dimse::{RemoteNode, ScuTransport};
use std::path::PathBuf;
use std::sync::Arc;

use crate::error::{GatewayError, Result};

/// Outcome of one outbound operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub success: bool,
    /// Failure reason; empty on success
    pub reason: String,
}

impl OperationResult {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            reason: String::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            reason: reason.into(),
        }
    }
}

/// Sender boundary.
///
/// Only argument errors are returned as `Err`; network failures come back as
/// failed `OperationResult`s.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn probe(&self, own_aet: &str, peer_aet: &str, peer_port: u16, peer_host: &str) -> Result<OperationResult>;

    /// Send each file independently; one result per file, in input order
    async fn send_batch(
        &self,
        own_aet: &str,
        peer_aet: &str,
        peer_port: u16,
        peer_host: &str,
        files: &[PathBuf],
    ) -> Result<Vec<(PathBuf, OperationResult)>>;
}

/// `Transfer` over a DIMSE SCU
pub struct DimseTransferClient {
    scu: Arc<dyn ScuTransport>,
}

impl DimseTransferClient {
    pub fn new(scu: Arc<dyn ScuTransport>) -> Self {
        Self { scu }
    }
}

fn peer(own_aet: &str, peer_aet: &str, peer_port: u16, peer_host: &str) -> Result<RemoteNode> {
    if own_aet.trim().is_empty() {
        return Err(GatewayError::invalid_argument("Own AE title cannot be blank"));
    }
    if peer_aet.trim().is_empty() {
        return Err(GatewayError::invalid_argument("Peer AE title cannot be blank"));
    }
    if peer_host.trim().is_empty() {
        return Err(GatewayError::invalid_argument("Peer host cannot be blank"));
    }
    Ok(RemoteNode::new(peer_aet.trim(), peer_host.trim(), peer_port))
}

#[async_trait]
impl Transfer for DimseTransferClient {
    async fn probe(&self, own_aet: &str, peer_aet: &str, peer_port: u16, peer_host: &str) -> Result<OperationResult> {
        let node = peer(own_aet, peer_aet, peer_port, peer_host)?;
        match self.scu.echo(own_aet.trim(), &node).await {
            Ok(()) => Ok(OperationResult::succeeded()),
            Err(e) => {
                tracing::warn!("C-ECHO to {} failed: {}", node, e);
                Ok(OperationResult::failed(e.to_string()))
            }
        }
    }

    async fn send_batch(
        &self,
        own_aet: &str,
        peer_aet: &str,
        peer_port: u16,
        peer_host: &str,
        files: &[PathBuf],
    ) -> Result<Vec<(PathBuf, OperationResult)>> {
        let node = peer(own_aet, peer_aet, peer_port, peer_host)?;
        let mut results = Vec::with_capacity(files.len());

        for file in files {
            let outcome = match self.scu.store(own_aet.trim(), &node, file).await {
                Ok(()) => OperationResult::succeeded(),
                Err(e) => {
                    tracing::warn!("C-STORE of {} to {} failed: {}", file.display(), node, e);
                    OperationResult::failed(e.to_string())
                }
            };
            results.push((file.clone(), outcome));
        }

        let sent = results.iter().filter(|(_, r)| r.success).count();
        tracing::info!("📤 Sent {}/{} files to {}", sent, files.len(), node);
        Ok(results)
    }
}
