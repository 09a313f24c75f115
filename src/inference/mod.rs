//! Inference service boundary

mod http;

pub use http::{HttpInferenceClient, InferenceClientConfig, AUTH_HEADER};

use async_trait::async_trait;
use std::path::Path;

use crate::error::Result;
use crate::models::{ChannelData, ModelResult};

/// Segmentation service contract.
///
/// `submit` hands over one work item's channels and returns the run id;
/// `poll` reports progress for that run and, once finished, writes the result
/// file into `output_dir`.
#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn submit(&self, work_item_id: &str, channels: &[ChannelData]) -> Result<String>;

    async fn poll(&self, run_id: &str, output_dir: &Path) -> Result<ModelResult>;
}
