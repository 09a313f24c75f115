use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{GatewayError, Result};

/// Files assigned to one inference input channel, in receipt order.
///
/// Two values are equal when their channel ids are equal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelData {
    channel_id: String,
    files: Vec<PathBuf>,
}

impl ChannelData {
    /// Build a channel. An empty file list is rejected unless `allow_empty` is set.
    pub fn new(channel_id: impl Into<String>, files: Vec<PathBuf>, allow_empty: bool) -> Result<Self> {
        let channel_id = channel_id.into();
        if channel_id.trim().is_empty() {
            return Err(GatewayError::invalid_argument("Channel id cannot be blank"));
        }
        if files.is_empty() && !allow_empty {
            return Err(GatewayError::invalid_argument(format!(
                "Channel '{}' has no files",
                channel_id
            )));
        }
        Ok(Self { channel_id, files })
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub(crate) fn push(&mut self, file: &Path) {
        self.files.push(file.to_path_buf());
    }
}

impl PartialEq for ChannelData {
    fn eq(&self, other: &Self) -> bool {
        self.channel_id == other.channel_id
    }
}

impl Eq for ChannelData {}

impl std::hash::Hash for ChannelData {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.channel_id.hash(state);
    }
}
