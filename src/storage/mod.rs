use async_trait::async_trait;
use std::path::{Path, PathBuf};

pub mod database_manager;
pub mod filesystem;
pub mod queue_store;

pub use database_manager::DatabaseManager;
pub use filesystem::FilesystemStorage;
pub use queue_store::{Column, ColumnType, DurableQueueStore, QueueRow, RowIter};

use crate::error::{GatewayError, Result};

/// Directory name used under the platform local-data directory
pub const APP_DIR_NAME: &str = "seggate";

/// Resolve the per-application data directory.
///
/// A configured directory always wins; otherwise `<local data dir>/seggate`.
pub fn resolve_data_dir(configured: Option<&Path>) -> Result<PathBuf> {
    if let Some(dir) = configured {
        return Ok(dir.to_path_buf());
    }

    dirs::data_local_dir()
        .map(|dir| dir.join(APP_DIR_NAME))
        .ok_or_else(|| {
            GatewayError::invalid_argument(
                "No local data directory on this platform; set gateway.data_dir",
            )
        })
}

/// File operations rooted at a base directory
#[async_trait]
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Get the base path for this storage backend
    fn base_path(&self) -> &Path;

    /// Create a subpath relative to the storage root
    fn subpath_str(&self, path: &str) -> PathBuf {
        self.base_path().join(path)
    }

    /// Ensure a directory exists under the storage root, creating it if necessary
    fn ensure_dir_str(&self, path: &str) -> Result<PathBuf> {
        let full_path = self.subpath_str(path);
        std::fs::create_dir_all(&full_path)?;
        Ok(full_path)
    }

    /// Remove a file or directory at the given relative path
    async fn remove_str(&self, path: &str) -> Result<()> {
        let full_path = self.subpath_str(path);
        if full_path.is_dir() {
            tokio::fs::remove_dir_all(&full_path).await?;
        } else {
            tokio::fs::remove_file(&full_path).await?
        }
        Ok(())
    }
}
