use crate::error::{GatewayError, Result};
use crate::storage::StorageBackend;
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// Filesystem storage rooted at a directory; holds one folder per session
#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    root_path: PathBuf,
}

impl FilesystemStorage {
    /// Create the storage, creating the root directory if needed
    pub fn new<P: AsRef<Path>>(root_path: P) -> Result<Self> {
        let root_path = root_path.as_ref().to_path_buf();

        if !root_path.exists() {
            std::fs::create_dir_all(&root_path).map_err(|e| {
                GatewayError::store_unavailable(format!(
                    "Failed to create storage root directory '{}': {}",
                    root_path.display(),
                    e
                ))
            })?;
        }

        // Not canonicalized: callers compare against the path they passed in
        Ok(Self { root_path })
    }

    /// Folder for one session, created on first use.
    ///
    /// Session ids must be a single path component.
    pub fn session_dir(&self, session_id: &str) -> Result<PathBuf> {
        validate_component(session_id)?;
        self.ensure_dir_str(session_id)
    }

    /// Path a file with `name` would have inside the session folder
    pub fn session_file(&self, session_id: &str, name: &str) -> Result<PathBuf> {
        validate_component(name)?;
        Ok(self.session_dir(session_id)?.join(name))
    }
}

fn validate_component(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed == "."
        || trimmed == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(GatewayError::invalid_argument(format!(
            "'{}' is not a valid file or folder name",
            name
        )));
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for FilesystemStorage {
    fn base_path(&self) -> &Path {
        &self.root_path
    }
}
