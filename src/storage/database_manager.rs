use once_cell::sync::OnceCell;
use redb::Database;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{GatewayError, Result};

/// Process-wide registry of open database files.
/// A redb file can only be opened once per process, so every store asks here.
static GLOBAL_DB_MANAGER: OnceCell<DatabaseManager> = OnceCell::new();

/// Maps database file paths to their shared `Arc<Database>` instances
pub struct DatabaseManager {
    databases: Mutex<HashMap<PathBuf, Arc<Database>>>,
}

impl DatabaseManager {
    fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
        }
    }

    /// Get the global database manager instance
    pub fn global() -> &'static DatabaseManager {
        GLOBAL_DB_MANAGER.get_or_init(DatabaseManager::new)
    }

    /// Get or open the shared database for a path
    pub fn get_or_create_database(&self, db_path: &Path) -> Result<Arc<Database>> {
        let db_path_buf = db_path.to_path_buf();

        let mut map = self
            .databases
            .lock()
            .map_err(|e| GatewayError::store_unavailable(format!("Failed to lock database map: {}", e)))?;

        if let Some(existing_db) = map.get(&db_path_buf) {
            tracing::debug!(
                "🔄 Reusing existing database instance for: {}",
                db_path_buf.display()
            );
            return Ok(existing_db.clone());
        }

        tracing::debug!(
            "🆕 Opening database instance for: {}",
            db_path_buf.display()
        );
        let db = Self::create_database(&db_path_buf)?;
        map.insert(db_path_buf, db.clone());
        Ok(db)
    }

    fn create_database(db_path: &Path) -> Result<Arc<Database>> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                GatewayError::store_unavailable(format!(
                    "Failed to create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        tracing::info!("🗄️  Opening queue database: {}", db_path.display());

        // Database::create opens an existing file without truncating it
        let db = Database::create(db_path).map_err(|e| {
            GatewayError::store_unavailable(format!("Failed to open database: {}", e))
        })?;

        tracing::info!("✅ Database ready");
        Ok(Arc::new(db))
    }

    /// Forget the shared instance for a path.
    ///
    /// The file is closed once every store holding the `Arc` has been dropped.
    pub fn close_database(&self, db_path: &Path) -> Result<bool> {
        let mut map = self
            .databases
            .lock()
            .map_err(|e| GatewayError::store_unavailable(format!("Failed to lock database map: {}", e)))?;

        let removed = map.remove(db_path).is_some();
        if removed {
            tracing::info!("🗑️  Closed database: {}", db_path.display());
        }
        Ok(removed)
    }
}

/// Transaction helpers that map redb failures to `StoreUnavailable`
pub struct DatabaseOperation;

impl DatabaseOperation {
    /// Run `operation` inside a fresh read transaction
    pub fn read<F, R>(db: &Database, operation: F) -> Result<R>
    where
        F: FnOnce(&redb::ReadTransaction) -> Result<R>,
    {
        let read_txn = db.begin_read().map_err(|e| {
            GatewayError::store_unavailable(format!("Failed to begin read transaction: {}", e))
        })?;

        operation(&read_txn)
    }

    /// Run `operation` inside a write transaction, committing only on `Ok`
    pub fn write<F, R>(db: &Database, operation: F) -> Result<R>
    where
        F: FnOnce(&redb::WriteTransaction) -> Result<R>,
    {
        let write_txn = db.begin_write().map_err(|e| {
            GatewayError::store_unavailable(format!("Failed to begin write transaction: {}", e))
        })?;

        // Dropping an uncommitted WriteTransaction aborts it
        let result = operation(&write_txn)?;

        write_txn.commit().map_err(|e| {
            GatewayError::store_unavailable(format!("Failed to commit write transaction: {}", e))
        })?;

        Ok(result)
    }
}

/// Map any redb error into a transient store failure
pub(crate) fn store_err<E: std::fmt::Display>(context: &str) -> impl FnOnce(E) -> GatewayError + '_ {
    move |e| GatewayError::store_unavailable(format!("{}: {}", context, e))
}
