//! Durable, schema-checked row store on top of redb.
//!
//! Every table lives in `<data_dir>/queue.redb`. Rows are stored as JSON
//! objects keyed by the value of their first column. Each mutation runs in its
//! own write transaction, so a row is either fully written or not at all.

use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition, TableError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::database_manager::{store_err, DatabaseManager, DatabaseOperation};
use crate::error::{GatewayError, Result};

/// File name of the queue database inside the data directory
pub const QUEUE_DB_FILE: &str = "queue.redb";

const SCHEMA_TABLE: TableDefinition<&str, &str> = TableDefinition::new("__schema");

/// Column value types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Text,
    Integer,
    Real,
    Boolean,
}

impl ColumnType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            ColumnType::Text => value.is_string(),
            ColumnType::Integer => value.is_i64() || value.is_u64(),
            ColumnType::Real => value.is_number(),
            ColumnType::Boolean => value.is_boolean(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

/// One row: column name to JSON value
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueRow(Map<String, Value>);

impl QueueRow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter
    pub fn with(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<Value>) {
        self.0.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    pub fn columns(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }
}

/// Crash-safe table of rows with a fixed column schema
#[derive(Clone)]
pub struct DurableQueueStore {
    db: Arc<Database>,
    db_path: PathBuf,
    table_name: String,
    columns: Arc<Vec<Column>>,
}

impl std::fmt::Debug for DurableQueueStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueueStore")
            .field("db_path", &self.db_path)
            .field("table_name", &self.table_name)
            .field("columns", &self.columns)
            .finish()
    }
}

impl DurableQueueStore {
    /// Open (or create) `table_name` in the queue database under `data_dir`.
    ///
    /// The schema is recorded on first creation. Reopening with a different
    /// column list fails with `SchemaMismatch`; existing tables are never altered.
    pub fn open(data_dir: &Path, table_name: &str, columns: Vec<Column>) -> Result<Self> {
        validate_schema(table_name, &columns)?;

        std::fs::create_dir_all(data_dir).map_err(|e| {
            GatewayError::store_unavailable(format!(
                "Failed to create data directory {}: {}",
                data_dir.display(),
                e
            ))
        })?;

        let db_path = data_dir.join(QUEUE_DB_FILE);
        let db = DatabaseManager::global().get_or_create_database(&db_path)?;

        let encoded = serde_json::to_string(&columns)?;
        DatabaseOperation::write(&db, |txn| {
            let mut schema = txn
                .open_table(SCHEMA_TABLE)
                .map_err(store_err("Failed to open schema table"))?;

            let recorded = schema
                .get(table_name)
                .map_err(store_err("Failed to read schema"))?
                .map(|guard| guard.value().to_string());

            match recorded {
                Some(recorded) => {
                    let recorded: Vec<Column> = serde_json::from_str(&recorded)?;
                    if recorded != columns {
                        return Err(GatewayError::SchemaMismatch {
                            table: table_name.to_string(),
                            reason: format!(
                                "recorded columns [{}], requested [{}]",
                                column_list(&recorded),
                                column_list(&columns)
                            ),
                        });
                    }
                }
                None => {
                    schema
                        .insert(table_name, encoded.as_str())
                        .map_err(store_err("Failed to record schema"))?;
                    tracing::info!("📋 Created queue table '{}'", table_name);
                }
            }

            let table_def: TableDefinition<&str, &str> = TableDefinition::new(table_name);
            txn.open_table(table_def)
                .map_err(store_err("Failed to create table"))?;
            Ok(())
        })?;

        Ok(Self {
            db,
            db_path,
            table_name: table_name.to_string(),
            columns: Arc::new(columns),
        })
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Path of the backing database file
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn table_def(&self) -> TableDefinition<'_, &'static str, &'static str> {
        TableDefinition::new(&self.table_name)
    }

    fn key_column(&self) -> &str {
        // validate_schema guarantees at least one column
        self.columns.first().map(|c| c.name.as_str()).unwrap_or_default()
    }

    /// Check a row against the schema and return its key
    pub fn validate_row(&self, row: &QueueRow) -> Result<String> {
        for name in row.columns() {
            if !self.columns.iter().any(|c| &c.name == name) {
                return Err(GatewayError::invalid_argument(format!(
                    "Unknown column '{}' for table '{}'",
                    name, self.table_name
                )));
            }
        }

        for (index, column) in self.columns.iter().enumerate() {
            let value = row.get(&column.name).ok_or_else(|| {
                GatewayError::invalid_argument(format!(
                    "Missing column '{}' for table '{}'",
                    column.name, self.table_name
                ))
            })?;

            if value.is_null() {
                if index == 0 {
                    return Err(GatewayError::invalid_argument(format!(
                        "Key column '{}' cannot be null",
                        column.name
                    )));
                }
                continue;
            }

            if !column.column_type.accepts(value) {
                return Err(GatewayError::invalid_argument(format!(
                    "Column '{}' expects {:?}, got {}",
                    column.name, column.column_type, value
                )));
            }
        }

        row.get_str(self.key_column())
            .map(str::to_string)
            .ok_or_else(|| GatewayError::invalid_argument("Key column must be text"))
    }

    /// Insert a new row; fails with `DuplicateKey` if the key exists
    pub fn insert(&self, row: &QueueRow) -> Result<()> {
        let key = self.validate_row(row)?;
        let encoded = serde_json::to_string(row)?;

        DatabaseOperation::write(&self.db, |txn| {
            let mut table = txn
                .open_table(self.table_def())
                .map_err(store_err("Failed to open table"))?;
            let exists = table
                .get(key.as_str())
                .map_err(store_err("Failed to read row"))?
                .is_some();
            if exists {
                return Err(GatewayError::DuplicateKey(key.clone()));
            }
            table
                .insert(key.as_str(), encoded.as_str())
                .map_err(store_err("Failed to insert row"))?;
            Ok(())
        })
    }

    /// Insert or replace a row
    pub fn upsert(&self, row: &QueueRow) -> Result<()> {
        let key = self.validate_row(row)?;
        let encoded = serde_json::to_string(row)?;

        DatabaseOperation::write(&self.db, |txn| {
            let mut table = txn
                .open_table(self.table_def())
                .map_err(store_err("Failed to open table"))?;
            table
                .insert(key.as_str(), encoded.as_str())
                .map_err(store_err("Failed to write row"))?;
            Ok(())
        })
    }

    pub fn get(&self, key: &str) -> Result<Option<QueueRow>> {
        let raw = DatabaseOperation::read(&self.db, |txn| {
            let table = match txn.open_table(self.table_def()) {
                Ok(table) => table,
                Err(TableError::TableDoesNotExist(_)) => return Ok(None),
                Err(e) => return Err(store_err("Failed to open table")(e)),
            };
            let raw = table
                .get(key)
                .map_err(store_err("Failed to read row"))?
                .map(|guard| guard.value().to_string());
            Ok(raw)
        })?;

        raw.map(|raw| serde_json::from_str(&raw).map_err(GatewayError::from))
            .transpose()
    }

    /// Delete a row; returns whether it existed
    pub fn remove(&self, key: &str) -> Result<bool> {
        DatabaseOperation::write(&self.db, |txn| {
            let mut table = txn
                .open_table(self.table_def())
                .map_err(store_err("Failed to open table"))?;
            let removed = table
                .remove(key)
                .map_err(store_err("Failed to remove row"))?
                .is_some();
            Ok(removed)
        })
    }

    pub fn len(&self) -> Result<u64> {
        DatabaseOperation::read(&self.db, |txn| {
            let table = txn
                .open_table(self.table_def())
                .map_err(store_err("Failed to open table"))?;
            table.len().map_err(store_err("Failed to count rows"))
        })
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn keys(&self) -> Result<Vec<String>> {
        DatabaseOperation::read(&self.db, |txn| {
            let table = txn
                .open_table(self.table_def())
                .map_err(store_err("Failed to open table"))?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(store_err("Failed to iterate table"))? {
                let (key, _) = entry.map_err(store_err("Failed to read key"))?;
                keys.push(key.value().to_string());
            }
            Ok(keys)
        })
    }

    /// Lazily iterate over all rows.
    ///
    /// The key list is taken up front; each row is then read in its own
    /// transaction. Rows removed after the snapshot are skipped.
    pub fn enumerate(&self) -> Result<RowIter> {
        Ok(RowIter {
            store: self.clone(),
            keys: self.keys()?.into_iter(),
        })
    }

    /// Atomic read-modify-write of one row.
    ///
    /// `f` sees the current row and returns the replacement, or `None` to
    /// leave it untouched. Returns the written row.
    pub fn update_if<F>(&self, key: &str, f: F) -> Result<Option<QueueRow>>
    where
        F: FnOnce(QueueRow) -> Option<QueueRow>,
    {
        DatabaseOperation::write(&self.db, |txn| {
            let mut table = txn
                .open_table(self.table_def())
                .map_err(store_err("Failed to open table"))?;

            let current = table
                .get(key)
                .map_err(store_err("Failed to read row"))?
                .map(|guard| guard.value().to_string());
            let Some(current) = current else {
                return Ok(None);
            };

            let current: QueueRow = serde_json::from_str(&current)?;
            let Some(updated) = f(current) else {
                return Ok(None);
            };

            let new_key = self.validate_row(&updated)?;
            if new_key != key {
                return Err(GatewayError::invalid_argument(format!(
                    "update_if cannot change the key ('{}' -> '{}')",
                    key, new_key
                )));
            }

            let encoded = serde_json::to_string(&updated)?;
            table
                .insert(key, encoded.as_str())
                .map_err(store_err("Failed to write row"))?;
            Ok(Some(updated))
        })
    }

    /// Move a row into `target` in one transaction. Both stores must share a
    /// database file and the target schema must accept the row.
    pub fn move_to(&self, key: &str, target: &DurableQueueStore) -> Result<bool> {
        if !Arc::ptr_eq(&self.db, &target.db) {
            return Err(GatewayError::invalid_argument(
                "Rows can only be moved between tables of the same database",
            ));
        }

        DatabaseOperation::write(&self.db, |txn| {
            let mut source = txn
                .open_table(self.table_def())
                .map_err(store_err("Failed to open source table"))?;
            let raw = source
                .remove(key)
                .map_err(store_err("Failed to remove row"))?
                .map(|guard| guard.value().to_string());
            let Some(raw) = raw else {
                return Ok(false);
            };

            let row: QueueRow = serde_json::from_str(&raw)?;
            target.validate_row(&row)?;

            let mut dest = txn
                .open_table(target.table_def())
                .map_err(store_err("Failed to open target table"))?;
            dest.insert(key, raw.as_str())
                .map_err(store_err("Failed to write row"))?;
            Ok(true)
        })
    }

    /// Delete every row
    pub fn clear(&self) -> Result<u64> {
        let keys = self.keys()?;
        DatabaseOperation::write(&self.db, |txn| {
            let mut table = txn
                .open_table(self.table_def())
                .map_err(store_err("Failed to open table"))?;
            let mut removed = 0;
            for key in &keys {
                if table
                    .remove(key.as_str())
                    .map_err(store_err("Failed to remove row"))?
                    .is_some()
                {
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }
}

/// Lazy row iterator returned by `DurableQueueStore::enumerate`
pub struct RowIter {
    store: DurableQueueStore,
    keys: std::vec::IntoIter<String>,
}

impl Iterator for RowIter {
    type Item = Result<QueueRow>;

    fn next(&mut self) -> Option<Self::Item> {
        for key in self.keys.by_ref() {
            match self.store.get(&key) {
                Ok(Some(row)) => return Some(Ok(row)),
                Ok(None) => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        None
    }
}

fn validate_schema(table_name: &str, columns: &[Column]) -> Result<()> {
    if table_name.trim().is_empty() {
        return Err(GatewayError::invalid_argument("Table name cannot be empty"));
    }
    if table_name == "__schema" {
        return Err(GatewayError::invalid_argument("Table name '__schema' is reserved"));
    }
    if columns.is_empty() {
        return Err(GatewayError::invalid_argument(format!(
            "Table '{}' needs at least one column",
            table_name
        )));
    }
    if columns[0].column_type != ColumnType::Text {
        return Err(GatewayError::invalid_argument("The key column must be Text"));
    }

    let mut seen = HashSet::new();
    for column in columns {
        if column.name.trim().is_empty() {
            return Err(GatewayError::invalid_argument("Column names cannot be empty"));
        }
        if !seen.insert(column.name.as_str()) {
            return Err(GatewayError::invalid_argument(format!(
                "Duplicate column '{}'",
                column.name
            )));
        }
    }
    Ok(())
}

fn column_list(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|c| format!("{}:{:?}", c.name, c.column_type))
        .collect::<Vec<_>>()
        .join(", ")
}
