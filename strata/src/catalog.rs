use crate::errors::{Result, StorageError};
use crate::heap::DbFile;
use crate::TableId;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// The table registry: maps a table id to the storage backend owning that
/// table's pages.
///
/// The catalog is plain shared state handed to the buffer pool at
/// construction; there is no process-wide singleton, so tests can wire a
/// pool to mock backends.
#[derive(Default)]
pub struct Catalog {
    files: RwLock<HashMap<TableId, Arc<dyn DbFile>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `file` under its own table id, replacing any previous
    /// backend for that table.
    pub fn register_table(&self, file: Arc<dyn DbFile>) {
        self.files
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(file.table_id(), file);
    }

    /// Looks up the backend for `table_id`.
    pub fn database_file(&self, table_id: TableId) -> Result<Arc<dyn DbFile>> {
        self.files
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&table_id)
            .cloned()
            .ok_or_else(|| StorageError::Invariant(format!("no table with id {table_id}")))
    }
}
