//! Per-peer in-memory snapshots of one table each.
//!
//! The reference chain is acyclic: a store carries cheap clones of the
//! peer context it needs (id, name, shared row lock) instead of a back
//! pointer, and the readers-writer lock guarding a peer's stores lives
//! on the `DataSet`.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;

use parking_lot::RwLock;

use heron_common::value::Value;
use heron_common::LIST_SEP_CHAR;

use crate::catalog::{Column, ColumnStorage, PeerLockMode, Table, TableName};

/// A tuple of backend column values, aligned with the table's backend
/// column indexes.
#[derive(Debug, Clone)]
pub struct DataRow {
    values: Vec<Value>,
}

impl DataRow {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Snapshot of one table from one peer.
#[derive(Debug)]
pub struct DataStore {
    pub table: Arc<Table>,
    rows: Vec<Arc<DataRow>>,
    /// Equality index over the table's primary column; values map to row
    /// positions in insertion order.
    index: HashMap<String, Vec<usize>>,
    pub peer_id: String,
    pub peer_name: String,
    pub peer_lock_mode: PeerLockMode,
    /// The owning peer's row lock, shared so writers can lock per row
    /// without reaching back into the peer.
    pub row_lock: Arc<RwLock<()>>,
}

impl DataStore {
    pub fn new(
        table: Arc<Table>,
        peer_id: impl Into<String>,
        peer_name: impl Into<String>,
        row_lock: Arc<RwLock<()>>,
    ) -> Self {
        let peer_lock_mode = table.peer_lock_mode;
        Self {
            table,
            rows: Vec::new(),
            index: HashMap::new(),
            peer_id: peer_id.into(),
            peer_name: peer_name.into(),
            peer_lock_mode,
            row_lock,
        }
    }

    /// Append one row; short rows are padded with empty values so every
    /// stored row has the table's full width.
    pub fn insert(&mut self, mut values: Vec<Value>) {
        let width = self.table.row_width();
        if values.len() < width {
            for col in &self.table.columns {
                if col.storage == ColumnStorage::Backend && col.index >= values.len() {
                    values.push(Value::empty(col.kind));
                }
            }
        }
        values.truncate(width);

        if let Some(pk) = self.table.primary_key {
            if let Some(col) = self.table.column(pk) {
                if let Some(v) = values.get(col.index) {
                    self.index
                        .entry(v.to_text())
                        .or_default()
                        .push(self.rows.len());
                }
            }
        }
        self.rows.push(Arc::new(DataRow::new(values)));
    }

    pub fn rows(&self) -> &[Arc<DataRow>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index-assisted candidate set: an equality probe on the primary
    /// column narrows the scan, anything else yields the full snapshot.
    /// Candidate order always follows insertion order.
    pub fn prefiltered(&self, pk_equals: Option<&str>) -> Vec<Arc<DataRow>> {
        if let Some(key) = pk_equals {
            if self.table.primary_key.is_some() {
                return match self.index.get(key) {
                    Some(positions) => positions.iter().map(|&i| self.rows[i].clone()).collect(),
                    None => Vec::new(),
                };
            }
        }
        self.rows.clone()
    }

    /// Resolve a column against a row, computing virtual columns from
    /// the peer context.
    pub fn value(&self, row: &DataRow, col: &Column) -> Value {
        match col.storage {
            ColumnStorage::Virtual => self.virtual_value(col),
            ColumnStorage::Backend => row
                .get(col.index)
                .cloned()
                .unwrap_or_else(|| Value::empty(col.kind)),
        }
    }

    fn virtual_value(&self, col: &Column) -> Value {
        match col.name.as_str() {
            "peer_key" => Value::Str(self.peer_id.clone()),
            "peer_name" => Value::Str(self.peer_name.clone()),
            _ => Value::empty(col.kind),
        }
    }
}

/// Per-peer container of all table stores plus the readers-writer lock
/// scanners take while reading them. Cache updaters (external to this
/// crate) take the write side.
pub struct DataSet {
    pub lock: Arc<RwLock<()>>,
    stores: RwLock<HashMap<TableName, Arc<DataStore>>>,
}

impl DataSet {
    pub fn new() -> Self {
        Self {
            lock: Arc::new(RwLock::new(())),
            stores: RwLock::new(HashMap::new()),
        }
    }

    pub fn set_store(&self, store: DataStore) {
        self.stores
            .write()
            .insert(store.table.name, Arc::new(store));
    }

    pub fn store(&self, table: TableName) -> Option<Arc<DataStore>> {
        self.stores.read().get(&table).cloned()
    }
}

impl Default for DataSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Row handle flowing through the merger: the row plus the store that
/// resolves its virtual columns and lock mode.
#[derive(Clone, Debug)]
pub struct RowRef {
    pub store: Arc<DataStore>,
    pub row: Arc<DataRow>,
}

impl RowRef {
    pub fn value(&self, col: &Column) -> Value {
        self.store.value(&self.row, col)
    }

    /// Contact-based visibility check. Rows without an auth column and
    /// requests without a user always pass.
    pub fn check_auth(&self, user: Option<&str>) -> bool {
        let user = match user {
            Some(u) if !u.is_empty() => u,
            _ => return true,
        };
        let col = match self
            .store
            .table
            .auth_column
            .and_then(|name| self.store.table.column(name))
        {
            Some(c) => c,
            None => return true,
        };
        self.value(&col).contains_entry(&Value::Str(user.to_string()))
    }

    /// Composite stats group key: the requested columns' text values
    /// joined with the reserved separator.
    pub fn stats_key(&self, columns: &[Arc<Column>]) -> String {
        if columns.is_empty() {
            return String::new();
        }
        let parts: Vec<String> = columns.iter().map(|c| self.value(c).to_text()).collect();
        let sep = LIST_SEP_CHAR.to_string();
        parts.join(&sep)
    }

    /// Serialize the row as a JSON array of the requested columns.
    pub fn write_json<W: Write>(&self, w: &mut W, columns: &[Arc<Column>]) -> io::Result<()> {
        w.write_all(b"[")?;
        for (i, col) in columns.iter().enumerate() {
            if i > 0 {
                w.write_all(b",")?;
            }
            serde_json::to_writer(&mut *w, &self.value(col))
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        }
        w.write_all(b"]")
    }
}
