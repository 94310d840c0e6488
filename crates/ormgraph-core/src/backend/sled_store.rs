//! Rows persisted in a sled database.
//!
//! Each row lives in the `rows` tree under `table \0 rkyv(key)`; the value
//! is an rkyv-encoded [`StoredRow`]. Table metadata (key column and
//! declared columns) lives in the `tables` tree. A transaction stages its
//! writes per connection and applies them as one `sled::Batch` on commit.

use std::collections::BTreeMap;
use std::path::Path;

use ormgraph_proto::{
    BackendCapabilities, BackendError, BatchResult, ColumnValue, LockMode, ResultSet,
    SelectPlan, Statement, Value,
};
use rkyv::util::AlignedVec;
use rkyv::{Archive, Deserialize, Serialize};
use sled::{Db, Tree};
use tracing::{debug, trace};

use super::eval::{self, Row, RowSource};
use super::{Backend, ConnectionSource};
use crate::catalog::Definitions;

/// Tree name for row data.
const ROWS_TREE: &str = "rows";

/// Tree name for table metadata.
const TABLES_TREE: &str = "tables";

/// Separator between table name and encoded key.
const KEY_SEPARATOR: u8 = 0;

/// A stored row: parallel column names and values.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
struct StoredRow {
    columns: Vec<String>,
    values: Vec<Value>,
}

/// Metadata of one table.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
struct TableMeta {
    key_column: String,
    columns: Vec<String>,
}

fn storage(e: sled::Error) -> BackendError {
    BackendError::Connection(e.to_string())
}

fn codec(e: rkyv::rancor::Error) -> BackendError {
    ormgraph_proto::Error::Serialization(e.to_string()).into()
}

fn decode_error(e: rkyv::rancor::Error) -> BackendError {
    ormgraph_proto::Error::Deserialization(e.to_string()).into()
}

/// Copy into an aligned buffer; sled hands out unaligned slices.
fn aligned(bytes: &[u8]) -> AlignedVec {
    let mut buf = AlignedVec::with_capacity(bytes.len());
    buf.extend_from_slice(bytes);
    buf
}

impl StoredRow {
    fn from_row(row: &Row) -> Self {
        let mut entries: Vec<(&String, &Value)> = row.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        Self {
            columns: entries.iter().map(|(c, _)| (*c).clone()).collect(),
            values: entries.into_iter().map(|(_, v)| v.clone()).collect(),
        }
    }

    fn into_row(self) -> Row {
        self.columns.into_iter().zip(self.values).collect()
    }

    fn to_bytes(&self) -> Result<Vec<u8>, BackendError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(codec)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, BackendError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned(bytes)).map_err(decode_error)
    }
}

impl TableMeta {
    fn to_bytes(&self) -> Result<Vec<u8>, BackendError> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(codec)
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, BackendError> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(&aligned(bytes)).map_err(decode_error)
    }
}

/// A sled-backed row store.
///
/// Clones share the database; each clone is a connection with its own
/// staged transaction. Uncommitted writes are visible only to the
/// connection that made them.
pub struct SledBackend {
    db: Db,
    rows: Tree,
    tables: Tree,
    staged: Option<BTreeMap<Vec<u8>, Option<StoredRow>>>,
    capabilities: BackendCapabilities,
}

impl Clone for SledBackend {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            rows: self.rows.clone(),
            tables: self.tables.clone(),
            staged: None,
            capabilities: self.capabilities,
        }
    }
}

impl std::fmt::Debug for SledBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SledBackend")
            .field("rows", &self.rows.len())
            .field("tables", &self.tables.len())
            .field("in_transaction", &self.staged.is_some())
            .finish()
    }
}

impl SledBackend {
    /// Open (or create) a database at `path` with one table per entity type.
    pub fn open(path: impl AsRef<Path>, definitions: &Definitions) -> Result<Self, BackendError> {
        let db = sled::open(path).map_err(storage)?;
        Self::from_db(db, definitions)
    }

    /// Create a throw-away database that is removed on drop.
    pub fn temporary(definitions: &Definitions) -> Result<Self, BackendError> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(storage)?;
        Self::from_db(db, definitions)
    }

    fn from_db(db: Db, definitions: &Definitions) -> Result<Self, BackendError> {
        let backend = Self {
            rows: db.open_tree(ROWS_TREE).map_err(storage)?,
            tables: db.open_tree(TABLES_TREE).map_err(storage)?,
            db,
            staged: None,
            capabilities: BackendCapabilities {
                supports_multiple_result_sets: true,
                supports_batch_update_counts: true,
                flags_all_operations_as_failed_on_batch_update_exception: false,
                supports_select_for_update: true,
                supports_select_for_update_wait_n: false,
            },
        };
        for ty in definitions.types() {
            let columns = ty
                .column_fields()
                .filter_map(|(_, f)| f.column.clone())
                .collect();
            backend.create_table(&ty.table, ty.primary_key_column(), columns)?;
        }
        Ok(backend)
    }

    /// Create or redefine a table. Existing rows are kept.
    pub fn create_table(
        &self,
        name: &str,
        key_column: &str,
        columns: Vec<String>,
    ) -> Result<(), BackendError> {
        let meta = TableMeta {
            key_column: key_column.to_string(),
            columns,
        };
        self.tables
            .insert(name.as_bytes(), meta.to_bytes()?)
            .map_err(storage)?;
        debug!(table = name, key_column, "Table created");
        Ok(())
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), BackendError> {
        self.db.flush().map(|_| ()).map_err(storage)
    }

    fn meta(&self, table: &str) -> Result<TableMeta, BackendError> {
        let bytes = self
            .tables
            .get(table.as_bytes())
            .map_err(storage)?
            .ok_or_else(|| BackendError::UnknownTable(table.to_string()))?;
        TableMeta::from_bytes(&bytes)
    }

    fn prefix(table: &str) -> Vec<u8> {
        let mut prefix = table.as_bytes().to_vec();
        prefix.push(KEY_SEPARATOR);
        prefix
    }

    fn row_key(table: &str, key: &Value) -> Result<Vec<u8>, BackendError> {
        let mut bytes = Self::prefix(table);
        let encoded = rkyv::to_bytes::<rkyv::rancor::Error>(key).map_err(codec)?;
        bytes.extend_from_slice(&encoded);
        Ok(bytes)
    }

    fn load(&self, key: &[u8]) -> Result<Option<StoredRow>, BackendError> {
        if let Some(staged) = self.staged.as_ref().and_then(|s| s.get(key)) {
            return Ok(staged.clone());
        }
        match self.rows.get(key).map_err(storage)? {
            Some(bytes) => StoredRow::from_bytes(&bytes).map(Some),
            None => Ok(None),
        }
    }

    fn store(&mut self, key: Vec<u8>, row: Option<StoredRow>) -> Result<(), BackendError> {
        if let Some(staged) = self.staged.as_mut() {
            staged.insert(key, row);
            return Ok(());
        }
        match row {
            Some(row) => {
                self.rows.insert(key, row.to_bytes()?).map_err(storage)?;
            }
            None => {
                self.rows.remove(key).map_err(storage)?;
            }
        }
        Ok(())
    }

    fn check_columns<'a>(
        meta: &TableMeta,
        table: &str,
        mut columns: impl Iterator<Item = &'a String>,
    ) -> Result<(), BackendError> {
        match columns.find(|c| !meta.columns.contains(c)) {
            Some(column) if !meta.columns.is_empty() => Err(BackendError::UnknownColumn {
                table: table.to_string(),
                column: column.clone(),
            }),
            _ => Ok(()),
        }
    }

    fn guard_holds(row: &Row, expect: Option<&ColumnValue>) -> bool {
        let Some(expect) = expect else {
            return true;
        };
        let stored = row.get(&expect.column).unwrap_or(&Value::Null);
        stored.matches(&expect.value) || (stored.is_null() && expect.value.is_null())
    }

    fn check_lock(&self, lock: LockMode) -> Result<(), BackendError> {
        match lock {
            LockMode::None => Ok(()),
            LockMode::ForUpdate if self.capabilities.supports_select_for_update => Ok(()),
            LockMode::ForUpdateWait(_) if self.capabilities.supports_select_for_update_wait_n => {
                Ok(())
            }
            other => Err(BackendError::Unsupported(format!("lock mode {other:?}"))),
        }
    }
}

impl RowSource for SledBackend {
    fn scan(&self, table: &str) -> Result<Vec<Row>, BackendError> {
        self.meta(table)?;
        let prefix = Self::prefix(table);
        let mut rows = BTreeMap::new();
        for item in self.rows.scan_prefix(&prefix) {
            let (key, bytes) = item.map_err(storage)?;
            rows.insert(key.to_vec(), StoredRow::from_bytes(&bytes)?);
        }
        if let Some(staged) = &self.staged {
            for (key, row) in staged.range(prefix.clone()..) {
                if !key.starts_with(&prefix) {
                    break;
                }
                match row {
                    Some(row) => rows.insert(key.clone(), row.clone()),
                    None => rows.remove(key),
                };
            }
        }
        Ok(rows.into_values().map(StoredRow::into_row).collect())
    }
}

impl Backend for SledBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn select(&mut self, plan: &SelectPlan) -> Result<ResultSet, BackendError> {
        self.check_lock(plan.lock)?;
        eval::select(&*self, plan)
    }

    fn execute(&mut self, statement: &Statement) -> Result<u64, BackendError> {
        let table = statement.table();
        let meta = self.meta(table)?;
        let rows = match statement {
            Statement::Insert { values, .. } => {
                Self::check_columns(&meta, table, values.iter().map(|cv| &cv.column))?;
                let key = values
                    .iter()
                    .find(|cv| cv.column == meta.key_column)
                    .map(|cv| &cv.value)
                    .filter(|v| !v.is_null())
                    .ok_or_else(|| BackendError::UnknownColumn {
                        table: table.to_string(),
                        column: meta.key_column.clone(),
                    })?;
                let row_key = Self::row_key(table, key)?;
                if self.load(&row_key)?.is_some() {
                    return Err(BackendError::DuplicateKey {
                        table: table.to_string(),
                        key: key.to_string(),
                    });
                }
                let row: Row = values
                    .iter()
                    .map(|cv| (cv.column.clone(), cv.value.clone()))
                    .collect();
                self.store(row_key, Some(StoredRow::from_row(&row)))?;
                1
            }
            Statement::Update {
                key, set, expect, ..
            } => {
                Self::check_columns(&meta, table, set.iter().map(|cv| &cv.column))?;
                let row_key = Self::row_key(table, &key.value)?;
                match self.load(&row_key)?.map(StoredRow::into_row) {
                    Some(mut row) if Self::guard_holds(&row, expect.as_ref()) => {
                        for cv in set {
                            row.insert(cv.column.clone(), cv.value.clone());
                        }
                        self.store(row_key, Some(StoredRow::from_row(&row)))?;
                        1
                    }
                    _ => 0,
                }
            }
            Statement::Delete { key, expect, .. } => {
                let row_key = Self::row_key(table, &key.value)?;
                match self.load(&row_key)?.map(StoredRow::into_row) {
                    Some(row) if Self::guard_holds(&row, expect.as_ref()) => {
                        self.store(row_key, None)?;
                        1
                    }
                    _ => 0,
                }
            }
        };
        trace!(kind = statement.kind(), table, rows, "Statement executed");
        Ok(rows)
    }

    fn execute_batch(&mut self, statements: &[Statement]) -> BatchResult {
        super::execute_each(self, statements)
    }

    fn begin(&mut self) -> Result<(), BackendError> {
        if self.staged.is_some() {
            return Err(BackendError::Transaction("transaction already open".into()));
        }
        self.staged = Some(BTreeMap::new());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| BackendError::Transaction("no open transaction".into()))?;
        let mut batch = sled::Batch::default();
        let writes = staged.len();
        for (key, row) in staged {
            match row {
                Some(row) => batch.insert(key, row.to_bytes()?),
                None => batch.remove(key),
            }
        }
        self.rows.apply_batch(batch).map_err(storage)?;
        debug!(writes, "Transaction committed");
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| BackendError::Transaction("no open transaction".into()))?;
        debug!(discarded = staged.len(), "Transaction rolled back");
        Ok(())
    }
}

impl ConnectionSource for SledBackend {
    fn acquire(&self) -> Result<Box<dyn Backend>, BackendError> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormgraph_proto::{ColumnRef, TableRef};

    fn backend() -> SledBackend {
        let backend = SledBackend::temporary(&Definitions::new()).unwrap();
        backend
            .create_table("app_user", "id", vec!["id".into(), "name".into()])
            .unwrap();
        backend
    }

    fn insert(id: i64, name: &str) -> Statement {
        Statement::Insert {
            table: "app_user".into(),
            values: vec![ColumnValue::new("id", id), ColumnValue::new("name", name)],
        }
    }

    fn names(backend: &mut SledBackend) -> Vec<Value> {
        let mut plan = SelectPlan::new(TableRef::new("app_user", "a"));
        plan.columns = vec![ColumnRef::new("a", "name")];
        backend
            .select(&plan)
            .unwrap()
            .rows
            .into_iter()
            .flatten()
            .collect()
    }

    #[test]
    fn test_staged_writes_visible_to_own_connection() {
        let mut a = backend();
        let mut b = a.clone();

        a.begin().unwrap();
        a.execute(&insert(1, "Ann")).unwrap();
        assert_eq!(names(&mut a), vec![Value::from("Ann")]);
        assert!(names(&mut b).is_empty());

        a.commit().unwrap();
        assert_eq!(names(&mut b), vec![Value::from("Ann")]);
    }

    #[test]
    fn test_rollback_discards_staged_rows() {
        let mut db = backend();
        db.execute(&insert(1, "Ann")).unwrap();

        db.begin().unwrap();
        db.execute(&Statement::Delete {
            table: "app_user".into(),
            key: ColumnValue::new("id", 1i64),
            expect: None,
        })
        .unwrap();
        assert!(names(&mut db).is_empty());
        db.rollback().unwrap();

        assert_eq!(names(&mut db), vec![Value::from("Ann")]);
    }

    #[test]
    fn test_rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut db = SledBackend::open(dir.path(), &Definitions::new()).unwrap();
            db.create_table("app_user", "id", Vec::new()).unwrap();
            db.execute(&insert(7, "Eve")).unwrap();
            db.flush().unwrap();
        }
        let mut db = SledBackend::open(dir.path(), &Definitions::new()).unwrap();
        assert_eq!(names(&mut db), vec![Value::from("Eve")]);
        assert!(matches!(
            db.execute(&insert(7, "Eve")),
            Err(BackendError::DuplicateKey { .. })
        ));
    }
}
