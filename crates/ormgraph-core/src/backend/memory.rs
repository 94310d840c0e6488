//! Shared in-memory row store.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ormgraph_proto::{
    BackendCapabilities, BackendError, BatchResult, ColumnValue, LockMode, ResultSet,
    SelectPlan, Statement, Value,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use super::eval::{self, Row, RowSource};
use super::{Backend, ConnectionSource};
use crate::catalog::Definitions;

#[derive(Debug, Clone, Default)]
struct Table {
    key_column: String,
    /// Declared columns; empty accepts any column.
    columns: Vec<String>,
    /// Rows by insertion sequence.
    rows: BTreeMap<u64, Row>,
    index: HashMap<Value, u64>,
    next_seq: u64,
}

impl Table {
    fn check_columns<'a>(
        &self,
        name: &str,
        columns: impl Iterator<Item = &'a String>,
    ) -> Result<(), BackendError> {
        if self.columns.is_empty() {
            return Ok(());
        }
        for column in columns {
            if !self.columns.contains(column) {
                return Err(BackendError::UnknownColumn {
                    table: name.to_string(),
                    column: column.clone(),
                });
            }
        }
        Ok(())
    }

    fn guard_holds(&self, seq: u64, expect: Option<&ColumnValue>) -> bool {
        let Some(expect) = expect else {
            return true;
        };
        let stored = self
            .rows
            .get(&seq)
            .and_then(|r| r.get(&expect.column))
            .unwrap_or(&Value::Null);
        stored.matches(&expect.value) || (stored.is_null() && expect.value.is_null())
    }
}

#[derive(Debug, Default)]
struct Store {
    tables: BTreeMap<String, Table>,
}

impl Store {
    fn table_mut(&mut self, name: &str) -> Result<&mut Table, BackendError> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| BackendError::UnknownTable(name.to_string()))
    }
}

impl RowSource for Store {
    fn scan(&self, table: &str) -> Result<Vec<Row>, BackendError> {
        self.tables
            .get(table)
            .map(|t| t.rows.values().cloned().collect())
            .ok_or_else(|| BackendError::UnknownTable(table.to_string()))
    }
}

/// Undo record of one applied write.
#[derive(Debug)]
enum Undo {
    Inserted { table: String, key: Value },
    Updated { table: String, seq: u64, row: Row },
    Deleted { table: String, key: Value, seq: u64, row: Row },
}

/// In-memory relational store.
///
/// Clones share the same tables; each clone is an independent connection
/// with its own transaction. Writes apply immediately and are undone on
/// rollback, so concurrent connections see committed and uncommitted data
/// alike. Outside a transaction every statement commits on its own.
#[derive(Debug)]
pub struct MemoryBackend {
    store: Arc<RwLock<Store>>,
    capabilities: BackendCapabilities,
    undo: Option<Vec<Undo>>,
    log: Arc<Mutex<Vec<Statement>>>,
    round_trips: Arc<AtomicUsize>,
    acquisitions: Arc<AtomicUsize>,
}

impl Clone for MemoryBackend {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            capabilities: self.capabilities,
            undo: None,
            log: Arc::clone(&self.log),
            round_trips: Arc::clone(&self.round_trips),
            acquisitions: Arc::clone(&self.acquisitions),
        }
    }
}

impl MemoryBackend {
    /// Create an empty store with full capabilities.
    pub fn new() -> Self {
        Self::with_capabilities(BackendCapabilities::full())
    }

    /// Create an empty store reporting the given capabilities.
    pub fn with_capabilities(capabilities: BackendCapabilities) -> Self {
        Self {
            store: Arc::new(RwLock::new(Store::default())),
            capabilities,
            undo: None,
            log: Arc::new(Mutex::new(Vec::new())),
            round_trips: Arc::new(AtomicUsize::new(0)),
            acquisitions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create a store with one table per entity type of the catalog.
    pub fn for_definitions(definitions: &Definitions) -> Self {
        let backend = Self::new();
        backend.create_tables(definitions);
        backend
    }

    /// Create one table per entity type of the catalog.
    pub fn create_tables(&self, definitions: &Definitions) {
        for ty in definitions.types() {
            let columns = ty
                .column_fields()
                .filter_map(|(_, f)| f.column.clone())
                .collect();
            self.create_table(&ty.table, ty.primary_key_column(), columns);
        }
    }

    /// Create (or replace) a table.
    pub fn create_table(&self, name: &str, key_column: &str, columns: Vec<String>) {
        let table = Table {
            key_column: key_column.to_string(),
            columns,
            ..Table::default()
        };
        self.store.write().tables.insert(name.to_string(), table);
        debug!(table = name, key_column, "Table created");
    }

    /// A connection handle sharing this store but reporting other
    /// capabilities.
    pub fn reconfigured(&self, capabilities: BackendCapabilities) -> Self {
        let mut handle = self.clone();
        handle.capabilities = capabilities;
        handle
    }

    /// All rows of a table, in insertion order.
    pub fn rows(&self, table: &str) -> Vec<HashMap<String, Value>> {
        self.store.read().scan(table).unwrap_or_default()
    }

    /// One row by primary key.
    pub fn row(&self, table: &str, key: &Value) -> Option<HashMap<String, Value>> {
        let store = self.store.read();
        let table = store.tables.get(table)?;
        let seq = table.index.get(key)?;
        table.rows.get(seq).cloned()
    }

    /// Write statements executed so far (by every handle of this store).
    pub fn statement_log(&self) -> Vec<Statement> {
        self.log.lock().clone()
    }

    /// Forget the statement log.
    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    /// Number of select round trips made so far.
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::Relaxed)
    }

    /// Number of connections handed out through [`ConnectionSource`].
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::Relaxed)
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

    fn apply(&mut self, statement: &Statement) -> Result<(u64, Option<Undo>), BackendError> {
        let mut store = self.store.write();
        match statement {
            Statement::Insert { table, values } => {
                let t = store.table_mut(table)?;
                t.check_columns(table, values.iter().map(|cv| &cv.column))?;
                let key = values
                    .iter()
                    .find(|cv| cv.column == t.key_column)
                    .map(|cv| cv.value.clone())
                    .filter(|v| !v.is_null())
                    .ok_or_else(|| BackendError::UnknownColumn {
                        table: table.clone(),
                        column: t.key_column.clone(),
                    })?;
                if t.index.contains_key(&key) {
                    return Err(BackendError::DuplicateKey {
                        table: table.clone(),
                        key: key.to_string(),
                    });
                }
                let seq = t.next_seq;
                t.next_seq += 1;
                let row: Row = values
                    .iter()
                    .map(|cv| (cv.column.clone(), cv.value.clone()))
                    .collect();
                t.rows.insert(seq, row);
                t.index.insert(key.clone(), seq);
                Ok((
                    1,
                    Some(Undo::Inserted {
                        table: table.clone(),
                        key,
                    }),
                ))
            }
            Statement::Update {
                table,
                key,
                set,
                expect,
            } => {
                let t = store.table_mut(table)?;
                t.check_columns(table, set.iter().map(|cv| &cv.column))?;
                let Some(&seq) = t.index.get(&key.value) else {
                    return Ok((0, None));
                };
                if !t.guard_holds(seq, expect.as_ref()) {
                    return Ok((0, None));
                }
                let Some(row) = t.rows.get_mut(&seq) else {
                    return Ok((0, None));
                };
                let before = row.clone();
                for cv in set {
                    row.insert(cv.column.clone(), cv.value.clone());
                }
                Ok((
                    1,
                    Some(Undo::Updated {
                        table: table.clone(),
                        seq,
                        row: before,
                    }),
                ))
            }
            Statement::Delete { table, key, expect } => {
                let t = store.table_mut(table)?;
                let Some(&seq) = t.index.get(&key.value) else {
                    return Ok((0, None));
                };
                if !t.guard_holds(seq, expect.as_ref()) {
                    return Ok((0, None));
                }
                t.index.remove(&key.value);
                let row = t.rows.remove(&seq).unwrap_or_default();
                Ok((
                    1,
                    Some(Undo::Deleted {
                        table: table.clone(),
                        key: key.value.clone(),
                        seq,
                        row,
                    }),
                ))
            }
        }
    }

    fn revert(&self, undo: Vec<Undo>) {
        let mut store = self.store.write();
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Inserted { table, key } => {
                    if let Some(t) = store.tables.get_mut(&table) {
                        if let Some(seq) = t.index.remove(&key) {
                            t.rows.remove(&seq);
                        }
                    }
                }
                Undo::Updated { table, seq, row } => {
                    if let Some(t) = store.tables.get_mut(&table) {
                        t.rows.insert(seq, row);
                    }
                }
                Undo::Deleted {
                    table,
                    key,
                    seq,
                    row,
                } => {
                    if let Some(t) = store.tables.get_mut(&table) {
                        t.rows.insert(seq, row);
                        t.index.insert(key, seq);
                    }
                }
            }
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    fn select(&mut self, plan: &SelectPlan) -> Result<ResultSet, BackendError> {
        self.check_lock(plan.lock)?;
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        let store = self.store.read();
        eval::select(&*store, plan)
    }

    fn select_many(&mut self, plans: &[SelectPlan]) -> Result<Vec<ResultSet>, BackendError> {
        if !self.capabilities.supports_multiple_result_sets {
            return Err(BackendError::Unsupported("multiple result sets".into()));
        }
        for plan in plans {
            self.check_lock(plan.lock)?;
        }
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        let store = self.store.read();
        plans.iter().map(|plan| eval::select(&*store, plan)).collect()
    }

    fn execute(&mut self, statement: &Statement) -> Result<u64, BackendError> {
        let (rows, undo) = self.apply(statement)?;
        if let (Some(log), Some(undo)) = (self.undo.as_mut(), undo) {
            log.push(undo);
        }
        self.log.lock().push(statement.clone());
        trace!(kind = statement.kind(), table = statement.table(), rows, "Statement executed");
        Ok(rows)
    }

    fn execute_batch(&mut self, statements: &[Statement]) -> BatchResult {
        super::execute_each(self, statements)
    }

    fn begin(&mut self) -> Result<(), BackendError> {
        if self.undo.is_some() {
            return Err(BackendError::Transaction("transaction already open".into()));
        }
        self.undo = Some(Vec::new());
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        match self.undo.take() {
            Some(_) => Ok(()),
            None => Err(BackendError::Transaction("no open transaction".into())),
        }
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        let undo = self
            .undo
            .take()
            .ok_or_else(|| BackendError::Transaction("no open transaction".into()))?;
        let reverted = undo.len();
        self.revert(undo);
        debug!(reverted, "Transaction rolled back");
        Ok(())
    }
}

impl ConnectionSource for MemoryBackend {
    fn acquire(&self) -> Result<Box<dyn Backend>, BackendError> {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormgraph_proto::StatementStatus;

    fn backend() -> MemoryBackend {
        let backend = MemoryBackend::new();
        backend.create_table("app_user", "id", vec!["id".into(), "name".into(), "version".into()]);
        backend
    }

    fn insert(id: i64, name: &str) -> Statement {
        Statement::Insert {
            table: "app_user".into(),
            values: vec![
                ColumnValue::new("id", id),
                ColumnValue::new("name", name),
                ColumnValue::new("version", 0i64),
            ],
        }
    }

    #[test]
    fn test_duplicate_key_rejected() {
        let mut db = backend();
        db.execute(&insert(1, "Ann")).unwrap();
        let err = db.execute(&insert(1, "Bob")).unwrap_err();
        assert!(matches!(err, BackendError::DuplicateKey { .. }));
    }

    #[test]
    fn test_guarded_update() {
        let mut db = backend();
        db.execute(&insert(1, "Ann")).unwrap();
        let update = |version: i64| Statement::Update {
            table: "app_user".into(),
            key: ColumnValue::new("id", 1i64),
            set: vec![ColumnValue::new("name", "Anna"), ColumnValue::new("version", version + 1)],
            expect: Some(ColumnValue::new("version", version)),
        };

        assert_eq!(db.execute(&update(0)).unwrap(), 1);
        assert_eq!(db.execute(&update(0)).unwrap(), 0);
        let row = db.row("app_user", &Value::Int64(1)).unwrap();
        assert_eq!(row["version"], Value::Int64(1));
    }

    #[test]
    fn test_rollback_restores_rows() {
        let mut db = backend();
        db.execute(&insert(1, "Ann")).unwrap();

        db.begin().unwrap();
        db.execute(&insert(2, "Bob")).unwrap();
        db.execute(&Statement::Delete {
            table: "app_user".into(),
            key: ColumnValue::new("id", 1i64),
            expect: None,
        })
        .unwrap();
        db.rollback().unwrap();

        let rows = db.rows("app_user");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], Value::from("Ann"));
        assert!(db.commit().is_err());
    }

    #[test]
    fn test_batch_statuses_follow_capabilities() {
        let mut db = backend();
        db.execute(&insert(1, "Ann")).unwrap();
        let batch = vec![insert(2, "Bob"), insert(1, "Dup"), insert(3, "Cy")];

        match db.execute_batch(&batch) {
            BatchResult::Failed(failure) => assert_eq!(
                failure.statuses,
                vec![StatementStatus::Rows(1), StatementStatus::Failed]
            ),
            other => panic!("unexpected {other:?}"),
        }

        let mut minimal = backend().reconfigured(BackendCapabilities::minimal());
        minimal.execute(&insert(1, "Ann")).unwrap();
        match minimal.execute_batch(&batch) {
            BatchResult::Failed(failure) => {
                assert_eq!(failure.statuses, vec![StatementStatus::Failed; 3])
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_column_rejected() {
        let mut db = backend();
        let err = db
            .execute(&Statement::Insert {
                table: "app_user".into(),
                values: vec![ColumnValue::new("id", 1i64), ColumnValue::new("nope", 1i64)],
            })
            .unwrap_err();
        assert!(matches!(err, BackendError::UnknownColumn { .. }));
    }
}
