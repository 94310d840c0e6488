//! Write statements and batch outcomes.

use serde::{Deserialize, Serialize};

use crate::error::BackendError;
use crate::value::Value;

/// A column name and value pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnValue {
    /// Column name.
    pub column: String,
    /// Column value.
    pub value: Value,
}

impl ColumnValue {
    /// Create a new column-value pair.
    pub fn new(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// A parameterised write statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// Insert one row.
    Insert {
        /// Target table.
        table: String,
        /// Column values of the new row.
        values: Vec<ColumnValue>,
    },
    /// Update one row by primary key.
    Update {
        /// Target table.
        table: String,
        /// Primary-key column and value.
        key: ColumnValue,
        /// Columns to set.
        set: Vec<ColumnValue>,
        /// Optimistic-lock guard: the row is only touched when this column
        /// still holds this value.
        expect: Option<ColumnValue>,
    },
    /// Delete one row by primary key.
    Delete {
        /// Target table.
        table: String,
        /// Primary-key column and value.
        key: ColumnValue,
        /// Optimistic-lock guard.
        expect: Option<ColumnValue>,
    },
}

impl Statement {
    /// Table the statement writes to.
    pub fn table(&self) -> &str {
        match self {
            Statement::Insert { table, .. }
            | Statement::Update { table, .. }
            | Statement::Delete { table, .. } => table,
        }
    }

    /// Short statement kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            Statement::Insert { .. } => "insert",
            Statement::Update { .. } => "update",
            Statement::Delete { .. } => "delete",
        }
    }

    /// Whether two statements can share a backend batch.
    pub fn batches_with(&self, other: &Statement) -> bool {
        self.kind() == other.kind() && self.table() == other.table()
    }
}

/// Per-statement status reported by a failed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementStatus {
    /// The statement ran and touched this many rows.
    Rows(u64),
    /// The statement failed.
    Failed,
    /// The backend did not report a status.
    Unknown,
}

/// Failure signal of a batch.
#[derive(Debug)]
pub struct BatchFailure {
    /// Per-statement statuses; may be shorter than the batch, or all
    /// `Failed`, depending on backend capabilities.
    pub statuses: Vec<StatementStatus>,
    /// The error that stopped the batch.
    pub cause: BackendError,
}

/// Outcome of executing a batch.
#[derive(Debug)]
pub enum BatchResult {
    /// Every statement ran; row counts in statement order.
    Completed(Vec<u64>),
    /// The batch failed.
    Failed(BatchFailure),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batching_compatibility() {
        let a = Statement::Insert {
            table: "user".into(),
            values: vec![ColumnValue::new("id", 1i64)],
        };
        let b = Statement::Insert {
            table: "user".into(),
            values: vec![ColumnValue::new("id", 2i64)],
        };
        let c = Statement::Delete {
            table: "user".into(),
            key: ColumnValue::new("id", 3i64),
            expect: None,
        };

        assert!(a.batches_with(&b));
        assert!(!a.batches_with(&c));
        assert_eq!(c.kind(), "delete");
    }
}
