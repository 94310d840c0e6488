//! Contract error types.

use thiserror::Error;

/// Errors raised while building or decoding contract types.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A plan references an alias that is not part of it.
    #[error("unknown alias '{0}' in select plan")]
    UnknownAlias(String),
}

/// Errors reported by a row-access backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// An insert collided with an existing primary key.
    #[error("duplicate key {key} in table '{table}'")]
    DuplicateKey {
        /// Table name.
        table: String,
        /// Rendered key value.
        key: String,
    },

    /// The backend does not know the table.
    #[error("unknown table '{0}'")]
    UnknownTable(String),

    /// The backend does not know a column.
    #[error("unknown column '{column}' in table '{table}'")]
    UnknownColumn {
        /// Table name.
        table: String,
        /// Column name.
        column: String,
    },

    /// A statement was issued outside of an open transaction, or a
    /// transaction was opened twice.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// The requested feature is not available on this backend.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A multi-select answered with the wrong number of result sets.
    #[error("expected {expected} result sets, got {actual}")]
    ResultSetCount {
        /// Number of plans sent.
        expected: usize,
        /// Number of result sets returned.
        actual: usize,
    },

    /// Connection or storage failure.
    #[error("connection error: {0}")]
    Connection(String),

    /// Row encoding failure.
    #[error(transparent)]
    Codec(#[from] Error),
}
