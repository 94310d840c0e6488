//! CLI error types.

use thiserror::Error;

/// Errors reported to the user.
#[derive(Debug, Error)]
pub enum CliError {
    /// Reading the schema file failed.
    #[error("cannot read '{path}': {source}")]
    Io {
        /// File that could not be read.
        path: String,
        /// Underlying error.
        source: std::io::Error,
    },

    /// A filter, assignment or value did not parse.
    #[error("invalid argument '{input}': {reason}")]
    Argument {
        /// Offending input.
        input: String,
        /// What is wrong with it.
        reason: String,
    },

    /// Engine error.
    #[error(transparent)]
    Core(#[from] ormgraph_core::Error),

    /// Store error.
    #[error(transparent)]
    Backend(#[from] ormgraph_core::proto::BackendError),
}

impl CliError {
    pub(crate) fn argument(input: &str, reason: impl Into<String>) -> Self {
        CliError::Argument {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result alias for CLI operations.
pub type Result<T> = std::result::Result<T, CliError>;
