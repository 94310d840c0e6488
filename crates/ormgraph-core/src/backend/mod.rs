//! Row-access backends.
//!
//! The engine reaches a relational store through [`Backend`], a synchronous
//! connection that answers [`SelectPlan`]s with rows and applies write
//! [`Statement`]s inside a transaction. [`ConnectionSource`] hands out
//! connections to a unit of work.
//!
//! Two reference implementations ship with the crate: [`MemoryBackend`]
//! (shared in-memory tables with configurable capability flags) and
//! [`SledBackend`] (rows persisted in a sled tree).

mod eval;
mod memory;
mod sled_store;

use ormgraph_proto::{
    BackendCapabilities, BackendError, BatchFailure, BatchResult, ResultSet, SelectPlan,
    Statement, StatementStatus,
};
use tracing::debug;

pub use memory::MemoryBackend;
pub use sled_store::SledBackend;

/// A connection to a row store.
pub trait Backend: Send {
    /// Feature flags of this backend.
    fn capabilities(&self) -> BackendCapabilities;

    /// Run one select.
    fn select(&mut self, plan: &SelectPlan) -> Result<ResultSet, BackendError>;

    /// Run several selects in one round trip.
    ///
    /// Only available when
    /// [`supports_multiple_result_sets`](BackendCapabilities::supports_multiple_result_sets)
    /// is set.
    fn select_many(&mut self, plans: &[SelectPlan]) -> Result<Vec<ResultSet>, BackendError> {
        if !self.capabilities().supports_multiple_result_sets {
            return Err(BackendError::Unsupported("multiple result sets".into()));
        }
        plans.iter().map(|plan| self.select(plan)).collect()
    }

    /// Run one write statement, returning the number of rows touched.
    fn execute(&mut self, statement: &Statement) -> Result<u64, BackendError>;

    /// Run a batch of write statements.
    fn execute_batch(&mut self, statements: &[Statement]) -> BatchResult;

    /// Open a transaction.
    fn begin(&mut self) -> Result<(), BackendError>;

    /// Commit the open transaction.
    fn commit(&mut self) -> Result<(), BackendError>;

    /// Discard the open transaction.
    fn rollback(&mut self) -> Result<(), BackendError>;
}

/// Hands out connections.
pub trait ConnectionSource: Send + Sync {
    /// Acquire a connection.
    fn acquire(&self) -> Result<Box<dyn Backend>, BackendError>;

    /// Return a connection once its unit of work ends.
    fn release(&self, connection: Box<dyn Backend>) {
        drop(connection);
    }
}

/// Run a batch statement by statement, reporting a failure the way the
/// backend's capabilities promise.
pub(crate) fn execute_each<B: Backend + ?Sized>(backend: &mut B, statements: &[Statement]) -> BatchResult {
    let mut counts = Vec::with_capacity(statements.len());
    for statement in statements {
        match backend.execute(statement) {
            Ok(rows) => counts.push(rows),
            Err(cause) => {
                let caps = backend.capabilities();
                let statuses = if caps.flags_all_operations_as_failed_on_batch_update_exception {
                    vec![StatementStatus::Failed; statements.len()]
                } else if caps.supports_batch_update_counts {
                    counts
                        .iter()
                        .map(|&n| StatementStatus::Rows(n))
                        .chain(std::iter::once(StatementStatus::Failed))
                        .collect()
                } else {
                    Vec::new()
                };
                debug!(size = statements.len(), executed = counts.len(), error = %cause, "Batch failed");
                return BatchResult::Failed(BatchFailure { statuses, cause });
            }
        }
    }
    BatchResult::Completed(counts)
}
