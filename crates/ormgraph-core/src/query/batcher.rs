//! Several independent queries in one round trip.

use std::any::Any;

use ormgraph_proto::BackendError;
use tracing::debug;

use super::executor::{issue, merge, QueryExecutor, QueryResult};
use super::object::QueryObject;
use crate::context::EntityContext;
use crate::error::Result;

/// Collects queries and runs them together.
///
/// Backends that answer several selects at once receive all plans in one
/// call; others get one select per query. The results are the same either
/// way.
pub struct QueryBatcher<'q, T> {
    queries: Vec<&'q QueryObject<T>>,
}

impl<T: Any + Send + Sync> Default for QueryBatcher<'_, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'q, T: Any + Send + Sync> QueryBatcher<'q, T> {
    /// Empty batch.
    pub fn new() -> Self {
        Self {
            queries: Vec::new(),
        }
    }

    /// Queue a query.
    pub fn add(&mut self, query: &'q QueryObject<T>) -> &mut Self {
        self.queries.push(query);
        self
    }

    /// Number of queued queries.
    pub fn len(&self) -> usize {
        self.queries.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Run every queued query, returning one result per query in queue
    /// order.
    pub fn execute(
        &self,
        executor: &mut QueryExecutor<'_>,
        context: &mut EntityContext,
    ) -> Result<Vec<QueryResult<T>>> {
        let rendered = self
            .queries
            .iter()
            .map(|q| executor.plan(context, q))
            .collect::<Result<Vec<_>>>()?;

        let batched = executor.backend().capabilities().supports_multiple_result_sets;
        let result_sets = if batched {
            let plans: Vec<_> = rendered.iter().map(|r| r.plan().clone()).collect();
            executor.backend().select_many(&plans)?
        } else {
            rendered
                .iter()
                .map(|r| executor.backend().select(r.plan()))
                .collect::<Result<Vec<_>, _>>()?
        };
        if result_sets.len() != rendered.len() {
            return Err(BackendError::ResultSetCount {
                expected: rendered.len(),
                actual: result_sets.len(),
            }
            .into());
        }
        debug!(queries = rendered.len(), batched, "Query batch executed");

        rendered
            .iter()
            .zip(&result_sets)
            .map(|(r, rows)| {
                let ids = merge(context, r, rows)?;
                issue(context, ids)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{Backend, MemoryBackend};
    use crate::context::tests::context;
    use crate::error::Error;
    use ormgraph_proto::{BackendCapabilities, BatchResult, ResultSet, SelectPlan, Statement};
    use std::sync::Arc;

    fn queries(ctx: &EntityContext) -> (QueryObject, QueryObject) {
        let users = QueryObject::new(Arc::clone(ctx.definitions()), "app", "User").unwrap();
        let teams = QueryObject::new(Arc::clone(ctx.definitions()), "app", "Team").unwrap();
        (users, teams)
    }

    #[test]
    fn test_batch_uses_one_round_trip_when_supported() {
        let mut ctx = context();
        let mut backend = MemoryBackend::for_definitions(ctx.definitions());
        let (users, teams) = queries(&ctx);

        let mut batch = QueryBatcher::new();
        batch.add(&users).add(&teams);
        let results = batch
            .execute(&mut QueryExecutor::new(&mut backend), &mut ctx)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(backend.round_trips(), 1);
    }

    /// Answers multi-selects with one result set too few.
    struct ShortAnswers(MemoryBackend);

    impl Backend for ShortAnswers {
        fn capabilities(&self) -> BackendCapabilities {
            self.0.capabilities()
        }

        fn select(&mut self, plan: &SelectPlan) -> Result<ResultSet, BackendError> {
            self.0.select(plan)
        }

        fn select_many(&mut self, plans: &[SelectPlan]) -> Result<Vec<ResultSet>, BackendError> {
            let mut sets = self.0.select_many(plans)?;
            sets.pop();
            Ok(sets)
        }

        fn execute(&mut self, statement: &Statement) -> Result<u64, BackendError> {
            self.0.execute(statement)
        }

        fn execute_batch(&mut self, statements: &[Statement]) -> BatchResult {
            self.0.execute_batch(statements)
        }

        fn begin(&mut self) -> Result<(), BackendError> {
            self.0.begin()
        }

        fn commit(&mut self) -> Result<(), BackendError> {
            self.0.commit()
        }

        fn rollback(&mut self) -> Result<(), BackendError> {
            self.0.rollback()
        }
    }

    #[test]
    fn test_missing_result_set_is_an_error() {
        let mut ctx = context();
        let mut backend = ShortAnswers(MemoryBackend::for_definitions(ctx.definitions()));
        let (users, teams) = queries(&ctx);

        let mut batch = QueryBatcher::new();
        batch.add(&users).add(&teams);
        let err = batch
            .execute(&mut QueryExecutor::new(&mut backend), &mut ctx)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Backend(BackendError::ResultSetCount {
                expected: 2,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_batch_falls_back_to_sequential() {
        let mut ctx = context();
        let shared = MemoryBackend::for_definitions(ctx.definitions());
        let mut backend = shared.reconfigured(BackendCapabilities::minimal());
        let (users, teams) = queries(&ctx);

        let mut batch = QueryBatcher::new();
        batch.add(&users).add(&teams);
        let results = batch
            .execute(&mut QueryExecutor::new(&mut backend), &mut ctx)
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(QueryResult::is_empty));
        assert_eq!(shared.round_trips(), 2);
    }
}
