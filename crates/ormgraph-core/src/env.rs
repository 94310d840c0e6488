//! Environment and unit of work.
//!
//! An [`Environment`] bundles everything a session needs: the schema
//! catalog, a connection source, a key sequence, proxy factories and
//! configuration. A [`UnitOfWork`] is one session: it owns an entity
//! context and borrows a single connection for all queries and persists
//! it runs, returning the connection to the source when dropped.

use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use crate::backend::{Backend, ConnectionSource};
use crate::catalog::{Definitions, EntityType};
use crate::config::EnvironmentConfig;
use crate::context::{EntityContext, ProxyFactory};
use crate::error::Result;
use crate::graph::EntityId;
use crate::persist::{PersistOutcome, Persister, SequenceSource};
use crate::query::{QueryBatcher, QueryExecutor, QueryObject, QueryResult};

/// Shared session factory.
#[derive(Clone)]
pub struct Environment {
    definitions: Arc<Definitions>,
    source: Arc<dyn ConnectionSource>,
    sequence: Arc<dyn SequenceSource>,
    factories: Vec<Arc<dyn ProxyFactory>>,
    config: EnvironmentConfig,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("types", &self.definitions.types().count())
            .field("factories", &self.factories.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Environment {
    /// Create an environment.
    pub fn new(
        definitions: Arc<Definitions>,
        source: Arc<dyn ConnectionSource>,
        sequence: Arc<dyn SequenceSource>,
        config: EnvironmentConfig,
    ) -> Self {
        Self {
            definitions,
            source,
            sequence,
            factories: Vec::new(),
            config,
        }
    }

    /// Add a proxy factory handed to every new context.
    pub fn with_factory(mut self, factory: Arc<dyn ProxyFactory>) -> Self {
        self.factories.push(factory);
        self
    }

    /// Schema catalog.
    pub fn definitions(&self) -> &Arc<Definitions> {
        &self.definitions
    }

    /// Settings.
    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    /// Look up a type in the default namespace.
    pub fn lookup(&self, name: &str) -> Result<Arc<EntityType>> {
        self.definitions.lookup(&self.config.namespace, name)
    }

    /// Query over a type in the default namespace.
    pub fn query<T>(&self, name: &str) -> Result<QueryObject<T>> {
        QueryObject::new(Arc::clone(&self.definitions), &self.config.namespace, name)
    }

    /// Empty context configured from the template.
    pub fn new_context(&self) -> EntityContext {
        let mut context = EntityContext::new(
            Arc::clone(&self.definitions),
            self.config.context.clone(),
        );
        for factory in &self.factories {
            context.register_factory(Arc::clone(factory));
        }
        context
    }

    /// Start a session with a fresh context.
    pub fn unit_of_work(&self) -> UnitOfWork {
        UnitOfWork {
            context: self.new_context(),
            source: Arc::clone(&self.source),
            sequence: Arc::clone(&self.sequence),
            connection: None,
        }
    }
}

/// One session: an entity context plus a lazily acquired connection.
///
/// Every call borrows the same connection; it is acquired by the first
/// query or persist and released when the unit of work is dropped.
pub struct UnitOfWork {
    context: EntityContext,
    source: Arc<dyn ConnectionSource>,
    sequence: Arc<dyn SequenceSource>,
    connection: Option<Box<dyn Backend>>,
}

impl std::fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("context", &self.context)
            .field("connected", &self.connection.is_some())
            .finish()
    }
}

impl UnitOfWork {
    /// The session's entities.
    pub fn context(&self) -> &EntityContext {
        &self.context
    }

    /// Mutable access to the session's entities.
    pub fn context_mut(&mut self) -> &mut EntityContext {
        &mut self.context
    }

    /// Whether a connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// The connection together with the context, acquiring it on first
    /// use.
    pub fn parts(&mut self) -> Result<(&mut dyn Backend, &mut EntityContext)> {
        let connection = match self.connection.take() {
            Some(connection) => connection,
            None => {
                let connection = self.source.acquire()?;
                debug!("Connection acquired");
                connection
            }
        };
        let connection = self.connection.insert(connection);
        Ok((connection.as_mut(), &mut self.context))
    }

    /// Run a query.
    pub fn query<T: Any + Send + Sync>(&mut self, query: &QueryObject<T>) -> Result<QueryResult<T>> {
        let (backend, context) = self.parts()?;
        QueryExecutor::new(backend).execute(context, query)
    }

    /// Run a batch of queries.
    pub fn query_batch<T: Any + Send + Sync>(
        &mut self,
        batch: &QueryBatcher<'_, T>,
    ) -> Result<Vec<QueryResult<T>>> {
        let (backend, context) = self.parts()?;
        batch.execute(&mut QueryExecutor::new(backend), context)
    }

    /// Load a stub.
    pub fn fetch(&mut self, id: EntityId) -> Result<EntityId> {
        let (backend, context) = self.parts()?;
        QueryExecutor::new(backend).fetch(context, id)
    }

    /// Load a to-many collection.
    pub fn fetch_children(&mut self, owner: EntityId, field: &str) -> Result<Vec<EntityId>> {
        let (backend, context) = self.parts()?;
        QueryExecutor::new(backend).fetch_children(context, owner, field)
    }

    /// Write all pending changes.
    pub fn persist(&mut self) -> Result<PersistOutcome> {
        let sequence = Arc::clone(&self.sequence);
        let (backend, context) = self.parts()?;
        Persister::new(backend, sequence.as_ref()).persist(context)
    }

    /// Give the connection back to the source.
    pub fn release(&mut self) {
        if let Some(connection) = self.connection.take() {
            self.source.release(connection);
            debug!("Connection released");
        }
    }
}

impl Drop for UnitOfWork {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::context::tests::definitions;
    use crate::context::GenericProxy;
    use crate::persist::CounterSequence;

    fn environment(backend: &MemoryBackend) -> Environment {
        Environment::new(
            definitions(),
            Arc::new(backend.clone()),
            Arc::new(CounterSequence::new()),
            EnvironmentConfig::new("app"),
        )
    }

    #[test]
    fn test_one_connection_per_unit_of_work() {
        let backend = MemoryBackend::for_definitions(&definitions());
        let env = environment(&backend);

        let mut work = env.unit_of_work();
        assert!(!work.is_connected());
        let team = env.lookup("Team").unwrap();
        let t = work.context_mut().create(&team).unwrap();
        work.context_mut().set_value(t, "name", "Core").unwrap();
        work.persist().unwrap();

        let query = env.query::<GenericProxy>("Team").unwrap();
        assert_eq!(work.query(&query).unwrap().len(), 1);
        assert_eq!(backend.acquisitions(), 1);

        drop(work);
        let mut second = env.unit_of_work();
        assert_eq!(second.query(&query).unwrap().len(), 1);
        assert_eq!(backend.acquisitions(), 2);
    }
}
