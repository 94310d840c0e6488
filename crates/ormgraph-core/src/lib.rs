//! ormgraph core - entity graph, identity map, structural queries and
//! dependency-ordered persistence.
//!
//! The crate keeps an in-memory graph of typed entities that mirror rows of
//! a relational schema, builds structural queries without SQL text, merges
//! query results into a per-session identity map and writes modified graphs
//! back in foreign-key order under optimistic locking, producing an audit
//! trail of every changed node.

pub mod backend;
pub mod catalog;
pub mod config;
pub mod context;
pub mod env;
pub mod error;
pub mod graph;
pub mod persist;
pub mod query;

pub use backend::{Backend, ConnectionSource, MemoryBackend, SledBackend};
pub use catalog::{
    ConstraintDef, DeleteBehavior, Definitions, EntityType, FieldDef, FieldKind, LockKind,
    ScalarType, TimestampAsString, TypeConverter, TypeRef,
};
pub use config::{ContextConfig, EnvironmentConfig};
pub use context::{EntityContext, GenericProxy, Property, ProxyFactory};
pub use env::{Environment, UnitOfWork};
pub use error::{Error, ErrorKind, LockConflict, Result};
pub use graph::{Entity, EntityId, EntitySnapshot, EntityState, Node};
pub use persist::{
    AuditAction, AuditInformation, AuditRecord, Change, CounterSequence, PersistOutcome,
    Persister, SequenceSource, UuidSequence,
};
pub use query::{
    Condition, ConditionVisitor, Explain, JoinMode, LogicalOp, QNode, QOperand, QProperty,
    QueryBatcher, QueryExecutor, QueryObject, QueryResult, RenderedQuery,
};

/// Re-export backend contract types.
pub use ormgraph_proto as proto;
pub use ormgraph_proto::Value;
