//! Structural queries.
//!
//! A [`QueryObject`] is a tree of entity-type nodes joined by relation name.
//! Each node may carry a [`Condition`]; conditions are traversed only through
//! [`ConditionVisitor`], which renders them into backend predicates, collects
//! their parameters and explains them as text. Node aliases are assigned in
//! creation order (`a`, `b`, ...) and never change.
//!
//! [`QueryExecutor`] renders a tree into a select plan, runs it and merges
//! the rows into an entity context; [`QueryBatcher`] runs several trees in
//! one round trip when the backend allows it.

mod batcher;
mod condition;
mod executor;
mod explain;
mod object;
mod plan;

pub use batcher::QueryBatcher;
pub use condition::{Condition, ConditionVisitor, LogicalOp, QOperand, QProperty};
pub use executor::{QueryExecutor, QueryResult};
pub use explain::Explain;
pub use object::{JoinMode, QJoin, QJoinKind, QNode, QueryObject};
pub use plan::RenderedQuery;

pub(crate) use plan::{column_name, from_storage, to_storage};
