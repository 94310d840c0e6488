//! Backend contract types for ormgraph.
//!
//! The persistence engine talks to a relational store through a small,
//! synchronous row/column access API. This crate defines the data exchanged
//! across that boundary:
//!
//! - [`value`] - Runtime values stored in columns
//! - [`plan`] - Select plans (tables, joins, predicates) and result sets
//! - [`statement`] - Parameterised write statements and batch outcomes
//! - [`capabilities`] - Backend capability flags
//! - [`error`] - Backend and contract error types

pub mod capabilities;
pub mod error;
pub mod plan;
pub mod statement;
pub mod value;

pub use capabilities::BackendCapabilities;
pub use error::{BackendError, Error};
pub use plan::{
    ColumnRef, CompareOp, JoinSpec, JoinType, LockMode, Operand, OrderDirection, OrderSpec,
    Predicate, ResultSet, SelectPlan, TableRef,
};
pub use statement::{BatchFailure, BatchResult, ColumnValue, Statement, StatementStatus};
pub use value::Value;
