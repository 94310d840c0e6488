//! Schema catalog.
//!
//! Declarative description of entity types, their fields, relations and
//! constraints, grouped into namespaces. Every other component reads it.

mod constraint;
mod converter;
mod definitions;
mod entity;
mod field;
mod types;

pub use constraint::ConstraintDef;
pub use converter::{TimestampAsString, TypeConverter};
pub use definitions::{Definitions, NamespaceDef};
pub use entity::EntityType;
pub use field::{DeleteBehavior, FieldDef, FieldKind, LockKind, TypeRef};
pub use types::ScalarType;
