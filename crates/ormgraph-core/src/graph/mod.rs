//! Entity graph.
//!
//! Entities are the live, mutable mirror of stored rows. Each carries one
//! node per field of its type; references between entities are arena
//! handles ([`EntityId`]) owned by the surrounding
//! [`EntityContext`](crate::context::EntityContext).

mod entity;
mod node;

pub use entity::{Entity, EntityId, EntitySnapshot, EntityState};
pub use node::{Node, RefNode, RefState, ToManyNode, ValueNode};
