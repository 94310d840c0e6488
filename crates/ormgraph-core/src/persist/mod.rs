//! Persistence engine.
//!
//! A persist call partitions the context into inserts, updates and deletes,
//! orders them along mandatory foreign keys, draws keys for new rows from a
//! [`SequenceSource`] and issues the statements in batches inside one
//! transaction. Updates and deletes are guarded by the entity's optimistic
//! lock. Every written node is recorded once in the [`AuditInformation`]
//! returned with the [`PersistOutcome`].

mod analyser;
mod audit;
mod engine;
mod order;
mod sequence;

pub use audit::{AuditAction, AuditInformation, AuditRecord, Change};
pub use engine::{PersistOutcome, Persister};
pub use sequence::{CounterSequence, SequenceSource, UuidSequence};
