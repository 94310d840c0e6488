//! Primary-key sources for new entities.

use dashmap::DashMap;
use ormgraph_proto::{ColumnRef, SelectPlan, TableRef, Value};
use tracing::debug;
use uuid::Uuid;

use crate::backend::Backend;
use crate::catalog::{Definitions, EntityType, ScalarType};
use crate::error::{Error, Result};

/// Hands out primary keys before inserts are issued.
pub trait SequenceSource: Send + Sync {
    /// Next key for a new entity of `entity_type`.
    fn next_key(&self, entity_type: &EntityType) -> Result<Value>;
}

fn key_type(entity_type: &EntityType) -> Result<ScalarType> {
    entity_type
        .primary_key_field()
        .and_then(|f| f.value_type())
        .ok_or_else(|| {
            Error::InvalidSchema(format!("'{}' has no primary-key field", entity_type.name))
        })
}

/// Per-type integer counters.
#[derive(Debug, Default)]
pub struct CounterSequence {
    counters: DashMap<String, i64>,
}

impl CounterSequence {
    /// Counters starting at 1 for every type.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next key of a type larger than `value`.
    pub fn advance_past(&self, entity_type: &EntityType, value: i64) {
        let mut counter = self.counters.entry(entity_type.qualified_name()).or_insert(0);
        if *counter < value {
            *counter = value;
        }
    }

    /// Advance every integer-keyed type past the largest key already stored.
    pub fn seed(&self, backend: &mut dyn Backend, definitions: &Definitions) -> Result<()> {
        for entity_type in definitions.types() {
            if !matches!(key_type(entity_type)?, ScalarType::Int32 | ScalarType::Int64) {
                continue;
            }
            let mut plan = SelectPlan::new(TableRef::new(&entity_type.table, "a"));
            plan.columns
                .push(ColumnRef::new("a", entity_type.primary_key_column()));
            let rows = backend.select(&plan)?;
            let max = rows
                .rows
                .iter()
                .filter_map(|row| row.first().and_then(Value::as_i64))
                .max();
            if let Some(max) = max {
                self.advance_past(entity_type, max);
                debug!(entity_type = %entity_type.name, max, "Sequence seeded");
            }
        }
        Ok(())
    }
}

impl SequenceSource for CounterSequence {
    fn next_key(&self, entity_type: &EntityType) -> Result<Value> {
        let ty = key_type(entity_type)?;
        let mut counter = self.counters.entry(entity_type.qualified_name()).or_insert(0);
        *counter += 1;
        match ty {
            ScalarType::Int64 => Ok(Value::Int64(*counter)),
            ScalarType::Int32 => i32::try_from(*counter)
                .map(Value::Int32)
                .map_err(|_| Error::InvalidSchema(format!(
                    "key sequence of '{}' exhausted",
                    entity_type.name
                ))),
            other => Err(Error::InvalidSchema(format!(
                "counter keys need an integer primary key, '{}' has {other}",
                entity_type.name
            ))),
        }
    }
}

/// Random v4 UUID keys, for `uuid` or `string` primary keys.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidSequence;

impl SequenceSource for UuidSequence {
    fn next_key(&self, entity_type: &EntityType) -> Result<Value> {
        let uuid = Uuid::new_v4();
        match key_type(entity_type)? {
            ScalarType::Uuid => Ok(Value::Uuid(*uuid.as_bytes())),
            ScalarType::String => Ok(Value::String(uuid.to_string())),
            other => Err(Error::InvalidSchema(format!(
                "uuid keys need a uuid or string primary key, '{}' has {other}",
                entity_type.name
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::FieldDef;

    fn typed(key: ScalarType) -> EntityType {
        EntityType::new("Tag", "tag", "id").with_field(FieldDef::value("id", key))
    }

    #[test]
    fn test_counter_per_type() {
        let seq = CounterSequence::new();
        let tag = typed(ScalarType::Int64);
        let small = EntityType::new("Flag", "flag", "id")
            .with_field(FieldDef::value("id", ScalarType::Int32));

        assert_eq!(seq.next_key(&tag).unwrap(), Value::Int64(1));
        assert_eq!(seq.next_key(&tag).unwrap(), Value::Int64(2));
        assert_eq!(seq.next_key(&small).unwrap(), Value::Int32(1));

        seq.advance_past(&tag, 40);
        assert_eq!(seq.next_key(&tag).unwrap(), Value::Int64(41));
        assert!(seq.next_key(&typed(ScalarType::String)).is_err());
    }

    #[test]
    fn test_uuid_keys() {
        let seq = UuidSequence;
        assert!(matches!(seq.next_key(&typed(ScalarType::Uuid)).unwrap(), Value::Uuid(_)));
        let a = seq.next_key(&typed(ScalarType::String)).unwrap();
        let b = seq.next_key(&typed(ScalarType::String)).unwrap();
        assert_ne!(a, b);
        assert!(seq.next_key(&typed(ScalarType::Int64)).is_err());
    }
}
