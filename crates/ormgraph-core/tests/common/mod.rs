//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use ormgraph_core::proto::{ColumnValue, Statement, Value};
use ormgraph_core::{
    Backend, ContextConfig, CounterSequence, Definitions, EntityContext, Environment,
    EnvironmentConfig, MemoryBackend,
};

/// Accounts own projects (mandatory), projects may sit in an access area,
/// access areas form a tree.
pub const CATALOG: &str = r#"{
  "namespaces": [
    {
      "name": "org",
      "types": [
        {
          "name": "Account",
          "table": "account",
          "primary_key": "id",
          "fields": [
            {"name": "id", "column": "id", "kind": "value", "value_type": "int64", "storage_type": "int64"},
            {"name": "name", "column": "name", "kind": "value", "value_type": "string", "storage_type": "string"},
            {"name": "version", "column": "version", "kind": "value", "value_type": "int64", "storage_type": "int64", "lock": "counter"},
            {"name": "projects", "kind": "to_many", "nullable": true, "target": {"name": "Project"}, "mapped_by": "owner", "on_delete": "restrict"}
          ]
        },
        {
          "name": "AccessArea",
          "table": "access_area",
          "primary_key": "id",
          "fields": [
            {"name": "id", "column": "id", "kind": "value", "value_type": "int64", "storage_type": "int64"},
            {"name": "name", "column": "name", "kind": "value", "value_type": "string", "storage_type": "string"},
            {"name": "parent", "column": "parent_id", "nullable": true, "kind": "reference", "target": {"name": "AccessArea"}, "key_type": "int64"},
            {"name": "children", "kind": "to_many", "nullable": true, "target": {"name": "AccessArea"}, "mapped_by": "parent"}
          ]
        },
        {
          "name": "Project",
          "table": "project",
          "primary_key": "id",
          "fields": [
            {"name": "id", "column": "id", "kind": "value", "value_type": "int64", "storage_type": "int64"},
            {"name": "title", "column": "title", "kind": "value", "value_type": "string", "storage_type": "string"},
            {"name": "owner", "column": "owner_id", "kind": "reference", "target": {"name": "Account"}, "key_type": "int64"},
            {"name": "area", "column": "area_id", "nullable": true, "kind": "reference", "target": {"name": "AccessArea"}, "key_type": "int64"}
          ]
        }
      ]
    }
  ]
}"#;

pub fn definitions() -> Arc<Definitions> {
    Arc::new(Definitions::from_json(CATALOG).unwrap())
}

pub fn context() -> EntityContext {
    EntityContext::new(definitions(), ContextConfig::default())
}

pub fn environment(backend: &MemoryBackend) -> Environment {
    Environment::new(
        definitions(),
        Arc::new(backend.clone()),
        Arc::new(CounterSequence::new()),
        EnvironmentConfig::new("org"),
    )
}

/// Insert a row directly, outside any context.
pub fn insert(backend: &MemoryBackend, table: &str, values: &[(&str, Value)]) {
    backend
        .clone()
        .execute(&Statement::Insert {
            table: table.to_string(),
            values: values
                .iter()
                .map(|(c, v)| ColumnValue::new(*c, v.clone()))
                .collect(),
        })
        .unwrap();
}

/// Access-area tree: 1 Root with children 2 East and 3 West.
pub fn seed_areas(backend: &MemoryBackend) {
    insert(backend, "access_area", &[("id", Value::Int64(1)), ("name", "Root".into()), ("parent_id", Value::Null)]);
    insert(backend, "access_area", &[("id", Value::Int64(2)), ("name", "East".into()), ("parent_id", Value::Int64(1))]);
    insert(backend, "access_area", &[("id", Value::Int64(3)), ("name", "West".into()), ("parent_id", Value::Int64(1))]);
}
