//! Output formatters.

use std::sync::Arc;

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use ormgraph_core::{AuditInformation, ConstraintDef, EntitySnapshot, EntityType, Value};

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

/// Trait for formatting output.
pub trait Formatter {
    /// Entity types in write order with their constraints.
    fn format_schema(&self, types: &[Arc<EntityType>]) -> String;

    /// Loaded entities.
    fn format_rows(&self, rows: &[EntitySnapshot]) -> String;

    /// Audit trail of a persist.
    fn format_audit(&self, audit: &AuditInformation) -> String;

    /// Query description and bound parameters.
    fn format_explain(&self, explain: &str, parameters: &[Value]) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_schema(&self, types: &[Arc<EntityType>]) -> String {
        let mut table = Table::new();
        table.set_header(vec!["#", "Type", "Table", "Lock", "Constraints"]);
        for (position, ty) in types.iter().enumerate() {
            let lock = ty
                .lock_index()
                .map(|i| ty.fields[i].name.clone())
                .unwrap_or_else(|| "-".to_string());
            let constraints: Vec<String> = ty.constraints().iter().map(describe_constraint).collect();
            table.add_row(vec![
                Cell::new(position + 1),
                Cell::new(ty.qualified_name()),
                Cell::new(&ty.table),
                Cell::new(lock),
                Cell::new(constraints.join("\n")),
            ]);
        }
        format!("{}\n{} type(s)", table, types.len())
    }

    fn format_rows(&self, rows: &[EntitySnapshot]) -> String {
        let Some(first) = rows.first() else {
            return "No results".to_string();
        };
        let mut table = Table::new();
        table.set_header(first.values.iter().map(|(name, _)| Cell::new(name)));
        for row in rows {
            table.add_row(row.values.iter().map(|(_, v)| Cell::new(format_value(v))));
        }
        format!("{}\n{} row(s)", table, rows.len())
    }

    fn format_audit(&self, audit: &AuditInformation) -> String {
        if audit.is_empty() {
            return "Nothing to write".to_string();
        }
        let mut table = Table::new();
        table.set_header(vec!["Action", "Type", "Key", "Field", "Old", "New"]);
        for record in audit.records() {
            for change in &record.changes {
                table.add_row(vec![
                    Cell::new(format!("{:?}", record.action).to_lowercase()),
                    Cell::new(&record.entity_type),
                    Cell::new(format_value(&record.key)),
                    Cell::new(&change.field),
                    Cell::new(format_value(&change.old)),
                    Cell::new(format_value(&change.new)),
                ]);
            }
        }
        format!(
            "{}\n{} entit(ies), {} change(s)",
            table,
            audit.len(),
            audit.change_count()
        )
    }

    fn format_explain(&self, explain: &str, parameters: &[Value]) -> String {
        if parameters.is_empty() {
            return explain.to_string();
        }
        let bound: Vec<String> = parameters.iter().map(format_value).collect();
        format!("{}\nparameters: {}", explain.trim_end(), bound.join(", "))
    }
}

/// JSON formatter.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_schema(&self, types: &[Arc<EntityType>]) -> String {
        let types: Vec<serde_json::Value> = types
            .iter()
            .map(|ty| {
                serde_json::json!({
                    "type": ty.qualified_name(),
                    "table": ty.table,
                    "lock": ty.lock_index().map(|i| ty.fields[i].name.clone()),
                    "constraints": ty.constraints(),
                })
            })
            .collect();
        pretty(&serde_json::Value::Array(types))
    }

    fn format_rows(&self, rows: &[EntitySnapshot]) -> String {
        let rows: Vec<serde_json::Value> = rows
            .iter()
            .map(|row| {
                let fields = row
                    .values
                    .iter()
                    .map(|(name, value)| (name.clone(), value_to_json(value)))
                    .collect();
                serde_json::Value::Object(fields)
            })
            .collect();
        pretty(&serde_json::Value::Array(rows))
    }

    fn format_audit(&self, audit: &AuditInformation) -> String {
        let records: Vec<serde_json::Value> = audit
            .records()
            .iter()
            .map(|record| {
                let changes: Vec<serde_json::Value> = record
                    .changes
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "field": c.field,
                            "old": value_to_json(&c.old),
                            "new": value_to_json(&c.new),
                        })
                    })
                    .collect();
                serde_json::json!({
                    "action": format!("{:?}", record.action).to_lowercase(),
                    "type": record.entity_type,
                    "key": value_to_json(&record.key),
                    "changes": changes,
                })
            })
            .collect();
        pretty(&serde_json::Value::Array(records))
    }

    fn format_explain(&self, explain: &str, parameters: &[Value]) -> String {
        pretty(&serde_json::json!({
            "explain": explain.lines().collect::<Vec<_>>(),
            "parameters": parameters.iter().map(value_to_json).collect::<Vec<_>>(),
        }))
    }
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| "null".to_string())
}

fn describe_constraint(constraint: &ConstraintDef) -> String {
    match constraint {
        ConstraintDef::PrimaryKey { columns, .. } => format!("pk({})", columns.join(", ")),
        ConstraintDef::Unique { columns, .. } => format!("unique({})", columns.join(", ")),
        ConstraintDef::ForeignKey {
            column, references, ..
        } => format!("fk({}) -> {}", column, references.name),
    }
}

/// Format a Value as a display string.
fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::String(s) => s.clone(),
        Value::Uuid(bytes) => uuid::Uuid::from_bytes(*bytes).to_string(),
        other => other.to_string(),
    }
}

/// Convert a Value to JSON.
fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int32(i) => serde_json::Value::from(*i),
        Value::Int64(i) => serde_json::Value::from(*i),
        Value::Float64(f) => serde_json::Value::from(*f),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::String(hex::encode(b)),
        Value::Timestamp(t) => serde_json::Value::from(*t),
        Value::Uuid(bytes) => serde_json::Value::String(uuid::Uuid::from_bytes(*bytes).to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_json_rows_use_plain_values() {
        let rows = vec![EntitySnapshot {
            entity_type: "Account".into(),
            key: Some(Value::Int64(1)),
            values: vec![
                ("id".into(), Value::Int64(1)),
                ("name".into(), Value::from("Ann")),
                ("blob".into(), Value::Bytes(vec![0xab])),
                ("gone".into(), Value::Null),
            ],
        }];
        let json: serde_json::Value =
            serde_json::from_str(&JsonFormatter.format_rows(&rows)).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{ "id": 1, "name": "Ann", "blob": "ab", "gone": null }])
        );
    }

    #[test]
    fn test_empty_results() {
        assert_eq!(TableFormatter.format_rows(&[]), "No results");
        assert_eq!(
            TableFormatter.format_audit(&AuditInformation::new()),
            "Nothing to write"
        );
    }
}
