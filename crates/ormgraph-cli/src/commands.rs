//! Subcommand implementations.
//!
//! Every command returns its rendered output; `main` prints it.

use std::path::Path;
use std::sync::Arc;

use ormgraph_core::proto::OrderDirection;
use ormgraph_core::{
    Condition, ConnectionSource, CounterSequence, Definitions, Environment, GenericProxy,
    QProperty, QueryObject, SledBackend, Value,
};
use tracing::{debug, info};

use crate::config::{CliConfig, QueryArgs};
use crate::error::{CliError, Result};
use crate::formatter::Formatter;
use crate::parse::{parse_assignment, parse_filter, parse_value, FilterOp};

/// Read and validate a schema catalog.
pub fn load_definitions(path: &Path) -> Result<Definitions> {
    let json = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let definitions = Definitions::from_json(&json)?;
    debug!(path = %path.display(), types = definitions.types().count(), "Schema loaded");
    Ok(definitions)
}

/// `check`: the catalog in write order.
pub fn check(definitions: &Definitions, formatter: &dyn Formatter) -> Result<String> {
    let order = definitions.dependency_order()?;
    Ok(formatter.format_schema(&order))
}

/// Build a query from command-line arguments.
pub fn build_query(
    definitions: Arc<Definitions>,
    namespace: &str,
    args: &QueryArgs,
) -> Result<QueryObject> {
    let mut query: QueryObject = QueryObject::new(definitions, namespace, &args.entity_type)?;
    let root = query.root();

    for path in &args.joins {
        query.join_path(root, path)?;
    }

    for raw in &args.filters {
        let filter = parse_filter(raw)?;
        let mut node = root;
        for relation in filter.relations() {
            node = query.join_for_filter(node, relation)?;
        }
        let field = query
            .entity_type(node)?
            .field(filter.field())
            .cloned()
            .ok_or_else(|| CliError::argument(raw, "unknown field"))?;
        let property = query.prop(node, filter.field())?;
        let value = parse_value(&field, &filter.raw)?;
        let condition = compare(property, filter.op, value)
            .ok_or_else(|| CliError::argument(raw, "null only compares with = or !="))?;
        query.and(node, condition)?;
    }

    if let Some(order) = &args.order {
        let (field, direction) = match order.strip_prefix('-') {
            Some(field) => (field, OrderDirection::Desc),
            None => (order.as_str(), OrderDirection::Asc),
        };
        let property = query.prop(root, field)?;
        query.order_by(property, direction)?;
    }
    Ok(query)
}

fn compare(property: QProperty, op: FilterOp, value: Value) -> Option<Condition> {
    if value.is_null() {
        return match op {
            FilterOp::Eq => Some(property.is_null()),
            FilterOp::Ne => Some(property.is_not_null()),
            _ => None,
        };
    }
    let condition = match op {
        FilterOp::Eq => property.eq(value),
        FilterOp::Ne => property.ne(value),
        FilterOp::Lt => property.lt(value),
        FilterOp::Le => property.le(value),
        FilterOp::Gt => property.gt(value),
        FilterOp::Ge => property.ge(value),
        FilterOp::Like => property.like(value.as_str().unwrap_or_default()),
    };
    Some(condition)
}

/// `explain`: describe the query without touching the store.
pub fn explain(
    definitions: Arc<Definitions>,
    config: &CliConfig,
    args: &QueryArgs,
    formatter: &dyn Formatter,
) -> Result<String> {
    let query = build_query(definitions, &config.environment.namespace, args)?;
    Ok(formatter.format_explain(&query.explain()?, &query.parameters()))
}

/// Open the sled store and wrap it in an environment whose key sequence
/// continues after the stored keys.
pub fn open_environment(definitions: Arc<Definitions>, config: &CliConfig) -> Result<Environment> {
    let backend = SledBackend::open(&config.data_path, &definitions)?;
    let sequence = CounterSequence::new();
    let mut connection = backend.acquire()?;
    sequence.seed(connection.as_mut(), &definitions)?;
    info!(data_path = %config.data_path.display(), "Store opened");
    Ok(Environment::new(
        definitions,
        Arc::new(backend),
        Arc::new(sequence),
        config.environment.clone(),
    ))
}

/// `query`: run the query and print the root entities.
pub fn query(env: &Environment, args: &QueryArgs, formatter: &dyn Formatter) -> Result<String> {
    let query = build_query(
        Arc::clone(env.definitions()),
        &env.config().namespace,
        args,
    )?;
    let mut work = env.unit_of_work();
    let result = work.query::<GenericProxy>(&query)?;
    let rows = result
        .ids()
        .into_iter()
        .map(|id| work.context().entity(id).map(|e| e.snapshot()))
        .collect::<ormgraph_core::Result<Vec<_>>>()?;
    Ok(formatter.format_rows(&rows))
}

/// `insert`: create one entity from `field=value` assignments.
pub fn insert(
    env: &Environment,
    type_name: &str,
    assignments: &[String],
    formatter: &dyn Formatter,
) -> Result<String> {
    let entity_type = env.lookup(type_name)?;
    let mut work = env.unit_of_work();
    let id = work.context_mut().create(&entity_type)?;

    for raw in assignments {
        let (name, literal) = parse_assignment(raw)?;
        let field = entity_type
            .field(name)
            .ok_or_else(|| CliError::argument(raw, "unknown field"))?;
        let value = parse_value(field, literal)?;
        if field.is_reference() {
            work.context_mut().set_entity_key(id, name, value)?;
        } else {
            work.context_mut().set_value(id, name, value)?;
        }
    }

    let outcome = work.persist()?;
    Ok(formatter.format_audit(&outcome.audit))
}

/// `delete`: remove one entity by key.
///
/// Restricted collections are loaded first so that an owner with children
/// is refused rather than orphaning them.
pub fn delete(
    env: &Environment,
    type_name: &str,
    key: &str,
    formatter: &dyn Formatter,
) -> Result<String> {
    let entity_type = env.lookup(type_name)?;
    let key_field = entity_type
        .primary_key_field()
        .ok_or_else(|| CliError::argument(type_name, "type has no primary key"))?;
    let key = parse_value(key_field, key)?;

    let mut work = env.unit_of_work();
    let stub = work.context_mut().get_or_create(&entity_type, key)?;
    let id = work.fetch(stub)?;
    for (_, field) in entity_type.to_many_fields() {
        work.fetch_children(id, &field.name)?;
    }
    work.context_mut().mark_for_deletion(id)?;
    let outcome = work.persist()?;
    Ok(formatter.format_audit(&outcome.audit))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CliConfig;
    use crate::formatter::{JsonFormatter, TableFormatter};
    use ormgraph_core::EnvironmentConfig;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = include_str!("../schema/sample.json");

    fn definitions() -> Arc<Definitions> {
        Arc::new(Definitions::from_json(SAMPLE).unwrap())
    }

    fn query_args(entity_type: &str, filters: &[&str], joins: &[&str]) -> QueryArgs {
        QueryArgs {
            entity_type: entity_type.to_string(),
            joins: joins.iter().map(|s| s.to_string()).collect(),
            filters: filters.iter().map(|s| s.to_string()).collect(),
            order: None,
        }
    }

    fn config(dir: &Path) -> CliConfig {
        CliConfig::new("sample.json")
            .with_data_path(dir)
            .with_environment(EnvironmentConfig::new("shop"))
    }

    #[test]
    fn test_check_lists_targets_first() {
        let out = check(&definitions(), &JsonFormatter).unwrap();
        let json: serde_json::Value = serde_json::from_str(&out).unwrap();
        let order: Vec<&str> = json
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["type"].as_str().unwrap())
            .collect();
        let position = |name: &str| order.iter().position(|t| *t == name).unwrap();
        assert!(position("shop.Customer") < position("shop.Order"));
        assert!(position("shop.Order") < position("shop.OrderLine"));
    }

    #[test]
    fn test_filters_on_related_types() {
        let args = query_args("Order", &["customer.name~A%", "status!=null"], &["lines"]);
        let query = build_query(definitions(), "shop", &args).unwrap();
        assert_eq!(query.aliases(), vec!["a", "b", "c"]);
        assert_eq!(query.parameters().len(), 1);

        let bad = query_args("Order", &["status<null"], &[]);
        assert!(build_query(definitions(), "shop", &bad).is_err());
        let unknown = query_args("Order", &["nope=1"], &[]);
        assert!(build_query(definitions(), "shop", &unknown).is_err());
    }

    #[test]
    fn test_insert_query_delete_round() {
        let dir = tempfile::tempdir().unwrap();
        let defs = definitions();
        let env = open_environment(Arc::clone(&defs), &config(dir.path())).unwrap();

        let audit = insert(&env, "Customer", &["name=Ann".to_string()], &JsonFormatter).unwrap();
        let audit: serde_json::Value = serde_json::from_str(&audit).unwrap();
        assert_eq!(audit[0]["action"], "insert");
        assert_eq!(audit[0]["key"], 1);

        insert(
            &env,
            "Order",
            &["customer=1".to_string(), "status=open".to_string()],
            &JsonFormatter,
        )
        .unwrap();

        let rows = query(&env, &query_args("Order", &["customer.name=Ann"], &[]), &JsonFormatter)
            .unwrap();
        let rows: serde_json::Value = serde_json::from_str(&rows).unwrap();
        assert_eq!(rows.as_array().unwrap().len(), 1);
        assert_eq!(rows[0]["customer"], 1);

        // the customer still has an order
        let err = delete(&env, "Customer", "1", &TableFormatter).unwrap_err();
        assert!(matches!(err, CliError::Core(ormgraph_core::Error::DeleteRestricted { .. })));

        delete(&env, "Order", "1", &TableFormatter).unwrap();
        delete(&env, "Customer", "1", &TableFormatter).unwrap();
        let rows = query(&env, &query_args("Customer", &[], &[]), &TableFormatter).unwrap();
        assert_eq!(rows, "No results");
    }
}
