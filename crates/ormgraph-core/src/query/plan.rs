//! Rendering of query trees into backend select plans.

use std::sync::Arc;

use ormgraph_proto::{
    ColumnRef, CompareOp, JoinSpec, JoinType, Operand, OrderSpec, Predicate, SelectPlan,
    TableRef, Value,
};

use super::condition::{Condition, ConditionVisitor, LogicalOp, QOperand, QProperty};
use super::object::{JoinMode, QJoin, QJoinKind, QNode, QueryObject};
use crate::catalog::{Definitions, EntityType, FieldDef};
use crate::error::{Error, Result};

/// Column name backing a field.
pub(crate) fn column_name(def: &FieldDef) -> &str {
    def.column.as_deref().unwrap_or(&def.name)
}

/// Application value to storage value.
pub(crate) fn to_storage(definitions: &Definitions, def: &FieldDef, value: Value) -> Result<Value> {
    match &def.converter {
        Some(name) => definitions.converter(name)?.to_storage(&value),
        None => Ok(value),
    }
}

/// Storage value to application value.
pub(crate) fn from_storage(definitions: &Definitions, def: &FieldDef, value: Value) -> Result<Value> {
    match &def.converter {
        Some(name) => definitions.converter(name)?.from_storage(&value),
        None => Ok(value),
    }
}

/// A node whose rows are merged into the context.
#[derive(Debug, Clone)]
pub(crate) struct FetchedNode {
    pub(crate) node: QNode,
    pub(crate) entity_type: Arc<EntityType>,
    /// `(field index, column position)` pairs.
    pub(crate) columns: Vec<(usize, usize)>,
    pub(crate) key_position: usize,
    pub(crate) join: Option<QJoin>,
    /// The join returns the parent's whole collection.
    pub(crate) completes_collection: bool,
}

/// A query tree rendered into a select plan plus the column layout needed
/// to merge its rows.
#[derive(Debug, Clone)]
pub struct RenderedQuery {
    pub(crate) plan: SelectPlan,
    pub(crate) fetched: Vec<FetchedNode>,
}

impl RenderedQuery {
    /// The select plan.
    pub fn plan(&self) -> &SelectPlan {
        &self.plan
    }
}

fn join_spec<T>(query: &QueryObject<T>, join: &QJoin, join_type: JoinType) -> Result<JoinSpec> {
    let from = query.node(join.from)?;
    let to = query.node(join.to)?;
    let (left, right) = match join.kind {
        QJoinKind::Reference { field, .. } => (
            ColumnRef::new(&from.alias, column_name(&from.entity_type.fields[field])),
            ColumnRef::new(&to.alias, to.entity_type.primary_key_column()),
        ),
        QJoinKind::Collection { mapped_by, .. } => (
            ColumnRef::new(&from.alias, from.entity_type.primary_key_column()),
            ColumnRef::new(&to.alias, column_name(&to.entity_type.fields[mapped_by])),
        ),
    };
    Ok(JoinSpec {
        table: TableRef::new(&to.entity_type.table, &to.alias),
        join_type,
        left,
        right,
    })
}

/// Render a query tree.
///
/// Fetch joins become left outer joins so rows without a match keep their
/// parent; filter joins become inner joins. Conditions of every main-query
/// node are conjoined into the where clause. A collection join marks the
/// parent's collection complete only when no condition narrows it, unless
/// `fetch_filtered` says otherwise.
pub(crate) fn render<T>(query: &QueryObject<T>, fetch_filtered: bool) -> Result<RenderedQuery> {
    let root = query.node(query.root())?;
    let mut plan = SelectPlan::new(TableRef::new(&root.entity_type.table, &root.alias));
    let mut fetched = Vec::new();
    let mut builder = PredicateBuilder { query };
    let mut predicate: Option<Predicate> = None;

    for (id, node) in query.main_nodes() {
        let mode = match &node.join {
            Some(join) => {
                let join_type = match join.mode {
                    JoinMode::Fetch => JoinType::LeftOuter,
                    JoinMode::Filter => JoinType::Inner,
                };
                plan.joins.push(join_spec(query, join, join_type)?);
                join.mode
            }
            None => JoinMode::Fetch,
        };

        if let Some(condition) = &node.condition {
            let rendered = condition.accept(&mut builder)?;
            predicate = Some(match predicate {
                None => rendered,
                Some(p) => Predicate::And(Box::new(p), Box::new(rendered)),
            });
        }

        if mode == JoinMode::Fetch {
            let entity_type = Arc::clone(&node.entity_type);
            let pk = entity_type.primary_key_index();
            let mut columns = Vec::new();
            let mut key_position = None;
            for (index, def) in entity_type.column_fields() {
                if Some(index) == pk {
                    key_position = Some(plan.columns.len());
                }
                columns.push((index, plan.columns.len()));
                plan.columns.push(ColumnRef::new(&node.alias, column_name(def)));
            }
            let key_position = key_position.ok_or_else(|| {
                Error::InvalidSchema(format!("'{}' has no primary-key column", entity_type.name))
            })?;
            let completes_collection = matches!(
                node.join,
                Some(QJoin { kind: QJoinKind::Collection { .. }, .. })
            ) && (fetch_filtered || !query.filtered_below(id));
            fetched.push(FetchedNode {
                node: id,
                entity_type,
                columns,
                key_position,
                join: node.join.clone(),
                completes_collection,
            });
        }
    }

    plan.predicate = predicate;
    for (property, direction) in &query.order_by {
        plan.order_by.push(OrderSpec {
            column: builder.column(property)?,
            direction: *direction,
        });
    }
    plan.lock = query.lock;
    Ok(RenderedQuery { plan, fetched })
}

/// Renders conditions into backend predicates.
struct PredicateBuilder<'q, T> {
    query: &'q QueryObject<T>,
}

impl<T> PredicateBuilder<'_, T> {
    fn field(&self, property: &QProperty) -> Result<&FieldDef> {
        let entity_type = self.query.entity_type(property.node)?;
        entity_type
            .fields
            .get(property.field)
            .ok_or_else(|| Error::UnknownProperty {
                entity_type: entity_type.name.clone(),
                property: property.name.clone(),
            })
    }

    fn column(&self, property: &QProperty) -> Result<ColumnRef> {
        let def = self.field(property)?;
        Ok(ColumnRef::new(self.query.alias(property.node)?, column_name(def)))
    }

    fn sub_plan(&mut self, root: QNode) -> Result<SelectPlan> {
        let query = self.query;
        let node = query.node(root)?;
        let mut plan = SelectPlan::new(TableRef::new(&node.entity_type.table, &node.alias));
        let join = node
            .join
            .as_ref()
            .ok_or_else(|| Error::InvalidQuery(format!("sub-query '{}' is not correlated", node.alias)))?;
        let owner = query.node(join.from)?;
        let correlation = match join.kind {
            QJoinKind::Reference { field, .. } => Predicate::Compare {
                column: ColumnRef::new(&node.alias, node.entity_type.primary_key_column()),
                op: CompareOp::Eq,
                operand: Operand::Column(ColumnRef::new(
                    &owner.alias,
                    column_name(&owner.entity_type.fields[field]),
                )),
            },
            QJoinKind::Collection { mapped_by, .. } => Predicate::Compare {
                column: ColumnRef::new(&node.alias, column_name(&node.entity_type.fields[mapped_by])),
                op: CompareOp::Eq,
                operand: Operand::Column(ColumnRef::new(
                    &owner.alias,
                    owner.entity_type.primary_key_column(),
                )),
            },
        };

        let mut predicate = correlation;
        for (id, sub) in query.sub_query_nodes(root) {
            if id != root {
                if let Some(join) = &sub.join {
                    plan.joins.push(join_spec(query, join, JoinType::Inner)?);
                }
            }
            if let Some(condition) = &sub.condition {
                let rendered = condition.accept(self)?;
                predicate = Predicate::And(Box::new(predicate), Box::new(rendered));
            }
        }
        plan.predicate = Some(predicate);
        Ok(plan)
    }
}

impl<T> ConditionVisitor for PredicateBuilder<'_, T> {
    type Output = Result<Predicate>;

    fn visit_property(&mut self, property: &QProperty, op: CompareOp, operand: &QOperand) -> Result<Predicate> {
        let column = self.column(property)?;
        let def = self.field(property)?;
        let definitions = &self.query.definitions;
        let convert = !matches!(op, CompareOp::Like | CompareOp::NotLike);
        let storage = |v: &Value| -> Result<Value> {
            if convert {
                to_storage(definitions, def, v.clone())
            } else {
                Ok(v.clone())
            }
        };
        let operand = match operand {
            QOperand::None => Operand::None,
            QOperand::Value(v) => Operand::Value(storage(v)?),
            QOperand::Values(values) => {
                Operand::Values(values.iter().map(storage).collect::<Result<_>>()?)
            }
            QOperand::Property(other) => Operand::Column(self.column(other)?),
        };
        Ok(Predicate::Compare {
            column,
            op,
            operand,
        })
    }

    fn visit_logical(&mut self, op: LogicalOp, left: &Condition, right: &Condition) -> Result<Predicate> {
        let left = Box::new(left.accept(self)?);
        let right = Box::new(right.accept(self)?);
        Ok(match op {
            LogicalOp::And => Predicate::And(left, right),
            LogicalOp::Or => Predicate::Or(left, right),
        })
    }

    fn visit_exists(&mut self, query: QNode, negated: bool) -> Result<Predicate> {
        Ok(Predicate::Exists {
            plan: Box::new(self.sub_plan(query)?),
            negated,
        })
    }
}
