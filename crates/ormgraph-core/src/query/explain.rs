//! Dialect-neutral text rendering and parameter collection.

use ormgraph_proto::{CompareOp, LockMode, OrderDirection, Value};

use super::condition::{Condition, ConditionVisitor, LogicalOp, QOperand, QProperty};
use super::object::{JoinMode, QJoinKind, QNode, QueryObject};
use crate::error::Result;

/// Renders conditions as `alias.property op value` text.
pub struct Explain<'q, T> {
    query: &'q QueryObject<T>,
}

impl<'q, T> Explain<'q, T> {
    /// Renderer over a query tree.
    pub fn new(query: &'q QueryObject<T>) -> Self {
        Self { query }
    }

    fn property(&self, property: &QProperty) -> Result<String> {
        Ok(format!("{}.{}", self.query.alias(property.node)?, property.name))
    }

    fn correlation(&self, root: QNode) -> Result<String> {
        let node = self.query.node(root)?;
        let Some(join) = &node.join else {
            return Ok(String::new());
        };
        let owner = self.query.node(join.from)?;
        Ok(match join.kind {
            QJoinKind::Reference { field, .. } => format!(
                "{}.{} = {}.{}",
                node.alias, node.entity_type.primary_key, owner.alias, owner.entity_type.fields[field].name
            ),
            QJoinKind::Collection { mapped_by, .. } => format!(
                "{}.{} = {}.{}",
                node.alias,
                node.entity_type.fields[mapped_by].name,
                owner.alias,
                owner.entity_type.primary_key
            ),
        })
    }

    /// Full multi-line description of the query tree.
    pub fn render(&mut self) -> Result<String> {
        let query = self.query;
        let mut lines = Vec::new();
        let mut conditions = Vec::new();
        for (id, node) in query.main_nodes() {
            match &node.join {
                None => lines.push(format!(
                    "from {} {}",
                    node.entity_type.qualified_name(),
                    node.alias
                )),
                Some(join) => {
                    let mode = match join.mode {
                        JoinMode::Fetch => "fetch",
                        JoinMode::Filter => "filter",
                    };
                    let hop = if node.internal { " [join table]" } else { "" };
                    lines.push(format!(
                        "  {mode} {}.{} -> {} {}{hop}",
                        query.alias(join.from)?,
                        join.property,
                        node.entity_type.qualified_name(),
                        node.alias
                    ));
                }
            }
            if let Some(condition) = query.condition(id)? {
                conditions.push(condition.accept(self)?);
            }
        }
        if !conditions.is_empty() {
            lines.push(format!("where {}", conditions.join(" and ")));
        }
        if !query.order_by.is_empty() {
            let keys = query
                .order_by
                .iter()
                .map(|(p, d)| {
                    let dir = match d {
                        OrderDirection::Asc => "asc",
                        OrderDirection::Desc => "desc",
                    };
                    self.property(p).map(|p| format!("{p} {dir}"))
                })
                .collect::<Result<Vec<_>>>()?;
            lines.push(format!("order by {}", keys.join(", ")));
        }
        match query.lock {
            LockMode::None => {}
            LockMode::ForUpdate => lines.push("for update".to_string()),
            LockMode::ForUpdateWait(n) => lines.push(format!("for update wait {n}")),
        }
        Ok(lines.join("\n"))
    }
}

impl<T> ConditionVisitor for Explain<'_, T> {
    type Output = Result<String>;

    fn visit_property(&mut self, property: &QProperty, op: CompareOp, operand: &QOperand) -> Result<String> {
        let left = self.property(property)?;
        Ok(match operand {
            QOperand::None => format!("{left} {}", op.symbol()),
            QOperand::Value(v) => format!("{left} {} {v}", op.symbol()),
            QOperand::Values(values) => {
                let list: Vec<String> = values.iter().map(Value::to_string).collect();
                format!("{left} {} ({})", op.symbol(), list.join(", "))
            }
            QOperand::Property(other) => format!("{left} {} {}", op.symbol(), self.property(other)?),
        })
    }

    fn visit_logical(&mut self, op: LogicalOp, left: &Condition, right: &Condition) -> Result<String> {
        Ok(format!(
            "({} {} {})",
            left.accept(self)?,
            op.keyword(),
            right.accept(self)?
        ))
    }

    fn visit_exists(&mut self, root: QNode, negated: bool) -> Result<String> {
        let query = self.query;
        let node = query.node(root)?;
        let mut text = format!(
            "{}exists (from {} {}",
            if negated { "not " } else { "" },
            node.entity_type.qualified_name(),
            node.alias
        );
        for (id, sub) in query.sub_query_nodes(root) {
            if id == root {
                continue;
            }
            if let Some(join) = &sub.join {
                text.push_str(&format!(
                    " join {}.{} -> {} {}",
                    query.alias(join.from)?,
                    join.property,
                    sub.entity_type.qualified_name(),
                    sub.alias
                ));
            }
        }
        let mut conditions = vec![self.correlation(root)?];
        for (_, sub) in query.sub_query_nodes(root) {
            if let Some(condition) = &sub.condition {
                conditions.push(condition.accept(self)?);
            }
        }
        text.push_str(&format!(" where {})", conditions.join(" and ")));
        Ok(text)
    }
}

/// Collects bound values in rendering order.
pub(crate) struct Parameters<'q, T> {
    query: &'q QueryObject<T>,
    values: Vec<Value>,
}

impl<'q, T> Parameters<'q, T> {
    pub(crate) fn collect(query: &'q QueryObject<T>) -> Vec<Value> {
        let mut collector = Parameters {
            query,
            values: Vec::new(),
        };
        for (_, node) in query.main_nodes() {
            if let Some(condition) = &node.condition {
                condition.accept(&mut collector);
            }
        }
        collector.values
    }
}

impl<T> ConditionVisitor for Parameters<'_, T> {
    type Output = ();

    fn visit_property(&mut self, _property: &QProperty, _op: CompareOp, operand: &QOperand) {
        match operand {
            QOperand::Value(v) => self.values.push(v.clone()),
            QOperand::Values(values) => self.values.extend(values.iter().cloned()),
            QOperand::None | QOperand::Property(_) => {}
        }
    }

    fn visit_logical(&mut self, _op: LogicalOp, left: &Condition, right: &Condition) {
        left.accept(self);
        right.accept(self);
    }

    fn visit_exists(&mut self, root: QNode, _negated: bool) {
        let query = self.query;
        for (_, sub) in query.sub_query_nodes(root) {
            if let Some(condition) = &sub.condition {
                condition.accept(self);
            }
        }
    }
}

impl<T> QueryObject<T> {
    /// Multi-line description: the join tree, the conditions, ordering and
    /// locking, with every node named by its alias.
    pub fn explain(&self) -> Result<String> {
        Explain::new(self).render()
    }

    /// Values bound by the conditions, in rendering order.
    pub fn parameters(&self) -> Vec<Value> {
        Parameters::collect(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::definitions;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_explain_tree() {
        let mut q: QueryObject = QueryObject::new(definitions(), "app", "User").unwrap();
        let root = q.root();
        let team = q.join(root, "team").unwrap();
        q.and(root, q.prop(root, "name").unwrap().like("A%")).unwrap();
        q.and(
            team,
            q.prop(team, "id").unwrap().is_in([1i64, 2]).or(q.prop(team, "name").unwrap().is_null()),
        )
        .unwrap();
        let others = q.exists(team, "members").unwrap();
        q.and(others, q.prop(others, "name").unwrap().eq("Bob")).unwrap();
        q.and_exists(team, others).unwrap();
        q.order_by(q.prop(root, "name").unwrap(), OrderDirection::Desc).unwrap();
        q.for_update();

        let expected = "from app.User a\n  \
            fetch a.team -> app.Team b\n\
            where a.name like 'A%' and ((b.id in (1, 2) or b.name is null) and \
            exists (from app.User c where c.team = b.id and c.name = 'Bob'))\n\
            order by a.name desc\n\
            for update";
        assert_eq!(q.explain().unwrap(), expected);
        assert_eq!(
            q.parameters(),
            vec![
                Value::from("A%"),
                Value::Int64(1),
                Value::Int64(2),
                Value::from("Bob")
            ]
        );
    }
}
