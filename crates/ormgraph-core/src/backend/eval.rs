//! Select-plan evaluation over plain rows.
//!
//! Shared by the reference backends: nested-loop joins, predicate
//! evaluation (including correlated EXISTS), ordering and projection.

use std::cmp::Ordering;
use std::collections::HashMap;

use ormgraph_proto::{
    BackendError, ColumnRef, CompareOp, JoinType, Operand, OrderDirection, Predicate, ResultSet,
    SelectPlan, Value,
};

/// One stored row, by column name.
pub(crate) type Row = HashMap<String, Value>;

/// Rows bound to aliases; `None` marks an outer-join miss.
type Tuple = Vec<(String, Option<Row>)>;

/// Table access for the evaluator.
pub(crate) trait RowSource {
    /// All rows of a table, in storage order.
    fn scan(&self, table: &str) -> Result<Vec<Row>, BackendError>;
}

/// Evaluate a plan and project its columns.
pub(crate) fn select(source: &dyn RowSource, plan: &SelectPlan) -> Result<ResultSet, BackendError> {
    let tuples = matching(source, plan, &[])?;
    let mut result = ResultSet::new(plan.columns.clone());
    for tuple in &tuples {
        let row = plan
            .columns
            .iter()
            .map(|c| lookup(c, tuple, &[]))
            .collect::<Result<Vec<_>, _>>()?;
        result.rows.push(row);
    }
    Ok(result)
}

fn matching(
    source: &dyn RowSource,
    plan: &SelectPlan,
    outer: &[(String, Option<Row>)],
) -> Result<Vec<Tuple>, BackendError> {
    let mut tuples: Vec<Tuple> = source
        .scan(&plan.root.table)?
        .into_iter()
        .map(|row| vec![(plan.root.alias.clone(), Some(row))])
        .collect();

    for join in &plan.joins {
        let right_rows = source.scan(&join.table.table)?;
        let mut joined = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let left = lookup(&join.left, &tuple, outer)?;
            let matches: Vec<&Row> = right_rows
                .iter()
                .filter(|r| {
                    r.get(&join.right.column)
                        .is_some_and(|v| v.matches(&left))
                })
                .collect();
            if matches.is_empty() {
                if join.join_type == JoinType::LeftOuter {
                    let mut extended = tuple;
                    extended.push((join.table.alias.clone(), None));
                    joined.push(extended);
                }
                continue;
            }
            for row in matches {
                let mut extended = tuple.clone();
                extended.push((join.table.alias.clone(), Some(row.clone())));
                joined.push(extended);
            }
        }
        tuples = joined;
    }

    if let Some(predicate) = &plan.predicate {
        let mut kept = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            if evaluate(source, predicate, &tuple, outer)? {
                kept.push(tuple);
            }
        }
        tuples = kept;
    }

    if !plan.order_by.is_empty() {
        let mut keyed = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let keys = plan
                .order_by
                .iter()
                .map(|o| lookup(&o.column, &tuple, outer))
                .collect::<Result<Vec<_>, _>>()?;
            keyed.push((keys, tuple));
        }
        keyed.sort_by(|(a, _), (b, _)| {
            for (spec, (x, y)) in plan.order_by.iter().zip(a.iter().zip(b)) {
                let ord = match (x.is_null(), y.is_null()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => x.compare(y).unwrap_or(Ordering::Equal),
                };
                let ord = match spec.direction {
                    OrderDirection::Asc => ord,
                    OrderDirection::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        tuples = keyed.into_iter().map(|(_, t)| t).collect();
    }

    Ok(tuples)
}

fn lookup(
    column: &ColumnRef,
    tuple: &[(String, Option<Row>)],
    outer: &[(String, Option<Row>)],
) -> Result<Value, BackendError> {
    let binding = tuple
        .iter()
        .chain(outer.iter())
        .find(|(alias, _)| *alias == column.alias)
        .ok_or_else(|| BackendError::UnknownColumn {
            table: column.alias.clone(),
            column: column.column.clone(),
        })?;
    Ok(binding
        .1
        .as_ref()
        .and_then(|row| row.get(&column.column))
        .cloned()
        .unwrap_or(Value::Null))
}

fn evaluate(
    source: &dyn RowSource,
    predicate: &Predicate,
    tuple: &[(String, Option<Row>)],
    outer: &[(String, Option<Row>)],
) -> Result<bool, BackendError> {
    match predicate {
        Predicate::Compare {
            column,
            op,
            operand,
        } => {
            let left = lookup(column, tuple, outer)?;
            let right = match operand {
                Operand::None => Value::Null,
                Operand::Value(v) => v.clone(),
                Operand::Values(_) => Value::Null,
                Operand::Column(c) => lookup(c, tuple, outer)?,
            };
            Ok(match op {
                CompareOp::Eq => left.matches(&right),
                CompareOp::Ne => !left.is_null() && !right.is_null() && !left.matches(&right),
                CompareOp::Lt => ordered(&left, &right, Ordering::is_lt),
                CompareOp::Le => ordered(&left, &right, Ordering::is_le),
                CompareOp::Gt => ordered(&left, &right, Ordering::is_gt),
                CompareOp::Ge => ordered(&left, &right, Ordering::is_ge),
                CompareOp::In => in_list(&left, operand),
                CompareOp::NotIn => !left.is_null() && !in_list(&left, operand),
                CompareOp::Like => like(&left, &right),
                CompareOp::NotLike => {
                    left.as_str().is_some() && right.as_str().is_some() && !like(&left, &right)
                }
                CompareOp::IsNull => left.is_null(),
                CompareOp::IsNotNull => !left.is_null(),
            })
        }
        Predicate::And(a, b) => {
            Ok(evaluate(source, a, tuple, outer)? && evaluate(source, b, tuple, outer)?)
        }
        Predicate::Or(a, b) => {
            Ok(evaluate(source, a, tuple, outer)? || evaluate(source, b, tuple, outer)?)
        }
        Predicate::Exists { plan, negated } => {
            let mut scope: Vec<(String, Option<Row>)> = tuple.to_vec();
            scope.extend(outer.iter().cloned());
            let found = !matching(source, plan, &scope)?.is_empty();
            Ok(found != *negated)
        }
    }
}

fn ordered(left: &Value, right: &Value, test: fn(Ordering) -> bool) -> bool {
    left.compare(right).is_some_and(test)
}

fn in_list(left: &Value, operand: &Operand) -> bool {
    match operand {
        Operand::Values(values) => values.iter().any(|v| left.matches(v)),
        Operand::Value(v) => left.matches(v),
        _ => false,
    }
}

fn like(left: &Value, right: &Value) -> bool {
    match (left.as_str(), right.as_str()) {
        (Some(value), Some(pattern)) => like_match(value, pattern),
        _ => false,
    }
}

/// SQL LIKE: `%` matches any run of characters, `_` exactly one.
pub(crate) fn like_match(value: &str, pattern: &str) -> bool {
    let value: Vec<char> = value.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    like_at(&value, &pattern)
}

fn like_at(value: &[char], pattern: &[char]) -> bool {
    match pattern.split_first() {
        None => value.is_empty(),
        Some(('%', rest)) => {
            rest.is_empty() || (0..=value.len()).any(|i| like_at(&value[i..], rest))
        }
        Some(('_', rest)) => !value.is_empty() && like_at(&value[1..], rest),
        Some((c, rest)) => value.first() == Some(c) && like_at(&value[1..], rest),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormgraph_proto::{JoinSpec, TableRef};

    struct Tables(HashMap<String, Vec<Row>>);

    impl RowSource for Tables {
        fn scan(&self, table: &str) -> Result<Vec<Row>, BackendError> {
            self.0
                .get(table)
                .cloned()
                .ok_or_else(|| BackendError::UnknownTable(table.to_string()))
        }
    }

    fn row(values: &[(&str, Value)]) -> Row {
        values
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn tables() -> Tables {
        let mut t = HashMap::new();
        t.insert(
            "team".to_string(),
            vec![
                row(&[("id", Value::Int64(1)), ("name", "Core".into())]),
                row(&[("id", Value::Int64(2)), ("name", "Empty".into())]),
            ],
        );
        t.insert(
            "app_user".to_string(),
            vec![
                row(&[("id", Value::Int64(10)), ("team_id", Value::Int64(1))]),
                row(&[("id", Value::Int64(11)), ("team_id", Value::Int64(1))]),
            ],
        );
        Tables(t)
    }

    #[test]
    fn test_like_match() {
        assert!(like_match("hello", "h%"));
        assert!(like_match("hello", "%llo"));
        assert!(like_match("hello", "h_llo"));
        assert!(like_match("hello", "%"));
        assert!(!like_match("hello", "h_lo"));
        assert!(!like_match("", "_"));
    }

    #[test]
    fn test_left_outer_join_keeps_unmatched() {
        let mut plan = SelectPlan::new(TableRef::new("team", "a"));
        plan.joins.push(JoinSpec {
            table: TableRef::new("app_user", "b"),
            join_type: JoinType::LeftOuter,
            left: ColumnRef::new("a", "id"),
            right: ColumnRef::new("b", "team_id"),
        });
        plan.columns = vec![ColumnRef::new("a", "id"), ColumnRef::new("b", "id")];

        let rs = select(&tables(), &plan).unwrap();
        assert_eq!(rs.len(), 3);
        assert_eq!(rs.rows[2], vec![Value::Int64(2), Value::Null]);
    }

    #[test]
    fn test_correlated_exists() {
        let mut sub = SelectPlan::new(TableRef::new("app_user", "b"));
        sub.predicate = Some(Predicate::Compare {
            column: ColumnRef::new("b", "team_id"),
            op: CompareOp::Eq,
            operand: Operand::Column(ColumnRef::new("a", "id")),
        });
        let mut plan = SelectPlan::new(TableRef::new("team", "a"));
        plan.columns = vec![ColumnRef::new("a", "name")];
        plan.predicate = Some(Predicate::Exists {
            plan: Box::new(sub),
            negated: true,
        });

        let rs = select(&tables(), &plan).unwrap();
        assert_eq!(rs.rows, vec![vec![Value::from("Empty")]]);
    }
}
