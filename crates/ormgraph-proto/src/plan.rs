//! Select plans handed to a row-access backend.
//!
//! A plan is the rendered, dialect-neutral form of a query tree: one root
//! table, a list of joins each wired to an earlier alias, an optional
//! predicate tree and the projected columns. Backends translate this into
//! their own SQL (or evaluate it directly).

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// A table occurrence in a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRef {
    /// Table name.
    pub table: String,
    /// Alias unique within the plan (and its sub-plans).
    pub alias: String,
}

impl TableRef {
    /// Create a table reference.
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
        }
    }
}

/// A column qualified by the alias of its table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColumnRef {
    /// Table alias.
    pub alias: String,
    /// Column name.
    pub column: String,
}

impl ColumnRef {
    /// Create a column reference.
    pub fn new(alias: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            column: column.into(),
        }
    }
}

impl std::fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.alias, self.column)
    }
}

/// Join flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    /// Only rows with a match on both sides.
    Inner,
    /// Keep the left row when the right side has no match.
    LeftOuter,
}

/// A join of `table` onto an alias that appears earlier in the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JoinSpec {
    /// Joined table.
    pub table: TableRef,
    /// Join flavour.
    pub join_type: JoinType,
    /// Column on the already-joined side.
    pub left: ColumnRef,
    /// Column on the joined table.
    pub right: ColumnRef,
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    /// `=`
    Eq,
    /// `<>`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `IN (...)`
    In,
    /// `NOT IN (...)`
    NotIn,
    /// `LIKE` with `%` and `_` wildcards.
    Like,
    /// `NOT LIKE`
    NotLike,
    /// `IS NULL`
    IsNull,
    /// `IS NOT NULL`
    IsNotNull,
}

impl CompareOp {
    /// Operator token used in rendered predicates.
    pub fn symbol(&self) -> &'static str {
        match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "<>",
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::In => "in",
            CompareOp::NotIn => "not in",
            CompareOp::Like => "like",
            CompareOp::NotLike => "not like",
            CompareOp::IsNull => "is null",
            CompareOp::IsNotNull => "is not null",
        }
    }
}

/// Right-hand side of a comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operand {
    /// No operand (`IS NULL` / `IS NOT NULL`).
    None,
    /// A bound parameter.
    Value(Value),
    /// A list of bound parameters.
    Values(Vec<Value>),
    /// Another column, possibly of an enclosing plan (correlation).
    Column(ColumnRef),
}

/// A predicate tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Column comparison.
    Compare {
        /// Left-hand column.
        column: ColumnRef,
        /// Operator.
        op: CompareOp,
        /// Right-hand side.
        operand: Operand,
    },
    /// Both sides hold.
    And(Box<Predicate>, Box<Predicate>),
    /// Either side holds.
    Or(Box<Predicate>, Box<Predicate>),
    /// A correlated sub-plan has (or, negated, has not) at least one row.
    Exists {
        /// The sub-plan; its predicate may reference enclosing aliases.
        plan: Box<SelectPlan>,
        /// `NOT EXISTS` when true.
        negated: bool,
    },
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderDirection {
    /// Ascending order.
    Asc,
    /// Descending order.
    Desc,
}

/// Sort key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderSpec {
    /// Column to sort by.
    pub column: ColumnRef,
    /// Sort direction.
    pub direction: OrderDirection,
}

/// Row locking requested for a select.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum LockMode {
    /// Plain read.
    #[default]
    None,
    /// `FOR UPDATE`
    ForUpdate,
    /// `FOR UPDATE WAIT n` (seconds).
    ForUpdateWait(u32),
}

/// A complete select.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectPlan {
    /// Root table.
    pub root: TableRef,
    /// Joins, each referring to an alias introduced before it.
    pub joins: Vec<JoinSpec>,
    /// Projected columns, in result order. Empty for EXISTS sub-plans.
    pub columns: Vec<ColumnRef>,
    /// Filter.
    pub predicate: Option<Predicate>,
    /// Ordering.
    pub order_by: Vec<OrderSpec>,
    /// Row locking.
    pub lock: LockMode,
}

impl SelectPlan {
    /// Create a plan over a single table.
    pub fn new(root: TableRef) -> Self {
        Self {
            root,
            joins: Vec::new(),
            columns: Vec::new(),
            predicate: None,
            order_by: Vec::new(),
            lock: LockMode::None,
        }
    }

    /// All aliases introduced by this plan (not by nested sub-plans).
    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.root.alias.as_str())
            .chain(self.joins.iter().map(|j| j.table.alias.as_str()))
    }

    /// Find the table bound to an alias.
    pub fn table_for(&self, alias: &str) -> Option<&str> {
        if self.root.alias == alias {
            return Some(&self.root.table);
        }
        self.joins
            .iter()
            .find(|j| j.table.alias == alias)
            .map(|j| j.table.table.as_str())
    }

    /// Position of a projected column.
    pub fn column_index(&self, column: &ColumnRef) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

/// Rows returned for one select plan, in the plan's column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Column layout.
    pub columns: Vec<ColumnRef>,
    /// Row data.
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// Create an empty result set with the given layout.
    pub fn new(columns: Vec<ColumnRef>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of a column in a row.
    pub fn get(&self, row: usize, column: &ColumnRef) -> Option<&Value> {
        let idx = self.columns.iter().position(|c| c == column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_aliases() {
        let mut plan = SelectPlan::new(TableRef::new("user", "a"));
        plan.joins.push(JoinSpec {
            table: TableRef::new("team", "b"),
            join_type: JoinType::LeftOuter,
            left: ColumnRef::new("a", "team_id"),
            right: ColumnRef::new("b", "id"),
        });

        let aliases: Vec<&str> = plan.aliases().collect();
        assert_eq!(aliases, vec!["a", "b"]);
        assert_eq!(plan.table_for("b"), Some("team"));
        assert_eq!(plan.table_for("c"), None);
    }

    #[test]
    fn test_result_set_lookup() {
        let name = ColumnRef::new("a", "name");
        let mut rs = ResultSet::new(vec![ColumnRef::new("a", "id"), name.clone()]);
        rs.rows.push(vec![Value::Int64(1), Value::from("Ann")]);

        assert_eq!(rs.get(0, &name), Some(&Value::from("Ann")));
        assert_eq!(rs.get(1, &name), None);
    }
}
