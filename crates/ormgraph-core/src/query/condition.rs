//! Condition trees and their visitor.

use ormgraph_proto::{CompareOp, Value};

use super::object::QNode;

/// A column-backed property of a query node.
///
/// Obtained from [`QueryObject::prop`](super::QueryObject::prop), which checks
/// the property against the node's entity type.
#[derive(Debug, Clone, PartialEq)]
pub struct QProperty {
    pub(crate) node: QNode,
    pub(crate) name: String,
    pub(crate) field: usize,
}

impl QProperty {
    /// Query node the property belongs to.
    pub fn node(&self) -> QNode {
        self.node
    }

    /// Property name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Compare against an operand.
    pub fn compare(self, op: CompareOp, operand: QOperand) -> Condition {
        Condition::Property {
            property: self,
            op,
            operand,
        }
    }

    /// `= value`
    pub fn eq(self, value: impl Into<Value>) -> Condition {
        self.compare(CompareOp::Eq, QOperand::Value(value.into()))
    }

    /// `<> value`
    pub fn ne(self, value: impl Into<Value>) -> Condition {
        self.compare(CompareOp::Ne, QOperand::Value(value.into()))
    }

    /// `< value`
    pub fn lt(self, value: impl Into<Value>) -> Condition {
        self.compare(CompareOp::Lt, QOperand::Value(value.into()))
    }

    /// `<= value`
    pub fn le(self, value: impl Into<Value>) -> Condition {
        self.compare(CompareOp::Le, QOperand::Value(value.into()))
    }

    /// `> value`
    pub fn gt(self, value: impl Into<Value>) -> Condition {
        self.compare(CompareOp::Gt, QOperand::Value(value.into()))
    }

    /// `>= value`
    pub fn ge(self, value: impl Into<Value>) -> Condition {
        self.compare(CompareOp::Ge, QOperand::Value(value.into()))
    }

    /// `in (values)`
    pub fn is_in(self, values: impl IntoIterator<Item = impl Into<Value>>) -> Condition {
        let values = values.into_iter().map(Into::into).collect();
        self.compare(CompareOp::In, QOperand::Values(values))
    }

    /// `not in (values)`
    pub fn not_in(self, values: impl IntoIterator<Item = impl Into<Value>>) -> Condition {
        let values = values.into_iter().map(Into::into).collect();
        self.compare(CompareOp::NotIn, QOperand::Values(values))
    }

    /// `like pattern`
    pub fn like(self, pattern: impl Into<String>) -> Condition {
        self.compare(CompareOp::Like, QOperand::Value(Value::String(pattern.into())))
    }

    /// `not like pattern`
    pub fn not_like(self, pattern: impl Into<String>) -> Condition {
        self.compare(CompareOp::NotLike, QOperand::Value(Value::String(pattern.into())))
    }

    /// `is null`
    pub fn is_null(self) -> Condition {
        self.compare(CompareOp::IsNull, QOperand::None)
    }

    /// `is not null`
    pub fn is_not_null(self) -> Condition {
        self.compare(CompareOp::IsNotNull, QOperand::None)
    }

    /// `= other`, where `other` may belong to an enclosing query.
    pub fn eq_property(self, other: QProperty) -> Condition {
        self.compare(CompareOp::Eq, QOperand::Property(other))
    }
}

/// Right-hand side of a property condition.
#[derive(Debug, Clone, PartialEq)]
pub enum QOperand {
    /// No operand (`is null`, `is not null`).
    None,
    /// A single value.
    Value(Value),
    /// A value list.
    Values(Vec<Value>),
    /// Another property.
    Property(QProperty),
}

/// Boolean connective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    /// Both sides hold.
    And,
    /// Either side holds.
    Or,
}

impl LogicalOp {
    /// Lowercase keyword.
    pub fn keyword(&self) -> &'static str {
        match self {
            LogicalOp::And => "and",
            LogicalOp::Or => "or",
        }
    }
}

/// A binary condition tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Property comparison.
    Property {
        /// Left-hand property.
        property: QProperty,
        /// Operator.
        op: CompareOp,
        /// Right-hand side.
        operand: QOperand,
    },
    /// Conjunction or disjunction.
    Logical {
        /// Connective.
        op: LogicalOp,
        /// Left subtree.
        left: Box<Condition>,
        /// Right subtree.
        right: Box<Condition>,
    },
    /// Correlated sub-query filter.
    Exists {
        /// Root node of the sub-query.
        query: QNode,
        /// `not exists` when true.
        negated: bool,
    },
}

impl Condition {
    /// `self and other`
    pub fn and(self, other: Condition) -> Condition {
        Condition::Logical {
            op: LogicalOp::And,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    /// `self or other`
    pub fn or(self, other: Condition) -> Condition {
        Condition::Logical {
            op: LogicalOp::Or,
            left: Box::new(self),
            right: Box::new(other),
        }
    }

    /// Dispatch to the visitor method matching this node.
    pub fn accept<V: ConditionVisitor + ?Sized>(&self, visitor: &mut V) -> V::Output {
        match self {
            Condition::Property {
                property,
                op,
                operand,
            } => visitor.visit_property(property, *op, operand),
            Condition::Logical { op, left, right } => visitor.visit_logical(*op, left, right),
            Condition::Exists { query, negated } => visitor.visit_exists(*query, *negated),
        }
    }
}

/// Traversal over condition trees.
///
/// Visitors recurse explicitly by calling [`Condition::accept`] on the
/// subtrees they care about.
pub trait ConditionVisitor {
    /// Result of visiting one node.
    type Output;

    /// A property comparison.
    fn visit_property(&mut self, property: &QProperty, op: CompareOp, operand: &QOperand)
        -> Self::Output;

    /// An `and`/`or` node.
    fn visit_logical(&mut self, op: LogicalOp, left: &Condition, right: &Condition)
        -> Self::Output;

    /// An `exists` node.
    fn visit_exists(&mut self, query: QNode, negated: bool) -> Self::Output;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Depth;

    impl ConditionVisitor for Depth {
        type Output = usize;

        fn visit_property(&mut self, _: &QProperty, _: CompareOp, _: &QOperand) -> usize {
            1
        }

        fn visit_logical(&mut self, _: LogicalOp, left: &Condition, right: &Condition) -> usize {
            1 + left.accept(self).max(right.accept(self))
        }

        fn visit_exists(&mut self, _: QNode, _: bool) -> usize {
            1
        }
    }

    fn prop(name: &str) -> QProperty {
        QProperty {
            node: QNode(0),
            name: name.to_string(),
            field: 0,
        }
    }

    #[test]
    fn test_combinators_build_binary_tree() {
        let cond = prop("name")
            .eq("Ann")
            .and(prop("age").gt(30i64).or(prop("age").is_null()));

        assert_eq!(cond.accept(&mut Depth), 3);
        match cond {
            Condition::Logical { op, right, .. } => {
                assert_eq!(op, LogicalOp::And);
                assert!(matches!(*right, Condition::Logical { op: LogicalOp::Or, .. }));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_list_operands() {
        let cond = prop("id").is_in([1i64, 2, 3]);
        match cond {
            Condition::Property {
                op: CompareOp::In,
                operand: QOperand::Values(values),
                ..
            } => assert_eq!(values.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }
}
