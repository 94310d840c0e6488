//! Query trees.

use std::marker::PhantomData;
use std::sync::Arc;

use ormgraph_proto::{CompareOp, LockMode, OrderDirection, Value};

use super::condition::{Condition, ConditionVisitor, LogicalOp, QOperand, QProperty};
use crate::catalog::{Definitions, EntityType, FieldKind, ScalarType};
use crate::context::GenericProxy;
use crate::error::{Error, Result};

/// Handle of a node in a query tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QNode(pub(crate) usize);

/// How a joined node takes part in the query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Rows of the joined type are merged into the context.
    Fetch,
    /// The join only narrows the result.
    Filter,
}

/// Direction of a join edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QJoinKind {
    /// `from` holds the foreign key (`field`) to `to`.
    Reference {
        /// Reference field on `from`.
        field: usize,
        /// Whether the reference may be null.
        nullable: bool,
    },
    /// `to` holds the foreign key (`mapped_by`) back to `from`.
    Collection {
        /// To-many field on `from`.
        field: usize,
        /// Back-reference field on `to`.
        mapped_by: usize,
    },
}

/// Edge between a node and its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct QJoin {
    /// Parent node.
    pub from: QNode,
    /// Joined node.
    pub to: QNode,
    /// Relation property on the parent.
    pub property: String,
    /// Edge direction.
    pub kind: QJoinKind,
    /// Fetch or filter.
    pub mode: JoinMode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Scope {
    Main,
    Exists { root: QNode, owner: QNode },
}

#[derive(Debug, Clone)]
pub(crate) struct QueryNode {
    pub(crate) entity_type: Arc<EntityType>,
    pub(crate) alias: String,
    pub(crate) join: Option<QJoin>,
    pub(crate) condition: Option<Condition>,
    pub(crate) scope: Scope,
    /// Join-table hop inserted by the tree, not requested by the caller.
    pub(crate) internal: bool,
}

impl QueryNode {
    pub(crate) fn scope_root(&self) -> QNode {
        match self.scope {
            Scope::Main => QNode(0),
            Scope::Exists { root, .. } => root,
        }
    }
}

/// Alias for the node at `index`: `a`..`z`, then `aa`, `ab`, ...
pub(crate) fn alias_for(mut index: usize) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push((b'a' + (index % 26) as u8) as char);
        if index < 26 {
            break;
        }
        index = index / 26 - 1;
    }
    letters.iter().rev().collect()
}

/// A structural query: a tree of entity-type nodes connected by joins,
/// each carrying an optional condition.
///
/// `T` is the proxy type the results are issued as.
pub struct QueryObject<T = GenericProxy> {
    pub(crate) definitions: Arc<Definitions>,
    pub(crate) nodes: Vec<QueryNode>,
    pub(crate) order_by: Vec<(QProperty, OrderDirection)>,
    pub(crate) lock: LockMode,
    _proxy: PhantomData<fn() -> T>,
}

impl<T> Clone for QueryObject<T> {
    fn clone(&self) -> Self {
        Self {
            definitions: Arc::clone(&self.definitions),
            nodes: self.nodes.clone(),
            order_by: self.order_by.clone(),
            lock: self.lock,
            _proxy: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for QueryObject<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryObject")
            .field("root", &self.nodes[0].entity_type.qualified_name())
            .field("nodes", &self.nodes.len())
            .field("lock", &self.lock)
            .finish()
    }
}

impl<T> QueryObject<T> {
    /// Query over the entity type `namespace.name`.
    pub fn new(definitions: Arc<Definitions>, namespace: &str, name: &str) -> Result<Self> {
        let entity_type = definitions.lookup(namespace, name)?;
        Ok(Self::for_type(definitions, entity_type))
    }

    /// Query over an already resolved entity type.
    pub fn for_type(definitions: Arc<Definitions>, entity_type: Arc<EntityType>) -> Self {
        let root = QueryNode {
            entity_type,
            alias: alias_for(0),
            join: None,
            condition: None,
            scope: Scope::Main,
            internal: false,
        };
        Self {
            definitions,
            nodes: vec![root],
            order_by: Vec::new(),
            lock: LockMode::None,
            _proxy: PhantomData,
        }
    }

    /// The root node.
    pub fn root(&self) -> QNode {
        QNode(0)
    }

    /// Catalog the query resolves against.
    pub fn definitions(&self) -> &Arc<Definitions> {
        &self.definitions
    }

    /// Number of nodes, sub-query nodes included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: a query has at least its root.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub(crate) fn node(&self, node: QNode) -> Result<&QueryNode> {
        self.nodes
            .get(node.0)
            .ok_or_else(|| Error::InvalidQuery(format!("unknown query node {}", node.0)))
    }

    fn node_mut(&mut self, node: QNode) -> Result<&mut QueryNode> {
        self.nodes
            .get_mut(node.0)
            .ok_or_else(|| Error::InvalidQuery(format!("unknown query node {}", node.0)))
    }

    /// Entity type of a node.
    pub fn entity_type(&self, node: QNode) -> Result<&Arc<EntityType>> {
        Ok(&self.node(node)?.entity_type)
    }

    /// Alias of a node.
    pub fn alias(&self, node: QNode) -> Result<&str> {
        Ok(&self.node(node)?.alias)
    }

    /// Aliases in node order.
    pub fn aliases(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.alias.as_str()).collect()
    }

    /// Join edge leading to a node.
    pub fn join_of(&self, node: QNode) -> Result<Option<&QJoin>> {
        Ok(self.node(node)?.join.as_ref())
    }

    /// Condition attached to a node.
    pub fn condition(&self, node: QNode) -> Result<Option<&Condition>> {
        Ok(self.node(node)?.condition.as_ref())
    }

    /// Requested row locking.
    pub fn lock(&self) -> LockMode {
        self.lock
    }

    /// Whether a node belongs to an `exists` sub-query.
    pub fn is_sub_query(&self, node: QNode) -> Result<bool> {
        Ok(matches!(self.node(node)?.scope, Scope::Exists { .. }))
    }

    /// A column-backed property of a node.
    pub fn prop(&self, node: QNode, name: &str) -> Result<QProperty> {
        let entity_type = &self.node(node)?.entity_type;
        let field = entity_type
            .field_index(name)
            .ok_or_else(|| Error::UnknownProperty {
                entity_type: entity_type.name.clone(),
                property: name.to_string(),
            })?;
        if entity_type.fields[field].is_to_many() {
            return Err(Error::InvalidNodeType {
                entity_type: entity_type.name.clone(),
                property: name.to_string(),
                expected: "value or reference",
            });
        }
        Ok(QProperty {
            node,
            name: name.to_string(),
            field,
        })
    }

    /// Join a relation and fetch the joined rows.
    pub fn join(&mut self, from: QNode, property: &str) -> Result<QNode> {
        self.join_with(from, property, JoinMode::Fetch)
    }

    /// Join a relation only to filter on it.
    pub fn join_for_filter(&mut self, from: QNode, property: &str) -> Result<QNode> {
        self.join_with(from, property, JoinMode::Filter)
    }

    /// Join a dotted relation path (`team.members`), fetching every hop.
    pub fn join_path(&mut self, from: QNode, path: &str) -> Result<QNode> {
        path.split('.')
            .try_fold(from, |node, property| self.join(node, property))
    }

    fn relation(&self, from: QNode, property: &str) -> Result<(usize, Arc<EntityType>, Arc<EntityType>)> {
        let from_type = Arc::clone(&self.node(from)?.entity_type);
        let index = from_type
            .field_index(property)
            .ok_or_else(|| Error::UnknownProperty {
                entity_type: from_type.name.clone(),
                property: property.to_string(),
            })?;
        let target = from_type.fields[index]
            .target()
            .ok_or_else(|| Error::InvalidNodeType {
                entity_type: from_type.name.clone(),
                property: property.to_string(),
                expected: "relation",
            })?;
        let target = self.definitions.resolve(&from_type, target)?;
        Ok((index, from_type, target))
    }

    fn push(
        &mut self,
        entity_type: Arc<EntityType>,
        join: QJoin,
        scope: Scope,
        internal: bool,
    ) -> QNode {
        let node = QNode(self.nodes.len());
        self.nodes.push(QueryNode {
            entity_type,
            alias: alias_for(node.0),
            join: Some(join),
            condition: None,
            scope,
            internal,
        });
        node
    }

    fn edge(
        &mut self,
        from: QNode,
        property: &str,
        mode: JoinMode,
        scope: Option<Scope>,
    ) -> Result<QNode> {
        let (index, from_type, target) = self.relation(from, property)?;
        let to = QNode(self.nodes.len());
        let scope = match scope {
            Some(scope) => scope,
            None => self.node(from)?.scope,
        };
        let def = &from_type.fields[index];
        match &def.kind {
            FieldKind::Reference { .. } => {
                let join = QJoin {
                    from,
                    to,
                    property: property.to_string(),
                    kind: QJoinKind::Reference {
                        field: index,
                        nullable: def.nullable,
                    },
                    mode,
                };
                Ok(self.push(target, join, scope, false))
            }
            FieldKind::ToMany {
                mapped_by,
                join_property,
                ..
            } => {
                let back = target
                    .field_index(mapped_by)
                    .ok_or_else(|| Error::UnknownProperty {
                        entity_type: target.name.clone(),
                        property: mapped_by.clone(),
                    })?;
                let join = QJoin {
                    from,
                    to,
                    property: property.to_string(),
                    kind: QJoinKind::Collection {
                        field: index,
                        mapped_by: back,
                    },
                    mode,
                };
                let join_property = join_property.clone();
                let child = self.push(target, join, scope, join_property.is_some());
                match join_property {
                    Some(hop) => self.edge(child, &hop, mode, None),
                    None => Ok(child),
                }
            }
            FieldKind::Value { .. } => Err(Error::InvalidNodeType {
                entity_type: from_type.name.clone(),
                property: property.to_string(),
                expected: "relation",
            }),
        }
    }

    fn join_with(&mut self, from: QNode, property: &str, mode: JoinMode) -> Result<QNode> {
        self.edge(from, property, mode, None)
    }

    /// Start a correlated sub-query over a relation of `from`.
    ///
    /// The returned node is the target of the relation inside the
    /// sub-query; attach conditions to it, then embed the sub-query with
    /// [`and_exists`](Self::and_exists) or [`or_exists`](Self::or_exists).
    /// For join-table relations the join row is hopped through.
    pub fn exists(&mut self, from: QNode, property: &str) -> Result<QNode> {
        self.node(from)?;
        let root = QNode(self.nodes.len());
        self.edge(
            from,
            property,
            JoinMode::Filter,
            Some(Scope::Exists { root, owner: from }),
        )
    }

    fn sub_query_root(&self, node: QNode) -> Result<(QNode, QNode)> {
        match self.node(node)?.scope {
            Scope::Exists { root, owner } => Ok((root, owner)),
            Scope::Main => Err(Error::InvalidQuery(format!(
                "node '{}' is not part of a sub-query",
                self.node(node)?.alias
            ))),
        }
    }

    /// Whether `target` can be referenced from conditions of `node`.
    pub(crate) fn visible(&self, node: QNode, target: QNode) -> Result<bool> {
        let target_root = self.node(target)?.scope_root();
        let mut current = node;
        loop {
            let current_node = self.node(current)?;
            if current_node.scope_root() == target_root {
                return Ok(true);
            }
            match current_node.scope {
                Scope::Exists { owner, .. } => current = owner,
                Scope::Main => return Ok(false),
            }
        }
    }

    fn attach(&mut self, node: QNode, condition: Condition, op: LogicalOp) -> Result<()> {
        Validator { query: self, node }.check(&condition)?;
        let slot = &mut self.node_mut(node)?.condition;
        *slot = Some(match slot.take() {
            None => condition,
            Some(existing) => match op {
                LogicalOp::And => existing.and(condition),
                LogicalOp::Or => existing.or(condition),
            },
        });
        Ok(())
    }

    /// Conjoin a condition to a node.
    pub fn and(&mut self, node: QNode, condition: Condition) -> Result<()> {
        self.attach(node, condition, LogicalOp::And)
    }

    /// Disjoin a condition with a node's existing condition.
    pub fn or(&mut self, node: QNode, condition: Condition) -> Result<()> {
        self.attach(node, condition, LogicalOp::Or)
    }

    /// Require the sub-query containing `sub` to have a row.
    pub fn and_exists(&mut self, node: QNode, sub: QNode) -> Result<()> {
        let (root, _) = self.sub_query_root(sub)?;
        self.and(node, Condition::Exists { query: root, negated: false })
    }

    /// Accept rows where the sub-query containing `sub` has a row.
    pub fn or_exists(&mut self, node: QNode, sub: QNode) -> Result<()> {
        let (root, _) = self.sub_query_root(sub)?;
        self.or(node, Condition::Exists { query: root, negated: false })
    }

    /// Require the sub-query containing `sub` to have no row.
    pub fn and_not_exists(&mut self, node: QNode, sub: QNode) -> Result<()> {
        let (root, _) = self.sub_query_root(sub)?;
        self.and(node, Condition::Exists { query: root, negated: true })
    }

    /// Sort the result by a property of a main-query node.
    pub fn order_by(&mut self, property: QProperty, direction: OrderDirection) -> Result<()> {
        if self.is_sub_query(property.node)? {
            return Err(Error::InvalidQuery(format!(
                "cannot order by sub-query property '{}'",
                property.name
            )));
        }
        self.order_by.push((property, direction));
        Ok(())
    }

    /// Lock the selected rows.
    pub fn for_update(&mut self) {
        self.lock = LockMode::ForUpdate;
    }

    /// Lock the selected rows, waiting at most `seconds`.
    pub fn for_update_wait(&mut self, seconds: u32) {
        self.lock = LockMode::ForUpdateWait(seconds);
    }

    /// Nodes of the main query (not of sub-queries), in creation order.
    pub(crate) fn main_nodes(&self) -> impl Iterator<Item = (QNode, &QueryNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.scope == Scope::Main)
            .map(|(i, n)| (QNode(i), n))
    }

    /// Nodes of the sub-query rooted at `root`, root first.
    pub(crate) fn sub_query_nodes(&self, root: QNode) -> impl Iterator<Item = (QNode, &QueryNode)> {
        self.nodes
            .iter()
            .enumerate()
            .filter(move |(i, n)| {
                matches!(n.scope, Scope::Exists { root: r, .. } if r == root)
                    || (QNode(*i) == root)
            })
            .map(|(i, n)| (QNode(i), n))
    }

    /// Whether any condition narrows the rows of `node` or of a node joined
    /// below it: either the condition sits there, or it compares one of their
    /// properties from wherever it is attached.
    pub(crate) fn filtered_below(&self, node: QNode) -> bool {
        self.nodes.iter().enumerate().any(|(i, n)| match &n.condition {
            Some(condition) => {
                self.descends_from(QNode(i), node)
                    || condition.accept(&mut References { query: self, node })
            }
            None => false,
        })
    }

    fn descends_from(&self, mut node: QNode, ancestor: QNode) -> bool {
        loop {
            if node == ancestor {
                return true;
            }
            match self.nodes.get(node.0).and_then(|n| n.join.as_ref()) {
                Some(join) if self.nodes[node.0].scope == self.nodes[join.from.0].scope => {
                    node = join.from
                }
                _ => return false,
            }
        }
    }
}

/// Finds property references to a node or the nodes joined below it.
struct References<'q, T> {
    query: &'q QueryObject<T>,
    node: QNode,
}

impl<T> References<'_, T> {
    fn touches(&self, property: &QProperty) -> bool {
        self.query.descends_from(property.node, self.node)
    }
}

impl<T> ConditionVisitor for References<'_, T> {
    type Output = bool;

    fn visit_property(&mut self, property: &QProperty, _: CompareOp, operand: &QOperand) -> bool {
        self.touches(property) || matches!(operand, QOperand::Property(other) if self.touches(other))
    }

    fn visit_logical(&mut self, _: LogicalOp, left: &Condition, right: &Condition) -> bool {
        left.accept(self) || right.accept(self)
    }

    // sub-query conditions are scanned with their own nodes
    fn visit_exists(&mut self, _: QNode, _: bool) -> bool {
        false
    }
}

/// Checks conditions at attach time.
struct Validator<'q, T> {
    query: &'q QueryObject<T>,
    node: QNode,
}

impl<T> Validator<'_, T> {
    fn check(&mut self, condition: &Condition) -> Result<()> {
        condition.accept(self)
    }

    fn field_type(&self, property: &QProperty) -> Result<ScalarType> {
        let entity_type = self.query.entity_type(property.node)?;
        entity_type
            .fields
            .get(property.field)
            .and_then(|f| f.value_type())
            .ok_or_else(|| Error::InvalidNodeType {
                entity_type: entity_type.name.clone(),
                property: property.name.clone(),
                expected: "value or reference",
            })
    }

    fn check_visible(&self, property: &QProperty) -> Result<()> {
        if self.query.visible(self.node, property.node)? {
            return Ok(());
        }
        Err(Error::InvalidQuery(format!(
            "property '{}.{}' is not in scope of node '{}'",
            self.query.alias(property.node)?,
            property.name,
            self.query.alias(self.node)?
        )))
    }

    fn check_value(&self, property: &QProperty, ty: ScalarType, value: &Value) -> Result<()> {
        if ty.accepts(value) {
            return Ok(());
        }
        Err(Error::TypeMismatch {
            entity_type: self.query.entity_type(property.node)?.name.clone(),
            field: property.name.clone(),
            expected: ty.to_string(),
            found: value.clone(),
        })
    }
}

impl<T> ConditionVisitor for Validator<'_, T> {
    type Output = Result<()>;

    fn visit_property(&mut self, property: &QProperty, op: CompareOp, operand: &QOperand) -> Result<()> {
        self.check_visible(property)?;
        let ty = self.field_type(property)?;
        match (op, operand) {
            (CompareOp::IsNull | CompareOp::IsNotNull, QOperand::None) => Ok(()),
            (CompareOp::IsNull | CompareOp::IsNotNull, _) | (_, QOperand::None) => Err(
                Error::InvalidQuery(format!("operator '{}' does not fit its operand", op.symbol())),
            ),
            (CompareOp::Like | CompareOp::NotLike, QOperand::Value(Value::String(_))) => {
                if ty == ScalarType::String {
                    Ok(())
                } else {
                    Err(Error::InvalidQuery(format!(
                        "'{}' applies to string properties, '{}' is {}",
                        op.symbol(),
                        property.name,
                        ty
                    )))
                }
            }
            (CompareOp::Like | CompareOp::NotLike, _) => Err(Error::InvalidQuery(format!(
                "'{}' needs a string pattern",
                op.symbol()
            ))),
            (CompareOp::In | CompareOp::NotIn, QOperand::Values(values)) => values
                .iter()
                .try_for_each(|v| self.check_value(property, ty, v)),
            (CompareOp::In | CompareOp::NotIn, _) | (_, QOperand::Values(_)) => Err(
                Error::InvalidQuery(format!("operator '{}' does not fit its operand", op.symbol())),
            ),
            (_, QOperand::Value(value)) => self.check_value(property, ty, value),
            (_, QOperand::Property(other)) => {
                self.check_visible(other)?;
                self.field_type(other).map(|_| ())
            }
        }
    }

    fn visit_logical(&mut self, _op: LogicalOp, left: &Condition, right: &Condition) -> Result<()> {
        left.accept(self)?;
        right.accept(self)
    }

    fn visit_exists(&mut self, query: QNode, _negated: bool) -> Result<()> {
        let (root, owner) = self.query.sub_query_root(query)?;
        if root != query {
            return Err(Error::InvalidQuery(format!(
                "node '{}' is not a sub-query root",
                self.query.alias(query)?
            )));
        }
        if !self.query.visible(self.node, owner)? {
            return Err(Error::InvalidQuery(format!(
                "sub-query '{}' is correlated with '{}', which is not in scope of '{}'",
                self.query.alias(query)?,
                self.query.alias(owner)?,
                self.query.alias(self.node)?
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::definitions;
    use crate::error::ErrorKind;

    fn users() -> QueryObject {
        QueryObject::new(definitions(), "app", "User").unwrap()
    }

    #[test]
    fn test_alias_sequence() {
        let aliases: Vec<String> = [0, 1, 25, 26, 27, 51, 52, 701, 702]
            .into_iter()
            .map(alias_for)
            .collect();
        assert_eq!(
            aliases,
            vec!["a", "b", "z", "aa", "ab", "az", "ba", "zz", "aaa"]
        );
    }

    #[test]
    fn test_aliases_are_deterministic() {
        let build = || {
            let mut q = users();
            let team = q.join(q.root(), "team").unwrap();
            q.join(team, "members").unwrap();
            let sub = q.exists(team, "members").unwrap();
            q.and_exists(team, sub).unwrap();
            q.aliases().into_iter().map(String::from).collect::<Vec<_>>()
        };
        assert_eq!(build(), vec!["a", "b", "c", "d"]);
        assert_eq!(build(), build());
    }

    #[test]
    fn test_join_resolves_relation() {
        let mut q = users();
        let team = q.join(q.root(), "team").unwrap();
        assert_eq!(q.entity_type(team).unwrap().name, "Team");
        let join = q.join_of(team).unwrap().unwrap();
        assert_eq!(join.from, q.root());
        assert!(matches!(join.kind, QJoinKind::Reference { nullable: true, .. }));

        let err = q.join(q.root(), "name").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryModel);
        let err = q.join(q.root(), "nope").unwrap_err();
        assert!(matches!(err, Error::UnknownProperty { .. }));
    }

    #[test]
    fn test_conditions_checked_at_build_time() {
        let mut q = users();
        let root = q.root();
        assert!(matches!(
            q.and(root, q.prop(root, "name").unwrap().eq(5i64)),
            Err(Error::TypeMismatch { .. })
        ));
        assert!(q.and(root, q.prop(root, "id").unwrap().like("1%")).is_err());
        let team = q.join(root, "team").unwrap();
        assert!(q.prop(team, "members").is_err());

        q.and(root, q.prop(root, "name").unwrap().eq("Ann")).unwrap();
        q.or(root, q.prop(root, "name").unwrap().is_null()).unwrap();
        assert!(matches!(
            q.condition(root).unwrap(),
            Some(Condition::Logical { op: LogicalOp::Or, .. })
        ));
    }

    #[test]
    fn test_sub_query_scope() {
        let mut q: QueryObject = QueryObject::new(definitions(), "app", "Team").unwrap();
        let root = q.root();
        let member = q.exists(root, "members").unwrap();

        // correlated reference into the enclosing query
        q.and(member, q.prop(member, "name").unwrap().eq_property(q.prop(root, "name").unwrap()))
            .unwrap();
        // the main query cannot see into the sub-query
        assert!(q.and(root, q.prop(member, "name").unwrap().eq("x")).is_err());

        q.and_not_exists(root, member).unwrap();
        assert!(q.is_sub_query(member).unwrap());
        assert_eq!(q.main_nodes().count(), 1);
        assert!(q.order_by(q.prop(member, "name").unwrap(), OrderDirection::Asc).is_err());
    }
}
