//! Field slots of an entity.
//!
//! Every entity carries one [`Node`] per field of its type. Nodes track the
//! value that was in place before the first uncommitted change so that a
//! persist can audit net effects, and so that setting a field back to that
//! value cancels the pending change instead of recording a new one.

use ormgraph_proto::Value;

use super::entity::EntityId;

/// A field slot, tagged by node kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// Scalar column.
    Value(ValueNode),
    /// Many-to-one reference.
    Ref(RefNode),
    /// One-to-many or many-to-many collection.
    ToMany(ToManyNode),
}

impl Node {
    /// Node kind name, matching [`FieldDef::kind_name`](crate::catalog::FieldDef::kind_name).
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Value(_) => "value",
            Node::Ref(_) => "reference",
            Node::ToMany(_) => "to-many",
        }
    }

    /// Whether the node holds an uncommitted change.
    pub fn is_dirty(&self) -> bool {
        match self {
            Node::Value(v) => v.is_dirty(),
            Node::Ref(r) => r.is_dirty(),
            Node::ToMany(_) => false,
        }
    }

    /// Accept the current state as the committed one.
    pub fn commit(&mut self) {
        match self {
            Node::Value(v) => v.commit(),
            Node::Ref(r) => r.commit(),
            Node::ToMany(_) => {}
        }
    }

    /// Borrow as a value node.
    pub fn as_value(&self) -> Option<&ValueNode> {
        match self {
            Node::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Mutably borrow as a value node.
    pub fn as_value_mut(&mut self) -> Option<&mut ValueNode> {
        match self {
            Node::Value(v) => Some(v),
            _ => None,
        }
    }

    /// Borrow as a reference node.
    pub fn as_ref_node(&self) -> Option<&RefNode> {
        match self {
            Node::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Mutably borrow as a reference node.
    pub fn as_ref_node_mut(&mut self) -> Option<&mut RefNode> {
        match self {
            Node::Ref(r) => Some(r),
            _ => None,
        }
    }

    /// Borrow as a collection node.
    pub fn as_to_many(&self) -> Option<&ToManyNode> {
        match self {
            Node::ToMany(c) => Some(c),
            _ => None,
        }
    }

    /// Mutably borrow as a collection node.
    pub fn as_to_many_mut(&mut self) -> Option<&mut ToManyNode> {
        match self {
            Node::ToMany(c) => Some(c),
            _ => None,
        }
    }
}

/// Scalar slot.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueNode {
    value: Value,
    original: Option<Value>,
}

impl ValueNode {
    /// Create a clean node holding `value`.
    pub fn new(value: Value) -> Self {
        Self {
            value,
            original: None,
        }
    }

    /// Current value.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Value before the pending change, if any.
    pub fn original(&self) -> Option<&Value> {
        self.original.as_ref()
    }

    /// Value as last committed or loaded.
    pub fn committed(&self) -> &Value {
        self.original.as_ref().unwrap_or(&self.value)
    }

    /// Whether a change is pending.
    pub fn is_dirty(&self) -> bool {
        self.original.is_some()
    }

    /// Set a new value under change tracking. Returns whether the value
    /// changed.
    pub fn set(&mut self, value: Value) -> bool {
        if value == self.value {
            return false;
        }
        match &self.original {
            None => self.original = Some(std::mem::replace(&mut self.value, value)),
            Some(original) if *original == value => {
                self.value = value;
                self.original = None;
            }
            Some(_) => self.value = value,
        }
        true
    }

    /// Overwrite without change tracking (loads and engine-maintained fields).
    pub fn load(&mut self, value: Value) {
        self.value = value;
        self.original = None;
    }

    /// Drop the pending-change marker.
    pub fn commit(&mut self) {
        self.original = None;
    }
}

/// Target of a reference at one point in time.
#[derive(Debug, Clone, Default)]
pub struct RefState {
    /// Foreign-key value, when the target has a key.
    pub key: Option<Value>,
    /// Target entity, when known.
    pub target: Option<EntityId>,
}

impl RefState {
    /// The null reference.
    pub fn null() -> Self {
        Self::default()
    }

    /// Whether this is the null reference.
    pub fn is_null(&self) -> bool {
        self.key.is_none() && self.target.is_none()
    }
}

/// Keys identify targets when both sides have one; keyless (new) targets are
/// compared by handle.
impl PartialEq for RefState {
    fn eq(&self, other: &Self) -> bool {
        match (&self.key, &other.key) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.target == other.target,
            _ => false,
        }
    }
}

/// Many-to-one slot.
///
/// `entity_key` is the foreign-key value; `reference` is the target resolved
/// from that key (filled lazily). `updated_reference` holds a target set by
/// the caller that has no key yet; it is folded into `entity_key` once the
/// target is assigned one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RefNode {
    entity_key: Option<Value>,
    reference: Option<EntityId>,
    updated_reference: Option<EntityId>,
    removed: Option<RefState>,
}

impl RefNode {
    /// Create a null reference.
    pub fn new() -> Self {
        Self::default()
    }

    /// Foreign-key value.
    pub fn entity_key(&self) -> Option<&Value> {
        self.entity_key.as_ref()
    }

    /// Target resolved from the key.
    pub fn reference(&self) -> Option<EntityId> {
        self.reference
    }

    /// Keyless target set by the caller.
    pub fn updated_reference(&self) -> Option<EntityId> {
        self.updated_reference
    }

    /// Known target, preferring an explicitly set one.
    pub fn target(&self) -> Option<EntityId> {
        self.updated_reference.or(self.reference)
    }

    /// Whether the reference is null.
    pub fn is_null(&self) -> bool {
        self.entity_key.is_none() && self.updated_reference.is_none() && self.reference.is_none()
    }

    /// Current state.
    pub fn state(&self) -> RefState {
        RefState {
            key: self.entity_key.clone(),
            target: self.target(),
        }
    }

    /// State before the pending change, if any.
    pub fn removed(&self) -> Option<&RefState> {
        self.removed.as_ref()
    }

    /// State as last committed or loaded.
    pub fn committed(&self) -> RefState {
        self.removed.clone().unwrap_or_else(|| self.state())
    }

    /// Whether a change is pending.
    pub fn is_dirty(&self) -> bool {
        self.removed.is_some()
    }

    /// Point the reference at a new state under change tracking.
    ///
    /// Setting the current state again is a no-op; setting the state that
    /// was in place before the pending change cancels it. Returns whether
    /// the reference changed.
    pub fn apply(&mut self, new: RefState) -> bool {
        if self.state() == new {
            if new.key.is_some() && self.reference.is_none() {
                self.reference = new.target;
            }
            return false;
        }
        match &self.removed {
            None => self.removed = Some(self.state()),
            Some(previous) if *previous == new => self.removed = None,
            Some(_) => {}
        }
        self.write(new);
        true
    }

    /// Overwrite without change tracking.
    pub fn load(&mut self, key: Option<Value>, target: Option<EntityId>) {
        self.write(RefState { key, target });
        self.removed = None;
    }

    fn write(&mut self, state: RefState) {
        match state.key {
            Some(key) => {
                self.entity_key = Some(key);
                self.reference = state.target;
                self.updated_reference = None;
            }
            None => {
                self.entity_key = None;
                self.reference = None;
                self.updated_reference = state.target;
            }
        }
    }

    /// Record the resolved target of the current key.
    pub(crate) fn resolve(&mut self, target: EntityId) {
        if self.entity_key.is_some() {
            self.reference = Some(target);
        }
    }

    /// Forget the resolved target but keep the key, so the next access
    /// resolves it again.
    pub(crate) fn unresolve(&mut self, target: EntityId) {
        if self.reference == Some(target) {
            self.reference = None;
        }
        if self.updated_reference == Some(target) {
            self.updated_reference = None;
        }
    }

    /// A keyless target has been assigned its key.
    pub(crate) fn key_assigned(&mut self, target: EntityId, key: &Value) {
        if self.updated_reference == Some(target) {
            self.entity_key = Some(key.clone());
            self.reference = Some(target);
            self.updated_reference = None;
        }
        if let Some(removed) = &mut self.removed {
            if removed.key.is_none() && removed.target == Some(target) {
                removed.key = Some(key.clone());
            }
        }
    }

    /// Drop the pending-change marker.
    pub fn commit(&mut self) {
        self.removed = None;
    }
}

/// Collection slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToManyNode {
    children: Vec<EntityId>,
    fetched: bool,
    join_property: Option<String>,
}

impl ToManyNode {
    /// Create an empty, unfetched collection.
    pub fn new(join_property: Option<String>) -> Self {
        Self {
            children: Vec::new(),
            fetched: false,
            join_property,
        }
    }

    /// Direct children (join entities for join-table relations).
    pub fn children(&self) -> &[EntityId] {
        &self.children
    }

    /// Whether the collection has been loaded completely.
    pub fn is_fetched(&self) -> bool {
        self.fetched
    }

    /// Reference on the join entity leading to the final target.
    pub fn join_property(&self) -> Option<&str> {
        self.join_property.as_deref()
    }

    /// Whether `child` is in the collection.
    pub fn contains(&self, child: EntityId) -> bool {
        self.children.contains(&child)
    }

    pub(crate) fn insert(&mut self, child: EntityId) -> bool {
        if self.contains(child) {
            return false;
        }
        self.children.push(child);
        true
    }

    pub(crate) fn remove(&mut self, child: EntityId) -> bool {
        let before = self.children.len();
        self.children.retain(|c| *c != child);
        before != self.children.len()
    }

    pub(crate) fn set_fetched(&mut self, fetched: bool) {
        self.fetched = fetched;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_set_and_revert() {
        let mut node = ValueNode::new(Value::from("Ann"));
        assert!(!node.set(Value::from("Ann")));
        assert!(!node.is_dirty());

        assert!(node.set(Value::from("Bob")));
        assert!(node.set(Value::from("Cid")));
        assert_eq!(node.original(), Some(&Value::from("Ann")));

        assert!(node.set(Value::from("Ann")));
        assert!(!node.is_dirty());
    }

    #[test]
    fn test_ref_same_key_is_noop() {
        let mut node = RefNode::new();
        node.load(Some(Value::Int64(1)), Some(EntityId(1)));

        let same = RefState {
            key: Some(Value::Int64(1)),
            target: Some(EntityId(1)),
        };
        assert!(!node.apply(same));
        assert!(!node.is_dirty());
    }

    #[test]
    fn test_ref_revert_cancels_change() {
        let mut node = RefNode::new();
        node.load(Some(Value::Int64(1)), Some(EntityId(1)));

        assert!(node.apply(RefState {
            key: Some(Value::Int64(2)),
            target: Some(EntityId(2)),
        }));
        assert!(node.is_dirty());

        // through a keyless target and back
        assert!(node.apply(RefState {
            key: None,
            target: Some(EntityId(3)),
        }));
        assert_eq!(node.updated_reference(), Some(EntityId(3)));
        assert!(node.entity_key().is_none());

        assert!(node.apply(RefState {
            key: Some(Value::Int64(1)),
            target: Some(EntityId(1)),
        }));
        assert!(!node.is_dirty());
        assert_eq!(node.reference(), Some(EntityId(1)));
    }

    #[test]
    fn test_ref_key_assigned_later() {
        let mut node = RefNode::new();
        node.apply(RefState {
            key: None,
            target: Some(EntityId(7)),
        });
        node.key_assigned(EntityId(7), &Value::Int64(70));

        assert_eq!(node.entity_key(), Some(&Value::Int64(70)));
        assert_eq!(node.reference(), Some(EntityId(7)));
        assert!(node.updated_reference().is_none());
        // original null state still pending
        assert!(node.removed().is_some_and(RefState::is_null));
    }

    #[test]
    fn test_to_many_membership() {
        let mut node = ToManyNode::new(None);
        assert!(node.insert(EntityId(1)));
        assert!(!node.insert(EntityId(1)));
        assert!(node.remove(EntityId(1)));
        assert!(node.children().is_empty());
    }
}
