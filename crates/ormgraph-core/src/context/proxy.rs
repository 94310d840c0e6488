//! Proxy issuance, pinning and eviction.

use std::any::Any;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Weak};

use ormgraph_proto::Value;
use tracing::{debug, trace};

use super::EntityContext;
use crate::error::{Error, Result};
use crate::graph::{Entity, EntityId, EntityState, Node};

type AnyProxy = Arc<dyn Any + Send + Sync>;

/// Cache slot of an issued proxy. Strong while the context pins its live
/// set, weak while garbage collection is allowed.
pub(crate) enum ProxySlot {
    Strong(AnyProxy),
    Weak(Weak<dyn Any + Send + Sync>),
}

impl ProxySlot {
    fn get(&self) -> Option<AnyProxy> {
        match self {
            ProxySlot::Strong(p) => Some(Arc::clone(p)),
            ProxySlot::Weak(w) => w.upgrade(),
        }
    }

    fn is_alive(&self) -> bool {
        match self {
            ProxySlot::Strong(_) => true,
            ProxySlot::Weak(w) => w.strong_count() > 0,
        }
    }
}

/// Produces typed façades for entities.
///
/// Factories are consulted in registration order; the first one returning
/// `Some` wins. When none does, a [`GenericProxy`] is issued.
pub trait ProxyFactory: Send + Sync {
    /// Build a proxy for `entity`, or decline with `None`.
    fn create(&self, context: &EntityContext, entity: &Entity) -> Option<AnyProxy>;
}

/// A field read through a proxy.
#[derive(Debug, Clone, PartialEq)]
pub enum Property {
    /// Scalar value.
    Value(Value),
    /// Reference target.
    Reference(Option<EntityId>),
    /// Collection targets.
    Collection(Vec<EntityId>),
}

impl Property {
    /// Scalar value, if this is one.
    pub fn into_value(self) -> Option<Value> {
        match self {
            Property::Value(v) => Some(v),
            _ => None,
        }
    }
}

/// Untyped proxy: field access by name, dispatched on the node kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenericProxy {
    id: EntityId,
}

impl GenericProxy {
    /// Proxy for an entity handle.
    pub fn new(id: EntityId) -> Self {
        Self { id }
    }

    /// Entity handle.
    pub fn id(&self) -> EntityId {
        self.id
    }

    /// Read a field.
    pub fn get(&self, context: &mut EntityContext, field: &str) -> Result<Property> {
        let node = context.entity(self.id)?.node(field)?.clone();
        match node {
            Node::Value(_) => context.value(self.id, field).map(Property::Value),
            Node::Ref(_) => context.reference(self.id, field).map(Property::Reference),
            Node::ToMany(_) => context.targets(self.id, field).map(Property::Collection),
        }
    }

    /// Write a scalar field or a reference.
    pub fn set(&self, context: &mut EntityContext, field: &str, property: Property) -> Result<bool> {
        match property {
            Property::Value(v) => context.set_value(self.id, field, v),
            Property::Reference(target) => context.set_reference(self.id, field, target),
            Property::Collection(_) => Err(Error::InvalidNodeType {
                entity_type: context.entity(self.id)?.entity_type().name.clone(),
                property: field.to_string(),
                expected: "value or reference",
            }),
        }
    }
}

impl EntityContext {
    /// Register a proxy factory at the end of the chain.
    pub fn register_factory(&mut self, factory: Arc<dyn ProxyFactory>) {
        self.factories.push(factory);
    }

    /// Cached or newly issued proxy of type `T` for an entity.
    pub fn proxy<T: Any + Send + Sync>(&mut self, id: EntityId) -> Result<Arc<T>> {
        let entity_type = self.entity(id)?.entity_type().name.clone();
        let proxy = match self.proxies.get(&id).and_then(ProxySlot::get) {
            Some(proxy) => proxy,
            None => {
                let proxy = self.issue(id)?;
                let slot = if self.config.allow_garbage_collection {
                    ProxySlot::Weak(Arc::downgrade(&proxy))
                } else {
                    ProxySlot::Strong(Arc::clone(&proxy))
                };
                self.proxies.insert(id, slot);
                proxy
            }
        };
        proxy.downcast::<T>().map_err(|_| Error::ProxyType {
            entity_type,
            requested: std::any::type_name::<T>(),
        })
    }

    fn issue(&self, id: EntityId) -> Result<AnyProxy> {
        let entity = self.entity(id)?;
        for factory in &self.factories {
            if let Some(proxy) = factory.create(self, entity) {
                return Ok(proxy);
            }
        }
        Ok(Arc::new(GenericProxy::new(id)))
    }

    /// Whether unreferenced entities may be evicted by [`sweep`](Self::sweep).
    pub fn allows_garbage_collection(&self) -> bool {
        self.config.allow_garbage_collection
    }

    /// Switch the collection policy.
    ///
    /// Allowing collection downgrades the context's proxy handles so they
    /// live only as long as caller code holds them; forbidding it pins the
    /// proxies still alive.
    pub fn set_allow_garbage_collection(&mut self, allow: bool) {
        if self.config.allow_garbage_collection == allow {
            return;
        }
        self.config.allow_garbage_collection = allow;
        let slots = std::mem::take(&mut self.proxies);
        self.proxies = slots
            .into_iter()
            .filter_map(|(id, slot)| {
                let slot = match (slot, allow) {
                    (ProxySlot::Strong(p), true) => ProxySlot::Weak(Arc::downgrade(&p)),
                    (ProxySlot::Weak(w), false) => ProxySlot::Strong(w.upgrade()?),
                    (slot, _) => slot,
                };
                Some((id, slot))
            })
            .collect();
        debug!(allow, proxies = self.proxies.len(), "Garbage collection policy changed");
    }

    /// Pin an entity so it survives sweeps.
    pub fn retain(&mut self, id: EntityId) -> Result<()> {
        self.entity(id)?;
        *self.pins.entry(id).or_insert(0) += 1;
        Ok(())
    }

    /// Drop one pin.
    pub fn release(&mut self, id: EntityId) {
        if let Some(count) = self.pins.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                self.pins.remove(&id);
            }
        }
    }

    /// Whether an entity is pinned.
    pub fn is_retained(&self, id: EntityId) -> bool {
        self.pins.contains_key(&id)
    }

    fn is_root(&self, entity: &Entity) -> bool {
        let id = entity.id();
        self.pins.contains_key(&id)
            || self.proxies.get(&id).is_some_and(ProxySlot::is_alive)
            || entity.is_dirty()
            || entity.is_marked_for_removal()
            || matches!(entity.state(), EntityState::New | EntityState::Loading)
    }

    /// Evict entities unreachable from any root.
    ///
    /// Roots are pinned entities, entities with a live proxy, and entities
    /// with pending work (new, dirty, marked, loading). Reachability follows
    /// references and collections. Does nothing while collection is
    /// forbidden. Returns the number of evicted entities.
    pub fn sweep(&mut self) -> usize {
        if !self.config.allow_garbage_collection {
            return 0;
        }
        self.proxies.retain(|_, slot| slot.is_alive());

        let mut marked = BTreeSet::new();
        let mut queue: VecDeque<EntityId> = self
            .entities
            .values()
            .filter(|e| e.state() != EntityState::Deleted && self.is_root(e))
            .map(Entity::id)
            .collect();
        while let Some(id) = queue.pop_front() {
            if !marked.insert(id) {
                continue;
            }
            let Some(entity) = self.entities.get(&id) else {
                continue;
            };
            for node in entity.nodes() {
                match node {
                    Node::Ref(r) => queue.extend(r.target()),
                    Node::ToMany(c) => queue.extend(c.children().iter().copied()),
                    Node::Value(_) => {}
                }
            }
        }

        let garbage: Vec<EntityId> = self
            .entities
            .keys()
            .filter(|id| !marked.contains(id))
            .copied()
            .collect();
        for id in &garbage {
            if self.remove(*id).is_ok() {
                trace!(entity = %id, "Entity evicted");
            }
        }
        if !garbage.is_empty() {
            debug!(evicted = garbage.len(), remaining = self.entities.len(), "Sweep completed");
        }
        garbage.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::context;

    struct Named(String);

    struct TeamFactory;

    impl ProxyFactory for TeamFactory {
        fn create(&self, _context: &EntityContext, entity: &Entity) -> Option<AnyProxy> {
            (entity.entity_type().name == "Team").then(|| Arc::new(Named("team".into())) as AnyProxy)
        }
    }

    #[test]
    fn test_proxy_cached_and_typed() {
        let mut ctx = context();
        ctx.register_factory(Arc::new(TeamFactory));
        let team = ctx.definitions().lookup("app", "Team").unwrap();
        let user = ctx.definitions().lookup("app", "User").unwrap();
        let t = ctx.create(&team).unwrap();
        let u = ctx.create(&user).unwrap();

        let named = ctx.proxy::<Named>(t).unwrap();
        assert_eq!(named.0, "team");
        assert!(Arc::ptr_eq(&named, &ctx.proxy::<Named>(t).unwrap()));

        let generic = ctx.proxy::<GenericProxy>(u).unwrap();
        assert_eq!(generic.id(), u);
        assert!(matches!(
            ctx.proxy::<GenericProxy>(t),
            Err(Error::ProxyType { .. })
        ));
    }

    #[test]
    fn test_generic_proxy_dispatch() {
        let mut ctx = context();
        let user = ctx.definitions().lookup("app", "User").unwrap();
        let team = ctx.definitions().lookup("app", "Team").unwrap();
        let u = ctx.create(&user).unwrap();
        let t = ctx.create(&team).unwrap();
        let proxy = ctx.proxy::<GenericProxy>(u).unwrap();

        proxy.set(&mut ctx, "name", Property::Value("Ann".into())).unwrap();
        proxy.set(&mut ctx, "team", Property::Reference(Some(t))).unwrap();

        assert_eq!(
            proxy.get(&mut ctx, "name").unwrap(),
            Property::Value(Value::from("Ann"))
        );
        assert_eq!(proxy.get(&mut ctx, "team").unwrap(), Property::Reference(Some(t)));
        assert_eq!(
            GenericProxy::new(t).get(&mut ctx, "members").unwrap(),
            Property::Collection(vec![u])
        );
    }

    #[test]
    fn test_sweep_respects_policy_and_pins() {
        let mut ctx = context();
        let user = ctx.definitions().lookup("app", "User").unwrap();
        let a = ctx.merge_loaded(&user, vec![(0, Value::Int64(1))]).unwrap();
        let b = ctx.merge_loaded(&user, vec![(0, Value::Int64(2))]).unwrap();
        let c = ctx.merge_loaded(&user, vec![(0, Value::Int64(3))]).unwrap();

        assert_eq!(ctx.sweep(), 0);

        let held = ctx.proxy::<GenericProxy>(a).unwrap();
        ctx.retain(b).unwrap();
        ctx.set_allow_garbage_collection(true);

        assert_eq!(ctx.sweep(), 1);
        assert!(ctx.entity(c).is_err());
        assert!(ctx.entity(a).is_ok());

        drop(held);
        ctx.release(b);
        assert_eq!(ctx.sweep(), 2);
        assert!(ctx.is_empty());
    }

    #[test]
    fn test_repinning_keeps_live_proxies() {
        let mut ctx = context();
        ctx.set_allow_garbage_collection(true);
        let user = ctx.definitions().lookup("app", "User").unwrap();
        let a = ctx.merge_loaded(&user, vec![(0, Value::Int64(1))]).unwrap();

        let held = ctx.proxy::<GenericProxy>(a).unwrap();
        ctx.set_allow_garbage_collection(false);
        drop(held);
        ctx.set_allow_garbage_collection(true);

        // pinned while held, unreferenced once released
        assert_eq!(ctx.sweep(), 1);
    }
}
