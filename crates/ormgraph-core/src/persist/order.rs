//! Foreign-key dependency ordering of inserts and deletes.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use super::analyser::ref_target;
use crate::context::EntityContext;
use crate::error::{Error, Result};
use crate::graph::EntityId;

/// `entity -> targets within the set`, for mandatory (and optionally all)
/// references.
fn edges(
    context: &EntityContext,
    set: &[EntityId],
    mandatory_only: bool,
) -> Result<BTreeMap<EntityId, BTreeSet<EntityId>>> {
    let members: HashSet<EntityId> = set.iter().copied().collect();
    let mut edges = BTreeMap::new();
    for &id in set {
        let entity = context.entity(id)?;
        let mut targets = BTreeSet::new();
        for (index, def) in entity.entity_type().reference_fields() {
            if mandatory_only && !def.is_mandatory_reference() {
                continue;
            }
            if let Some(target) = ref_target(context, entity, index)? {
                if members.contains(&target) {
                    targets.insert(target);
                }
            }
        }
        edges.insert(id, targets);
    }
    Ok(edges)
}

/// Kahn's algorithm: targets before the entities referencing them, ties by
/// handle. Returns the unsorted remainder when the edges contain a cycle.
fn sort(
    edges: &BTreeMap<EntityId, BTreeSet<EntityId>>,
) -> std::result::Result<Vec<EntityId>, BTreeSet<EntityId>> {
    let mut pending: BTreeMap<EntityId, usize> =
        edges.iter().map(|(id, targets)| (*id, targets.len())).collect();
    let mut referrers: BTreeMap<EntityId, Vec<EntityId>> = BTreeMap::new();
    for (id, targets) in edges {
        for target in targets {
            referrers.entry(*target).or_default().push(*id);
        }
    }

    let mut ready: BTreeSet<EntityId> = pending
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut order = Vec::with_capacity(edges.len());
    while let Some(id) = ready.pop_first() {
        order.push(id);
        pending.remove(&id);
        for referrer in referrers.get(&id).into_iter().flatten() {
            if let Some(n) = pending.get_mut(referrer) {
                *n -= 1;
                if *n == 0 {
                    ready.insert(*referrer);
                }
            }
        }
    }

    if pending.is_empty() {
        Ok(order)
    } else {
        Err(pending.into_keys().collect())
    }
}

/// Follow edges inside the unsorted remainder until an entity repeats.
fn cycle_error(
    context: &EntityContext,
    edges: &BTreeMap<EntityId, BTreeSet<EntityId>>,
    remainder: &BTreeSet<EntityId>,
) -> Error {
    let mut path: Vec<EntityId> = Vec::new();
    let mut current = remainder.first().copied();
    while let Some(id) = current {
        if let Some(start) = path.iter().position(|p| *p == id) {
            let mut cycle: Vec<EntityId> = path.split_off(start);
            cycle.push(id);
            return Error::DependencyCycle {
                entities: cycle.iter().map(|id| label(context, *id)).collect(),
            };
        }
        path.push(id);
        current = edges
            .get(&id)
            .and_then(|targets| targets.iter().find(|t| remainder.contains(t)))
            .copied();
    }
    Error::DependencyCycle {
        entities: remainder.iter().map(|id| label(context, *id)).collect(),
    }
}

fn label(context: &EntityContext, id: EntityId) -> String {
    context
        .entity(id)
        .map(|e| e.label())
        .unwrap_or_else(|_| id.to_string())
}

/// Insert order: referenced entities first.
///
/// Optional references are honoured when they can be; when they close a
/// cycle the order falls back to mandatory references only and the caller
/// defers the optional foreign keys. A cycle of mandatory references fails
/// before any statement is issued.
pub(crate) fn insert_order(context: &EntityContext, inserts: &[EntityId]) -> Result<Vec<EntityId>> {
    if let Ok(order) = sort(&edges(context, inserts, false)?) {
        return Ok(order);
    }
    let mandatory = edges(context, inserts, true)?;
    sort(&mandatory).map_err(|remainder| cycle_error(context, &mandatory, &remainder))
}

/// Delete order: referencing entities first.
///
/// As with inserts, optional references that close a cycle are dropped from
/// the ordering; the caller clears those foreign keys before the deletes.
pub(crate) fn delete_order(context: &EntityContext, deletes: &[EntityId]) -> Result<Vec<EntityId>> {
    let all = edges(context, deletes, false)?;
    let order = match sort(&all) {
        Ok(order) => order,
        Err(_) => {
            let mandatory = edges(context, deletes, true)?;
            sort(&mandatory).map_err(|remainder| cycle_error(context, &mandatory, &remainder))?
        }
    };
    Ok(order.into_iter().rev().collect())
}
