//! Running query trees against a backend and merging rows into a context.

use std::any::Any;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use ormgraph_proto::{LockMode, ResultSet, Value};
use tracing::{debug, info};

use super::object::{QJoinKind, QNode, QueryObject};
use super::plan::{from_storage, render, RenderedQuery};
use crate::backend::Backend;
use crate::catalog::FieldKind;
use crate::context::EntityContext;
use crate::error::{Error, Result};
use crate::graph::{EntityId, EntityState};

/// Proxies of the root entities a query returned, in row order without
/// duplicates.
pub struct QueryResult<T> {
    entries: Vec<(EntityId, Arc<T>)>,
}

impl<T> QueryResult<T> {
    /// Entity handles.
    pub fn ids(&self) -> Vec<EntityId> {
        self.entries.iter().map(|(id, _)| *id).collect()
    }

    /// Proxies.
    pub fn proxies(&self) -> Vec<Arc<T>> {
        self.entries.iter().map(|(_, p)| Arc::clone(p)).collect()
    }

    /// Number of root entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the query matched nothing.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First root entity.
    pub fn first(&self) -> Option<&Arc<T>> {
        self.entries.first().map(|(_, p)| p)
    }

    /// Iterate `(handle, proxy)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (EntityId, &Arc<T>)> {
        self.entries.iter().map(|(id, p)| (*id, p))
    }
}

impl<T> std::fmt::Debug for QueryResult<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryResult").field("ids", &self.ids()).finish()
    }
}

/// Executes query trees on one backend connection.
pub struct QueryExecutor<'b> {
    backend: &'b mut dyn Backend,
}

impl<'b> QueryExecutor<'b> {
    /// Executor over a borrowed connection.
    pub fn new(backend: &'b mut dyn Backend) -> Self {
        Self { backend }
    }

    pub(crate) fn backend(&mut self) -> &mut dyn Backend {
        &mut *self.backend
    }

    /// Render a query with the context's settings, checking the requested
    /// row locking against the backend.
    pub fn plan<T>(&self, context: &EntityContext, query: &QueryObject<T>) -> Result<RenderedQuery> {
        let caps = self.backend.capabilities();
        match query.lock() {
            LockMode::ForUpdate if !caps.supports_select_for_update => {
                return Err(Error::Unsupported("select for update".into()))
            }
            LockMode::ForUpdateWait(_) if !caps.supports_select_for_update_wait_n => {
                return Err(Error::Unsupported("select for update wait".into()))
            }
            _ => {}
        }
        render(query, context.config().fetch_filtered_collections)
    }

    /// Run a query and return proxies for its root entities.
    ///
    /// Rows of every fetch-joined node are merged into the context; entities
    /// already loaded keep their state and pending changes.
    pub fn execute<T: Any + Send + Sync>(
        &mut self,
        context: &mut EntityContext,
        query: &QueryObject<T>,
    ) -> Result<QueryResult<T>> {
        let rendered = self.plan(context, query)?;
        let rows = self.backend.select(rendered.plan())?;
        let ids = merge(context, &rendered, &rows)?;
        info!(
            entity_type = %query.entity_type(query.root())?.name,
            rows = rows.len(),
            roots = ids.len(),
            "Query executed"
        );
        issue(context, ids)
    }

    /// Load a stub from its row.
    ///
    /// Entities that are not stubs are returned untouched. A missing row
    /// leaves the stub NOT_LOADED and fails with `MissingRow`.
    pub fn fetch(&mut self, context: &mut EntityContext, id: EntityId) -> Result<EntityId> {
        let entity = context.entity(id)?;
        if entity.state() != EntityState::NotLoaded {
            return Ok(id);
        }
        let entity_type = Arc::clone(entity.entity_type());
        let key = entity.key().cloned().ok_or_else(|| Error::InvalidState {
            entity_type: entity_type.name.clone(),
            state: EntityState::NotLoaded,
            operation: "fetch",
        })?;

        let mut query: QueryObject =
            QueryObject::for_type(Arc::clone(context.definitions()), Arc::clone(&entity_type));
        let root = query.root();
        query.and(root, query.prop(root, &entity_type.primary_key)?.eq(key.clone()))?;
        let rendered = self.plan(context, &query)?;

        context.begin_loading(id)?;
        let rows = match self.backend.select(rendered.plan()) {
            Ok(rows) => rows,
            Err(err) => {
                context.abort_loading(id);
                return Err(err.into());
            }
        };
        if let Err(err) = merge(context, &rendered, &rows) {
            context.abort_loading(id);
            return Err(err);
        }
        if context.entity(id)?.state() != EntityState::Loaded {
            context.abort_loading(id);
            return Err(Error::MissingRow {
                entity_type: entity_type.name.clone(),
                key,
            });
        }
        debug!(entity = %id, entity_type = %entity_type.name, "Stub fetched");
        Ok(id)
    }

    /// Load a to-many collection completely and mark it fetched.
    ///
    /// Join-table relations load the join rows together with their targets.
    /// Returns the collection's direct members.
    pub fn fetch_children(
        &mut self,
        context: &mut EntityContext,
        owner: EntityId,
        field: &str,
    ) -> Result<Vec<EntityId>> {
        let owner_entity = context.entity(owner)?;
        let owner_type = Arc::clone(owner_entity.entity_type());
        let owner_key = owner_entity.key().cloned();
        let index = owner_type
            .field_index(field)
            .ok_or_else(|| Error::UnknownField {
                entity_type: owner_type.name.clone(),
                field: field.to_string(),
            })?;
        let FieldKind::ToMany {
            target,
            mapped_by,
            join_property,
            ..
        } = &owner_type.fields[index].kind
        else {
            return Err(Error::InvalidNodeType {
                entity_type: owner_type.name.clone(),
                property: field.to_string(),
                expected: "to-many",
            });
        };

        if let Some(key) = owner_key {
            let child_type = context.definitions().resolve(&owner_type, target)?;
            let mut query: QueryObject =
                QueryObject::for_type(Arc::clone(context.definitions()), child_type);
            let root = query.root();
            query.and(root, query.prop(root, mapped_by)?.eq(key))?;
            if let Some(hop) = join_property {
                query.join(root, hop)?;
            }
            let rendered = self.plan(context, &query)?;
            let rows = self.backend.select(rendered.plan())?;
            merge(context, &rendered, &rows)?;
        }
        context.set_fetched(owner, index)?;
        let children = context.children(owner, field)?;
        debug!(owner = %owner, field, children = children.len(), "Collection fetched");
        Ok(children)
    }
}

/// Merge a result set into the context. Returns the root entities in row
/// order, without duplicates.
pub(crate) fn merge(
    context: &mut EntityContext,
    rendered: &RenderedQuery,
    rows: &ResultSet,
) -> Result<Vec<EntityId>> {
    let definitions = Arc::clone(context.definitions());
    let mut roots = Vec::new();
    let mut seen = HashSet::new();
    let mut complete: BTreeSet<(EntityId, usize)> = BTreeSet::new();

    for row in &rows.rows {
        let mut merged: HashMap<QNode, EntityId> = HashMap::new();
        for fetched in &rendered.fetched {
            let parent = fetched
                .join
                .as_ref()
                .and_then(|join| merged.get(&join.from).map(|p| (*p, join.kind)));
            if fetched.completes_collection {
                if let Some((parent, QJoinKind::Collection { field, .. })) = parent {
                    complete.insert((parent, field));
                }
            }
            let key = row.get(fetched.key_position).cloned().unwrap_or(Value::Null);
            if key.is_null() {
                continue;
            }
            let mut values = Vec::with_capacity(fetched.columns.len());
            for (field, position) in &fetched.columns {
                let def = &fetched.entity_type.fields[*field];
                let stored = row.get(*position).cloned().unwrap_or(Value::Null);
                values.push((*field, from_storage(&definitions, def, stored)?));
            }
            let id = context.merge_loaded(&fetched.entity_type, values)?;
            merged.insert(fetched.node, id);
            if fetched.join.is_none() && seen.insert(id) {
                roots.push(id);
            }
        }
    }
    for (owner, field) in complete {
        context.set_fetched(owner, field)?;
    }
    Ok(roots)
}

pub(crate) fn issue<T: Any + Send + Sync>(
    context: &mut EntityContext,
    ids: Vec<EntityId>,
) -> Result<QueryResult<T>> {
    let entries = ids
        .into_iter()
        .map(|id| context.proxy::<T>(id).map(|p| (id, p)))
        .collect::<Result<Vec<_>>>()?;
    Ok(QueryResult { entries })
}
