//! Writing a context's pending changes to a backend.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use ormgraph_proto::{
    BackendError, BatchResult, ColumnRef, ColumnValue, CompareOp, Operand, Predicate,
    SelectPlan, Statement, StatementStatus, TableRef, Value,
};
use tracing::{debug, info, warn};

use super::analyser::{analyse, committed_key, ref_target, WorkSet};
use super::audit::{AuditAction, AuditInformation, Change};
use super::order::{delete_order, insert_order};
use super::sequence::SequenceSource;
use crate::backend::Backend;
use crate::catalog::{Definitions, EntityType, LockKind, ScalarType};
use crate::context::EntityContext;
use crate::error::{Error, LockConflict, Result};
use crate::graph::{Entity, EntityId, EntitySnapshot, EntityState, Node};
use crate::query::{column_name, from_storage, to_storage};

/// What a successful persist wrote.
#[derive(Debug, Default)]
pub struct PersistOutcome {
    /// Field-level changes, one record per written entity.
    pub audit: AuditInformation,
    /// Inserted entities, in insert order.
    pub inserted: Vec<EntityId>,
    /// Updated entities.
    pub updated: Vec<EntityId>,
    /// Deleted entities, in delete order.
    pub deleted: Vec<EntityId>,
    /// Statements issued, fix-up updates included.
    pub statements: usize,
}

impl PersistOutcome {
    /// Whether the persist had nothing to write.
    pub fn is_empty(&self) -> bool {
        self.statements == 0
    }
}

struct Planned {
    statement: Statement,
    entity: EntityId,
    entity_type: Arc<EntityType>,
    guarded: bool,
}

/// Statements and the context changes to apply once they commit.
#[derive(Default)]
struct Plan {
    statements: Vec<Planned>,
    keys: HashMap<EntityId, Value>,
    locks: HashMap<EntityId, Value>,
    audit: AuditInformation,
    inserts: Vec<EntityId>,
    deletes: Vec<EntityId>,
}

enum Run {
    Done,
    /// A batch failed without naming the failing statement.
    Unattributed(BackendError),
}

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_micros()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Lock value following `current`; a null lock yields the initial value.
fn next_lock(kind: LockKind, value_type: Option<ScalarType>, current: &Value, now: i64) -> Value {
    match kind {
        LockKind::Counter => match value_type {
            Some(ScalarType::Int32) => {
                Value::Int32(current.as_i64().map_or(1, |n| (n as i32).wrapping_add(1)))
            }
            _ => Value::Int64(current.as_i64().map_or(1, |n| n.wrapping_add(1))),
        },
        LockKind::Timestamp => {
            let previous = current.as_timestamp().or_else(|| current.as_i64());
            let next = previous.map_or(now, |p| now.max(p.saturating_add(1)));
            match value_type {
                Some(ScalarType::Int64) => Value::Int64(next),
                _ => Value::Timestamp(next),
            }
        }
    }
}

fn key_column(definitions: &Definitions, entity_type: &EntityType, key: &Value) -> Result<ColumnValue> {
    let stored = match entity_type.primary_key_field() {
        Some(def) => to_storage(definitions, def, key.clone())?,
        None => key.clone(),
    };
    Ok(ColumnValue::new(entity_type.primary_key_column(), stored))
}

fn stored_key(entity: &Entity, operation: &'static str) -> Result<Value> {
    entity.key().cloned().ok_or_else(|| Error::InvalidState {
        entity_type: entity.entity_type().name.clone(),
        state: entity.state(),
        operation,
    })
}

impl Plan {
    /// Foreign-key value a reference node writes: its key, or the key
    /// planned for a target inserted in this persist.
    fn ref_key(&self, context: &EntityContext, entity: &Entity, index: usize) -> Result<Value> {
        let Some(node) = entity.nodes().get(index).and_then(Node::as_ref_node) else {
            return Ok(Value::Null);
        };
        if let Some(key) = node.entity_key() {
            return Ok(key.clone());
        }
        let Some(target) = node.target() else {
            return Ok(Value::Null);
        };
        if let Some(key) = self.keys.get(&target) {
            return Ok(key.clone());
        }
        let target = context.entity(target)?;
        stored_key(target, "reference unsaved")
    }

    /// Optimistic-lock guard and bumped value of an existing row.
    fn lock_guard(
        &mut self,
        context: &EntityContext,
        entity: &Entity,
        now: i64,
    ) -> Result<Option<(ColumnValue, ColumnValue)>> {
        let entity_type = entity.entity_type();
        let Some(index) = entity_type.lock_index() else {
            return Ok(None);
        };
        let def = &entity_type.fields[index];
        let Some(kind) = def.lock else {
            return Ok(None);
        };
        let current = entity
            .node_at(index)?
            .as_value()
            .map(|n| n.committed().clone())
            .unwrap_or(Value::Null);
        let next = next_lock(kind, def.value_type(), &current, now);
        let defs = context.definitions();
        let column = column_name(def);
        let expect = ColumnValue::new(column, to_storage(defs, def, current)?);
        let bump = ColumnValue::new(column, to_storage(defs, def, next.clone())?);
        self.locks.insert(entity.id(), next);
        Ok(Some((expect, bump)))
    }

    fn insert(
        &mut self,
        context: &EntityContext,
        id: EntityId,
        position: &HashMap<EntityId, usize>,
        fixups: &mut Vec<Planned>,
        now: i64,
    ) -> Result<()> {
        let defs = context.definitions();
        let entity = context.entity(id)?;
        let entity_type = Arc::clone(entity.entity_type());
        let key = self.keys.get(&id).cloned().unwrap_or(Value::Null);
        let own_position = position.get(&id).copied().unwrap_or(0);

        let mut values = Vec::new();
        let mut deferred = Vec::new();
        let mut changes = Vec::new();
        for (index, def) in entity_type.column_fields() {
            let column = column_name(def);
            if Some(index) == entity_type.primary_key_index() {
                values.push(ColumnValue::new(column, to_storage(defs, def, key.clone())?));
                continue;
            }
            if let Some(kind) = def.lock {
                let initial = next_lock(kind, def.value_type(), &Value::Null, now);
                values.push(ColumnValue::new(column, to_storage(defs, def, initial.clone())?));
                self.locks.insert(id, initial);
                continue;
            }
            let (value, stored) = match entity.node_at(index)? {
                Node::Value(node) => {
                    let value = node.value().clone();
                    (value.clone(), to_storage(defs, def, value)?)
                }
                Node::Ref(_) => {
                    let value = self.ref_key(context, entity, index)?;
                    let later = ref_target(context, entity, index)?
                        .and_then(|t| position.get(&t))
                        .is_some_and(|p| *p > own_position);
                    if later {
                        deferred.push(ColumnValue::new(column, value.clone()));
                        (value, Value::Null)
                    } else {
                        (value.clone(), value)
                    }
                }
                Node::ToMany(_) => continue,
            };
            if !value.is_null() {
                changes.push((index, Change::new(&def.name, Value::Null, value)));
            }
            values.push(ColumnValue::new(column, stored));
        }

        if !deferred.is_empty() {
            fixups.push(Planned {
                statement: Statement::Update {
                    table: entity_type.table.clone(),
                    key: key_column(defs, &entity_type, &key)?,
                    set: deferred,
                    expect: None,
                },
                entity: id,
                entity_type: Arc::clone(&entity_type),
                guarded: false,
            });
        }
        self.audit
            .record(id, &entity_type, key, AuditAction::Insert, changes)?;
        self.statements.push(Planned {
            statement: Statement::Insert {
                table: entity_type.table.clone(),
                values,
            },
            entity: id,
            entity_type,
            guarded: false,
        });
        Ok(())
    }

    fn update(&mut self, context: &EntityContext, id: EntityId, now: i64) -> Result<()> {
        let defs = context.definitions();
        let entity = context.entity(id)?;
        let entity_type = Arc::clone(entity.entity_type());
        let key = stored_key(entity, "update")?;

        let mut set = Vec::new();
        let mut changes = Vec::new();
        for index in entity.dirty_fields() {
            if entity_type.is_system_field(index) {
                continue;
            }
            let def = &entity_type.fields[index];
            let (old, new, stored) = match entity.node_at(index)? {
                Node::Value(node) => {
                    let new = node.value().clone();
                    (node.committed().clone(), new.clone(), to_storage(defs, def, new)?)
                }
                Node::Ref(_) => {
                    let new = self.ref_key(context, entity, index)?;
                    (committed_key(entity, index), new.clone(), new)
                }
                Node::ToMany(_) => continue,
            };
            set.push(ColumnValue::new(column_name(def), stored));
            changes.push((index, Change::new(&def.name, old, new)));
        }
        let expect = match self.lock_guard(context, entity, now)? {
            Some((expect, bump)) => {
                set.push(bump);
                Some(expect)
            }
            None => None,
        };

        self.audit
            .record(id, &entity_type, key.clone(), AuditAction::Update, changes)?;
        self.statements.push(Planned {
            statement: Statement::Update {
                table: entity_type.table.clone(),
                key: key_column(defs, &entity_type, &key)?,
                set,
                expect: expect.clone(),
            },
            entity: id,
            entity_type,
            guarded: expect.is_some(),
        });
        Ok(())
    }

    fn delete(
        &mut self,
        context: &EntityContext,
        id: EntityId,
        position: &HashMap<EntityId, usize>,
        detaches: &mut Vec<Planned>,
        now: i64,
    ) -> Result<()> {
        let defs = context.definitions();
        let entity = context.entity(id)?;
        let entity_type = Arc::clone(entity.entity_type());
        let key = stored_key(entity, "delete")?;
        let own_position = position.get(&id).copied().unwrap_or(0);

        let mut changes = Vec::new();
        let mut detached = Vec::new();
        for (index, def) in entity_type.column_fields() {
            if entity_type.is_system_field(index) {
                continue;
            }
            let old = match entity.node_at(index)? {
                Node::Value(node) => node.committed().clone(),
                Node::Ref(_) => {
                    let old = committed_key(entity, index);
                    if !old.is_null() {
                        let target_type = defs.target_of(&entity_type, &def.name)?;
                        let earlier = context
                            .find(&target_type, &old)
                            .and_then(|t| position.get(&t))
                            .is_some_and(|p| *p < own_position);
                        if earlier {
                            detached.push(ColumnValue::new(column_name(def), Value::Null));
                        }
                    }
                    old
                }
                Node::ToMany(_) => continue,
            };
            if !old.is_null() {
                changes.push((index, Change::new(&def.name, old, Value::Null)));
            }
        }

        // the target row goes first, so the stored key is cleared beforehand
        if !detached.is_empty() {
            detaches.push(Planned {
                statement: Statement::Update {
                    table: entity_type.table.clone(),
                    key: key_column(defs, &entity_type, &key)?,
                    set: detached,
                    expect: None,
                },
                entity: id,
                entity_type: Arc::clone(&entity_type),
                guarded: false,
            });
        }
        let expect = self.lock_guard(context, entity, now)?.map(|(expect, _)| expect);
        self.locks.remove(&id);

        self.audit
            .record(id, &entity_type, key.clone(), AuditAction::Delete, changes)?;
        self.statements.push(Planned {
            statement: Statement::Delete {
                table: entity_type.table.clone(),
                key: key_column(defs, &entity_type, &key)?,
                expect: expect.clone(),
            },
            entity: id,
            entity_type,
            guarded: expect.is_some(),
        });
        Ok(())
    }
}

/// Writes the pending changes of a context in one backend transaction.
///
/// NEW entities are inserted in foreign-key dependency order with keys
/// drawn from the sequence source, dirty LOADED entities are updated under
/// their optimistic lock, and entities marked for removal are deleted
/// referrers-first. Either every statement commits or none does; the
/// context is only changed after the commit.
pub struct Persister<'a> {
    backend: &'a mut dyn Backend,
    sequence: &'a dyn SequenceSource,
}

impl<'a> Persister<'a> {
    /// Persister over a borrowed connection.
    pub fn new(backend: &'a mut dyn Backend, sequence: &'a dyn SequenceSource) -> Self {
        Self { backend, sequence }
    }

    /// Write every pending change of `context`.
    pub fn persist(&mut self, context: &mut EntityContext) -> Result<PersistOutcome> {
        let work = analyse(context)?;
        if work.is_empty() {
            for id in &work.discarded {
                context.entity_deleted(*id)?;
            }
            return Ok(PersistOutcome::default());
        }

        let plan = self.plan(context, &work)?;
        let max_batch_size = context.config().max_batch_size.max(1);

        self.backend.begin()?;
        if let Err(err) = self.write(context, &plan, max_batch_size) {
            if let Err(rollback) = self.backend.rollback() {
                warn!(error = %rollback, "Rollback failed");
            }
            return Err(err);
        }
        self.backend.commit()?;

        let outcome = apply(context, &work, plan)?;
        info!(
            inserted = outcome.inserted.len(),
            updated = outcome.updated.len(),
            deleted = outcome.deleted.len(),
            statements = outcome.statements,
            "Persist committed"
        );
        Ok(outcome)
    }

    fn plan(&self, context: &EntityContext, work: &WorkSet) -> Result<Plan> {
        let inserts = insert_order(context, &work.inserts)?;
        let deletes = delete_order(context, &work.deletes)?;
        let now = now_micros();

        let mut plan = Plan::default();
        for &id in &inserts {
            let entity = context.entity(id)?;
            let key = match entity.key() {
                Some(key) => key.clone(),
                None => self.sequence.next_key(entity.entity_type())?,
            };
            plan.keys.insert(id, key);
        }

        let position: HashMap<EntityId, usize> =
            inserts.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut fixups = Vec::new();
        for &id in &inserts {
            plan.insert(context, id, &position, &mut fixups, now)?;
        }
        plan.statements.extend(fixups);
        for &id in &work.updates {
            plan.update(context, id, now)?;
        }
        let position: HashMap<EntityId, usize> =
            deletes.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let first_delete = plan.statements.len();
        let mut detaches = Vec::new();
        for &id in &deletes {
            plan.delete(context, id, &position, &mut detaches, now)?;
        }
        let deleted = plan.statements.split_off(first_delete);
        plan.statements.extend(detaches);
        plan.statements.extend(deleted);
        plan.inserts = inserts;
        plan.deletes = deletes;
        Ok(plan)
    }

    fn write(&mut self, context: &EntityContext, plan: &Plan, max_batch_size: usize) -> Result<()> {
        match self.run(context, &plan.statements, max_batch_size, false)? {
            Run::Done => Ok(()),
            Run::Unattributed(cause) => {
                warn!(error = %cause, "Batch failure not attributable, re-running statements singly");
                self.backend.rollback()?;
                self.backend.begin()?;
                match self.run(context, &plan.statements, max_batch_size, true)? {
                    Run::Done => Ok(()),
                    Run::Unattributed(cause) => Err(cause.into()),
                }
            }
        }
    }

    /// Issue statements in groups of the same kind and table.
    fn run(
        &mut self,
        context: &EntityContext,
        statements: &[Planned],
        max_batch_size: usize,
        single: bool,
    ) -> Result<Run> {
        let caps = self.backend.capabilities();
        let mut start = 0;
        while start < statements.len() {
            let first = &statements[start].statement;
            let mut end = start + 1;
            while end < statements.len()
                && end - start < max_batch_size
                && statements[end].statement.batches_with(first)
            {
                end += 1;
            }
            let group = &statements[start..end];
            let guarded = group.iter().any(|p| p.guarded);

            if single || group.len() == 1 || (guarded && !caps.supports_batch_update_counts) {
                for planned in group {
                    let rows = self
                        .backend
                        .execute(&planned.statement)
                        .map_err(|cause| statement_error(planned, cause))?;
                    self.check_rows(context, planned, rows)?;
                }
            } else {
                let batch: Vec<Statement> = group.iter().map(|p| p.statement.clone()).collect();
                match self.backend.execute_batch(&batch) {
                    BatchResult::Completed(counts) => {
                        for (planned, rows) in group.iter().zip(counts) {
                            self.check_rows(context, planned, rows)?;
                        }
                    }
                    BatchResult::Failed(failure) => {
                        let failed = caps
                            .can_attribute_batch_failures()
                            .then(|| {
                                failure
                                    .statuses
                                    .iter()
                                    .position(|s| *s == StatementStatus::Failed)
                            })
                            .flatten()
                            .and_then(|i| group.get(i));
                        return match failed {
                            Some(planned) => Err(statement_error(planned, failure.cause)),
                            None => Ok(Run::Unattributed(failure.cause)),
                        };
                    }
                }
            }
            debug!(
                kind = first.kind(),
                table = first.table(),
                size = group.len(),
                single,
                "Statements executed"
            );
            start = end;
        }
        Ok(Run::Done)
    }

    /// An update or delete that touched nothing lost its row or its lock.
    fn check_rows(&mut self, context: &EntityContext, planned: &Planned, rows: u64) -> Result<()> {
        if rows > 0 || matches!(planned.statement, Statement::Insert { .. }) {
            return Ok(());
        }
        let entity = context.entity(planned.entity)?;
        let key = stored_key(entity, "persist")?;
        match self.stored_copy(context, &planned.entity_type, &key)? {
            Some(database_copy) => {
                debug!(entity = %planned.entity, entity_type = %planned.entity_type.name, "Lock mismatch");
                Err(Error::OptimisticLockConflict(Box::new(LockConflict {
                    caller_copy: entity.snapshot(),
                    database_copy,
                })))
            }
            None => Err(Error::MissingRow {
                entity_type: planned.entity_type.name.clone(),
                key,
            }),
        }
    }

    /// The row as currently stored.
    fn stored_copy(
        &mut self,
        context: &EntityContext,
        entity_type: &EntityType,
        key: &Value,
    ) -> Result<Option<EntitySnapshot>> {
        let defs = context.definitions();
        let fields: Vec<_> = entity_type.column_fields().collect();
        let mut plan = SelectPlan::new(TableRef::new(&entity_type.table, "a"));
        plan.columns = fields
            .iter()
            .map(|(_, def)| ColumnRef::new("a", column_name(def)))
            .collect();
        plan.predicate = Some(Predicate::Compare {
            column: ColumnRef::new("a", entity_type.primary_key_column()),
            op: CompareOp::Eq,
            operand: Operand::Value(key_column(defs, entity_type, key)?.value),
        });

        let rows = self.backend.select(&plan)?;
        let Some(row) = rows.rows.into_iter().next() else {
            return Ok(None);
        };
        let values = fields
            .iter()
            .zip(row)
            .map(|((_, def), value)| Ok((def.name.clone(), from_storage(defs, def, value)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Some(EntitySnapshot {
            entity_type: entity_type.name.clone(),
            key: Some(key.clone()),
            values,
        }))
    }
}

fn statement_error(planned: &Planned, cause: BackendError) -> Error {
    match cause {
        BackendError::DuplicateKey { key, .. } => Error::DuplicateKey {
            entity_type: planned.entity_type.name.clone(),
            key,
        },
        other => Error::Backend(other),
    }
}

fn load_lock(context: &mut EntityContext, id: EntityId, value: Option<&Value>) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    let entity = context.entity_mut(id)?;
    let Some(index) = entity.entity_type().lock_index() else {
        return Ok(());
    };
    if let Some(node) = entity.node_at_mut(index)?.as_value_mut() {
        node.load(value.clone());
    }
    Ok(())
}

/// Bring the context in line with the committed rows.
fn apply(context: &mut EntityContext, work: &WorkSet, plan: Plan) -> Result<PersistOutcome> {
    for id in &plan.inserts {
        if let Some(key) = plan.keys.get(id) {
            context.assign_key(*id, key.clone())?;
        }
    }
    for &id in &plan.inserts {
        load_lock(context, id, plan.locks.get(&id))?;
        let entity = context.entity_mut(id)?;
        entity.commit();
        entity.set_state(EntityState::Loaded);
        let collections: Vec<usize> = entity
            .entity_type()
            .to_many_fields()
            .map(|(index, _)| index)
            .collect();
        for index in collections {
            context.set_fetched(id, index)?;
        }
    }
    for &id in &work.updates {
        load_lock(context, id, plan.locks.get(&id))?;
        context.entity_mut(id)?.commit();
    }
    for &id in plan.deletes.iter().chain(&work.discarded) {
        context.entity_deleted(id)?;
    }

    Ok(PersistOutcome {
        audit: plan.audit,
        statements: plan.statements.len(),
        inserted: plan.inserts,
        updated: work.updates.clone(),
        deleted: plan.deletes,
    })
}
