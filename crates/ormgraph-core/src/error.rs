//! Core error types.

use ormgraph_proto::{BackendError, Value};
use thiserror::Error;

use crate::graph::{EntityId, EntitySnapshot, EntityState};

/// Result alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error classification.
///
/// Callers branch on the kind rather than on individual variants: only
/// `OptimisticLock`, `MissingRow` and `DuplicateKey` are worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Schema or namespace misconfiguration, dependency cycles.
    Configuration,
    /// Programming errors against the entity graph.
    Consistency,
    /// Concurrent modification detected by an optimistic lock.
    OptimisticLock,
    /// An expected row is absent from the backend.
    MissingRow,
    /// An insert collided with an existing primary key.
    DuplicateKey,
    /// Connection or statement failure.
    Backend,
    /// Malformed query tree.
    QueryModel,
    /// Proxy issuance failure.
    Proxy,
}

/// Both copies of an entity involved in an optimistic-lock conflict.
#[derive(Debug, Clone)]
pub struct LockConflict {
    /// The entity as the caller holds it, including pending changes.
    pub caller_copy: EntitySnapshot,
    /// The row as currently stored.
    pub database_copy: EntitySnapshot,
}

/// Core errors.
#[derive(Debug, Error)]
pub enum Error {
    /// No namespace with this name is registered.
    #[error("unknown namespace '{0}'")]
    UnknownNamespace(String),

    /// No entity type with this name in the namespace.
    #[error("unknown entity type '{namespace}.{name}'")]
    UnknownEntityType {
        /// Namespace searched.
        namespace: String,
        /// Requested type name.
        name: String,
    },

    /// The entity type has no such field.
    #[error("entity type '{entity_type}' has no field '{field}'")]
    UnknownField {
        /// Entity type name.
        entity_type: String,
        /// Requested field.
        field: String,
    },

    /// A relation crosses into a namespace the source namespace does not
    /// reference.
    #[error("namespace '{from}' does not reference namespace '{to}'")]
    NamespaceNotReferenced {
        /// Referencing namespace.
        from: String,
        /// Referenced namespace.
        to: String,
    },

    /// The schema catalog is internally inconsistent.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// Mandatory references form a cycle among the entities being written.
    #[error("dependency cycle among mandatory references: {}", .entities.join(" -> "))]
    DependencyCycle {
        /// Entities on the cycle, rendered as `Type#key`.
        entities: Vec<String>,
    },

    /// Attempt to change an already assigned primary key.
    #[error("primary key of '{entity_type}' is immutable ({old} -> {new})")]
    PrimaryKeyMutation {
        /// Entity type name.
        entity_type: String,
        /// Current key.
        old: Value,
        /// Attempted key.
        new: Value,
    },

    /// Two distinct entities claim the same identity.
    #[error("entity '{entity_type}' with key {key} already exists in the context")]
    DuplicateIdentity {
        /// Entity type name.
        entity_type: String,
        /// Contested key.
        key: Value,
    },

    /// The same node was audited twice within one persist call.
    #[error("node '{entity_type}.{field}' audited twice in one persist operation")]
    DoubleAudit {
        /// Entity type name.
        entity_type: String,
        /// Field name.
        field: String,
    },

    /// Node access after the entity was deleted.
    #[error("entity '{entity_type}' ({uuid}) is deleted")]
    EntityDeleted {
        /// Entity type name.
        entity_type: String,
        /// Session identity.
        uuid: uuid::Uuid,
    },

    /// Handle does not belong to this context.
    #[error("unknown entity {0}")]
    UnknownEntity(EntityId),

    /// Field values of a stub were read before it was fetched.
    #[error("entity '{entity_type}' with key {key} is not loaded")]
    NotLoaded {
        /// Entity type name.
        entity_type: String,
        /// Key of the stub.
        key: Value,
    },

    /// Operation not allowed in the entity's lifecycle state.
    #[error("cannot {operation} entity '{entity_type}' in state {state:?}")]
    InvalidState {
        /// Entity type name.
        entity_type: String,
        /// Current state.
        state: EntityState,
        /// Attempted operation.
        operation: &'static str,
    },

    /// A non-nullable node holds no value at persist time.
    #[error("mandatory field '{entity_type}.{field}' has no value")]
    MandatoryValueMissing {
        /// Entity type name.
        entity_type: String,
        /// Field name.
        field: String,
    },

    /// A value does not fit the field's declared type.
    #[error("field '{entity_type}.{field}' expects {expected}, got {found}")]
    TypeMismatch {
        /// Entity type name.
        entity_type: String,
        /// Field name.
        field: String,
        /// Declared type.
        expected: String,
        /// Offending value.
        found: Value,
    },

    /// Field is maintained by the engine and cannot be set by callers.
    #[error("field '{entity_type}.{field}' is managed by the persistence engine")]
    ReadOnlyField {
        /// Entity type name.
        entity_type: String,
        /// Field name.
        field: String,
    },

    /// Deletion blocked by a restrict relation.
    #[error("cannot delete '{entity_type}': {count} loaded '{field}' children restrict it")]
    DeleteRestricted {
        /// Entity type name.
        entity_type: String,
        /// To-many field holding the children.
        field: String,
        /// Number of children.
        count: usize,
    },

    /// Stored row differs from the version the caller loaded.
    #[error(
        "optimistic lock mismatch on '{}' with key {}",
        .0.caller_copy.entity_type,
        .0.caller_copy.key_display()
    )]
    OptimisticLockConflict(Box<LockConflict>),

    /// An expected row is absent from the backend.
    #[error("no row for '{entity_type}' with key {key}")]
    MissingRow {
        /// Entity type name.
        entity_type: String,
        /// Key looked up.
        key: Value,
    },

    /// An insert collided with an existing primary key.
    #[error("duplicate key {key} for '{entity_type}'")]
    DuplicateKey {
        /// Entity type name.
        entity_type: String,
        /// Colliding key.
        key: String,
    },

    /// Backend failure; the original cause is preserved.
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Query tree references a property its entity type lacks.
    #[error("entity type '{entity_type}' has no property '{property}'")]
    UnknownProperty {
        /// Entity type name.
        entity_type: String,
        /// Requested property.
        property: String,
    },

    /// Property exists but has the wrong node kind for the operation.
    #[error("property '{entity_type}.{property}' is not a {expected} node")]
    InvalidNodeType {
        /// Entity type name.
        entity_type: String,
        /// Property name.
        property: String,
        /// Node kind the operation needs.
        expected: &'static str,
    },

    /// Query tree is structurally invalid.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Requested feature is unavailable on the bound backend.
    #[error("unsupported by backend: {0}")]
    Unsupported(String),

    /// Proxy cache or factory produced a different type than requested.
    #[error("proxy for '{entity_type}' is not a {requested}")]
    ProxyType {
        /// Entity type name.
        entity_type: String,
        /// Requested Rust type.
        requested: &'static str,
    },

    /// Schema file could not be parsed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Type conversion failure.
    #[error("conversion error in '{converter}': {message}")]
    Conversion {
        /// Converter name.
        converter: String,
        /// Failure description.
        message: String,
    },
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::UnknownNamespace(_)
            | Error::UnknownEntityType { .. }
            | Error::UnknownField { .. }
            | Error::NamespaceNotReferenced { .. }
            | Error::InvalidSchema(_)
            | Error::DependencyCycle { .. }
            | Error::Serialization(_) => ErrorKind::Configuration,
            Error::PrimaryKeyMutation { .. }
            | Error::DuplicateIdentity { .. }
            | Error::DoubleAudit { .. }
            | Error::EntityDeleted { .. }
            | Error::UnknownEntity(_)
            | Error::NotLoaded { .. }
            | Error::InvalidState { .. }
            | Error::MandatoryValueMissing { .. }
            | Error::TypeMismatch { .. }
            | Error::ReadOnlyField { .. }
            | Error::DeleteRestricted { .. }
            | Error::Conversion { .. } => ErrorKind::Consistency,
            Error::OptimisticLockConflict(_) => ErrorKind::OptimisticLock,
            Error::MissingRow { .. } => ErrorKind::MissingRow,
            Error::DuplicateKey { .. } => ErrorKind::DuplicateKey,
            Error::Backend(_) | Error::Unsupported(_) => ErrorKind::Backend,
            Error::UnknownProperty { .. }
            | Error::InvalidNodeType { .. }
            | Error::InvalidQuery(_) => ErrorKind::QueryModel,
            Error::ProxyType { .. } => ErrorKind::Proxy,
        }
    }

    /// Whether reloading and retrying the operation can succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::OptimisticLock | ErrorKind::MissingRow | ErrorKind::DuplicateKey
        )
    }

    /// The conflict details of an optimistic-lock failure.
    pub fn lock_conflict(&self) -> Option<&LockConflict> {
        match self {
            Error::OptimisticLockConflict(conflict) => Some(conflict),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let err = Error::DependencyCycle {
            entities: vec!["A#1".into(), "B#2".into(), "A#1".into()],
        };
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(
            err.to_string(),
            "dependency cycle among mandatory references: A#1 -> B#2 -> A#1"
        );
        assert!(!err.is_recoverable());

        let err = Error::MissingRow {
            entity_type: "User".into(),
            key: Value::Int64(4),
        };
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_backend_cause_preserved() {
        let err: Error = BackendError::Connection("reset by peer".into()).into();
        assert_eq!(err.kind(), ErrorKind::Backend);
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("connection error: reset by peer"));
    }
}
