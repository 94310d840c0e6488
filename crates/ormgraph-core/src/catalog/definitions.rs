//! Namespaced registry of entity types.

use std::collections::{BTreeMap, BTreeSet, BinaryHeap, HashMap};
use std::cmp::Reverse;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::converter::{TimestampAsString, TypeConverter};
use super::entity::EntityType;
use super::field::{FieldDef, FieldKind, LockKind, TypeRef};
use super::types::ScalarType;
use crate::error::{Error, Result};

/// Serialized form of one namespace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamespaceDef {
    /// Namespace name.
    pub name: String,
    /// Namespaces whose types may be the target of relations from here.
    #[serde(default)]
    pub references: Vec<String>,
    /// Entity types of the namespace.
    #[serde(default)]
    pub types: Vec<EntityType>,
}

impl NamespaceDef {
    /// Create an empty namespace definition.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            references: Vec::new(),
            types: Vec::new(),
        }
    }

    /// Allow relations into another namespace.
    pub fn with_reference(mut self, namespace: impl Into<String>) -> Self {
        self.references.push(namespace.into());
        self
    }

    /// Add an entity type.
    pub fn with_type(mut self, entity_type: EntityType) -> Self {
        self.types.push(entity_type);
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CatalogDocument {
    namespaces: Vec<NamespaceDef>,
}

#[derive(Debug, Default)]
struct Namespace {
    references: BTreeSet<String>,
    types: BTreeMap<String, Arc<EntityType>>,
}

/// The schema catalog: entity types keyed by namespace, plus the converter
/// registry.
#[derive(Debug)]
pub struct Definitions {
    namespaces: BTreeMap<String, Namespace>,
    converters: HashMap<String, Arc<dyn TypeConverter>>,
}

impl Definitions {
    /// Create an empty catalog with the built-in converters registered.
    pub fn new() -> Self {
        let mut defs = Self {
            namespaces: BTreeMap::new(),
            converters: HashMap::new(),
        };
        defs.register_converter(Arc::new(TimestampAsString));
        defs
    }

    /// Parse a JSON catalog document (`{"namespaces": [...]}`) and validate it.
    pub fn from_json(json: &str) -> Result<Self> {
        let doc: CatalogDocument =
            serde_json::from_str(json).map_err(|e| Error::Serialization(e.to_string()))?;
        let mut defs = Self::new();
        for ns in doc.namespaces {
            defs.load(ns)?;
        }
        defs.validate()?;
        Ok(defs)
    }

    /// Serialize the catalog to a JSON document.
    pub fn to_json(&self) -> Result<String> {
        let doc = CatalogDocument {
            namespaces: self
                .namespaces
                .iter()
                .map(|(name, ns)| NamespaceDef {
                    name: name.clone(),
                    references: ns.references.iter().cloned().collect(),
                    types: ns.types.values().map(|t| EntityType::clone(t)).collect(),
                })
                .collect(),
        };
        serde_json::to_string_pretty(&doc).map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Declare a namespace and the namespaces it references.
    pub fn add_namespace(
        &mut self,
        name: impl Into<String>,
        references: impl IntoIterator<Item = impl Into<String>>,
    ) {
        let ns = self.namespaces.entry(name.into()).or_default();
        ns.references.extend(references.into_iter().map(Into::into));
    }

    /// Load a namespace definition with all its types.
    pub fn load(&mut self, def: NamespaceDef) -> Result<()> {
        self.add_namespace(def.name.clone(), def.references);
        for ty in def.types {
            self.register(&def.name, ty)?;
        }
        Ok(())
    }

    /// Register an entity type into a declared namespace.
    pub fn register(&mut self, namespace: &str, mut entity_type: EntityType) -> Result<Arc<EntityType>> {
        let ns = self
            .namespaces
            .get_mut(namespace)
            .ok_or_else(|| Error::UnknownNamespace(namespace.to_string()))?;
        if ns.types.contains_key(&entity_type.name) {
            return Err(Error::InvalidSchema(format!(
                "entity type '{}.{}' registered twice",
                namespace, entity_type.name
            )));
        }
        entity_type.namespace = namespace.to_string();
        let entity_type = Arc::new(entity_type);
        ns.types
            .insert(entity_type.name.clone(), Arc::clone(&entity_type));
        Ok(entity_type)
    }

    /// Register a type converter under its name.
    pub fn register_converter(&mut self, converter: Arc<dyn TypeConverter>) {
        self.converters.insert(converter.name().to_string(), converter);
    }

    /// Look up a converter by name.
    pub fn converter(&self, name: &str) -> Result<Arc<dyn TypeConverter>> {
        self.converters
            .get(name)
            .cloned()
            .ok_or_else(|| Error::InvalidSchema(format!("unknown converter '{name}'")))
    }

    /// Look up an entity type.
    pub fn lookup(&self, namespace: &str, name: &str) -> Result<Arc<EntityType>> {
        self.namespaces
            .get(namespace)
            .ok_or_else(|| Error::UnknownNamespace(namespace.to_string()))?
            .types
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownEntityType {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    /// Look up a field of an entity type.
    pub fn lookup_field<'t>(&self, entity_type: &'t EntityType, field: &str) -> Result<&'t FieldDef> {
        entity_type.field(field).ok_or_else(|| Error::UnknownField {
            entity_type: entity_type.name.clone(),
            field: field.to_string(),
        })
    }

    /// Resolve a relation target as seen from `from`.
    pub fn resolve(&self, from: &EntityType, target: &TypeRef) -> Result<Arc<EntityType>> {
        let namespace = target.namespace.as_deref().unwrap_or(&from.namespace);
        if namespace != from.namespace {
            let referenced = self
                .namespaces
                .get(&from.namespace)
                .is_some_and(|ns| ns.references.contains(namespace));
            if !referenced {
                return Err(Error::NamespaceNotReferenced {
                    from: from.namespace.clone(),
                    to: namespace.to_string(),
                });
            }
        }
        self.lookup(namespace, &target.name)
    }

    /// Resolve the target type of a relation field.
    pub fn target_of(&self, entity_type: &EntityType, field: &str) -> Result<Arc<EntityType>> {
        let def = self.lookup_field(entity_type, field)?;
        let target = def.target().ok_or_else(|| Error::InvalidNodeType {
            entity_type: entity_type.name.clone(),
            property: field.to_string(),
            expected: "relation",
        })?;
        self.resolve(entity_type, target)
    }

    /// Names of all namespaces.
    pub fn namespaces(&self) -> impl Iterator<Item = &str> {
        self.namespaces.keys().map(String::as_str)
    }

    /// All entity types, ordered by namespace and name.
    pub fn types(&self) -> impl Iterator<Item = &Arc<EntityType>> {
        self.namespaces.values().flat_map(|ns| ns.types.values())
    }

    /// Check the catalog for internal consistency.
    pub fn validate(&self) -> Result<()> {
        for (name, ns) in &self.namespaces {
            for referenced in &ns.references {
                if !self.namespaces.contains_key(referenced) {
                    return Err(Error::UnknownNamespace(referenced.clone()));
                }
            }
            for ty in ns.types.values() {
                self.validate_type(ty)
                    .map_err(|e| match e {
                        Error::InvalidSchema(msg) => {
                            Error::InvalidSchema(format!("{name}.{}: {msg}", ty.name))
                        }
                        other => other,
                    })?;
            }
        }
        Ok(())
    }

    fn validate_type(&self, ty: &EntityType) -> Result<()> {
        let pk = self.lookup_field(ty, &ty.primary_key)?;
        if !pk.is_value() {
            return Err(Error::InvalidSchema(format!(
                "primary key '{}' must be a value field",
                ty.primary_key
            )));
        }

        let locks: Vec<&FieldDef> = ty.fields.iter().filter(|f| f.lock.is_some()).collect();
        if locks.len() > 1 {
            return Err(Error::InvalidSchema("more than one lock field".into()));
        }
        if let Some(lock) = locks.first() {
            let ok = match (lock.lock, lock.value_type()) {
                (Some(LockKind::Counter), Some(ScalarType::Int32 | ScalarType::Int64)) => true,
                (Some(LockKind::Timestamp), Some(ScalarType::Timestamp)) => true,
                _ => false,
            };
            if !ok || lock.converter.is_some() {
                return Err(Error::InvalidSchema(format!(
                    "lock field '{}' has an unsuitable type",
                    lock.name
                )));
            }
        }

        let mut columns = BTreeSet::new();
        for field in &ty.fields {
            if let Some(column) = &field.column {
                if field.is_to_many() {
                    return Err(Error::InvalidSchema(format!(
                        "to-many field '{}' cannot have a column",
                        field.name
                    )));
                }
                if !columns.insert(column.as_str()) {
                    return Err(Error::InvalidSchema(format!("column '{column}' mapped twice")));
                }
            } else if !field.is_to_many() {
                return Err(Error::InvalidSchema(format!(
                    "field '{}' has no column",
                    field.name
                )));
            }
            if let Some(name) = &field.converter {
                self.converter(name)?;
            }
            self.validate_relation(ty, field)?;
        }

        for set in &ty.unique {
            for field in set {
                self.lookup_field(ty, field)?;
            }
        }
        Ok(())
    }

    fn validate_relation(&self, ty: &EntityType, field: &FieldDef) -> Result<()> {
        match &field.kind {
            FieldKind::Value { .. } => Ok(()),
            FieldKind::Reference { target, key_type } => {
                let target = self.resolve(ty, target)?;
                let target_key = self
                    .lookup_field(&target, &target.primary_key)?
                    .value_type();
                if target_key != Some(*key_type) {
                    return Err(Error::InvalidSchema(format!(
                        "reference '{}' has key type {key_type}, target key is {}",
                        field.name,
                        target_key.map(|t| t.to_string()).unwrap_or_default()
                    )));
                }
                Ok(())
            }
            FieldKind::ToMany {
                target,
                mapped_by,
                join_property,
                ..
            } => {
                let child = self.resolve(ty, target)?;
                let back = self.lookup_field(&child, mapped_by)?;
                let points_back = match back.target() {
                    Some(t) if back.is_reference() => {
                        self.resolve(&child, t)?.qualified_name() == ty.qualified_name()
                    }
                    _ => false,
                };
                if !points_back {
                    return Err(Error::InvalidSchema(format!(
                        "'{}.{}' is not a reference back to '{}'",
                        child.name, mapped_by, ty.name
                    )));
                }
                if let Some(jp) = join_property {
                    let hop = self.lookup_field(&child, jp)?;
                    if !hop.is_reference() {
                        return Err(Error::InvalidSchema(format!(
                            "join property '{}.{}' is not a reference",
                            child.name, jp
                        )));
                    }
                }
                Ok(())
            }
        }
    }

    /// Type-level write order: targets of mandatory references come before
    /// the types referencing them. Self-references are ignored.
    pub fn dependency_order(&self) -> Result<Vec<Arc<EntityType>>> {
        let types: Vec<Arc<EntityType>> = self.types().cloned().collect();
        let index: HashMap<String, usize> = types
            .iter()
            .enumerate()
            .map(|(i, t)| (t.qualified_name(), i))
            .collect();

        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); types.len()];
        let mut pending = vec![0usize; types.len()];
        for (i, ty) in types.iter().enumerate() {
            let mut seen = BTreeSet::new();
            for (_, field) in ty.reference_fields() {
                if !field.is_mandatory_reference() {
                    continue;
                }
                let Some(target) = field.target() else { continue };
                let target = self.resolve(ty, target)?;
                if let Some(&t) = index.get(&target.qualified_name()) {
                    if t != i && seen.insert(t) {
                        dependents[t].push(i);
                        pending[i] += 1;
                    }
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = pending
            .iter()
            .enumerate()
            .filter(|(_, &n)| n == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(types.len());
        while let Some(Reverse(i)) = ready.pop() {
            order.push(Arc::clone(&types[i]));
            for &d in &dependents[i] {
                pending[d] -= 1;
                if pending[d] == 0 {
                    ready.push(Reverse(d));
                }
            }
        }

        if order.len() < types.len() {
            let entities = pending
                .iter()
                .enumerate()
                .filter(|(_, &n)| n > 0)
                .map(|(i, _)| types[i].qualified_name())
                .collect();
            return Err(Error::DependencyCycle { entities });
        }
        Ok(order)
    }
}

impl Default for Definitions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Definitions {
        let mut defs = Definitions::new();
        defs.add_namespace("auth", Vec::<String>::new());
        defs.add_namespace("app", ["auth"]);
        defs.register(
            "auth",
            EntityType::new("User", "app_user", "id")
                .with_field(FieldDef::value("id", ScalarType::Int64))
                .with_field(FieldDef::value("name", ScalarType::String)),
        )
        .unwrap();
        defs.register(
            "app",
            EntityType::new("Document", "document", "id")
                .with_field(FieldDef::value("id", ScalarType::Int64))
                .with_field(FieldDef::reference(
                    "owner",
                    TypeRef::qualified("auth", "User"),
                    ScalarType::Int64,
                )),
        )
        .unwrap();
        defs
    }

    #[test]
    fn test_lookup() {
        let defs = catalog();
        assert_eq!(defs.lookup("auth", "User").unwrap().table, "app_user");
        assert!(matches!(
            defs.lookup("auth", "Nope"),
            Err(Error::UnknownEntityType { .. })
        ));
        assert!(matches!(
            defs.lookup("nope", "User"),
            Err(Error::UnknownNamespace(_))
        ));
    }

    #[test]
    fn test_cross_namespace_resolution() {
        let defs = catalog();
        let doc = defs.lookup("app", "Document").unwrap();
        let user = defs.target_of(&doc, "owner").unwrap();
        assert_eq!(user.qualified_name(), "auth.User");

        let reverse = defs
            .lookup("auth", "User")
            .map(|u| defs.resolve(&u, &TypeRef::qualified("app", "Document")))
            .unwrap();
        assert!(matches!(reverse, Err(Error::NamespaceNotReferenced { .. })));
        defs.validate().unwrap();
    }

    #[test]
    fn test_dependency_order() {
        let defs = catalog();
        let order: Vec<String> = defs
            .dependency_order()
            .unwrap()
            .iter()
            .map(|t| t.name.clone())
            .collect();
        assert_eq!(order, vec!["User", "Document"]);
    }

    #[test]
    fn test_type_level_cycle() {
        let mut defs = Definitions::new();
        defs.add_namespace("x", Vec::<String>::new());
        for (name, other) in [("A", "B"), ("B", "A")] {
            defs.register(
                "x",
                EntityType::new(name, name.to_lowercase(), "id")
                    .with_field(FieldDef::value("id", ScalarType::Int64))
                    .with_field(FieldDef::reference(
                        "other",
                        TypeRef::local(other),
                        ScalarType::Int64,
                    )),
            )
            .unwrap();
        }
        assert!(matches!(
            defs.dependency_order(),
            Err(Error::DependencyCycle { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_bad_back_reference() {
        let mut defs = Definitions::new();
        defs.add_namespace("x", Vec::<String>::new());
        defs.register(
            "x",
            EntityType::new("Parent", "parent", "id")
                .with_field(FieldDef::value("id", ScalarType::Int64))
                .with_field(FieldDef::to_many("children", TypeRef::local("Child"), "name")),
        )
        .unwrap();
        defs.register(
            "x",
            EntityType::new("Child", "child", "id")
                .with_field(FieldDef::value("id", ScalarType::Int64))
                .with_field(FieldDef::value("name", ScalarType::String)),
        )
        .unwrap();
        assert!(matches!(defs.validate(), Err(Error::InvalidSchema(_))));
    }

    #[test]
    fn test_json_catalog() {
        let json = r#"{"namespaces":[{"name":"app","types":[
            {"name":"Tag","table":"tag","primary_key":"id","fields":[
                {"name":"id","column":"id","kind":"value","value_type":"int64","storage_type":"int64"},
                {"name":"label","column":"label","kind":"value","value_type":"string","storage_type":"string"}
            ]}]}]}"#;
        let defs = Definitions::from_json(json).unwrap();
        let tag = defs.lookup("app", "Tag").unwrap();
        assert_eq!(tag.namespace, "app");
        assert_eq!(tag.fields.len(), 2);

        let again = Definitions::from_json(&defs.to_json().unwrap()).unwrap();
        assert_eq!(again.lookup("app", "Tag").unwrap(), tag);
    }
}
