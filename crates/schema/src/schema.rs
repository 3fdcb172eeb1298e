//! Declarative description of entity types and the references between them.
//!
//! A [`Schema`] is built once, up-front, and is the closed set of branches the
//! store will ever hold. Everything downstream (normalization, the store's
//! branch layout, the denormalizer's dependency tracking) is driven from it.

use crate::error::{ErrorKind, Result};
use crate::id::{EntityId, EntityType};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

pub const DEFAULT_ID_ATTRIBUTE: &str = "id";

/// Whether a relation references a single entity or a list of them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Cardinality {
    One,
    Many,
}

/// A reference from one entity type to another.
///
/// In raw (server) and denormalized form the referenced entity lives under
/// [`key`](Self::key) as an embedded object, or an array of them. In
/// normalized form [`id_key`](Self::id_key) holds the id, or an array of ids.
/// Both names are the same unless [`stored_as`](Self::stored_as) is used.
///
/// ```
/// use strata_schema::{Cardinality, Relation};
///
/// let pages = Relation::many("pages", "page").stored_as("pageIds");
/// assert_eq!(pages.key(), "pages");
/// assert_eq!(pages.id_key(), "pageIds");
/// assert_eq!(pages.cardinality(), Cardinality::Many);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Relation {
    key: String,
    id_key: String,
    target: EntityType,
    cardinality: Cardinality,
}

impl Relation {
    pub fn one(key: impl Into<String>, target: impl Into<EntityType>) -> Self {
        Self::new(key.into(), target.into(), Cardinality::One)
    }

    pub fn many(key: impl Into<String>, target: impl Into<EntityType>) -> Self {
        Self::new(key.into(), target.into(), Cardinality::Many)
    }

    fn new(key: String, target: EntityType, cardinality: Cardinality) -> Self {
        Self { id_key: key.clone(), key, target, cardinality }
    }

    /// Store the referenced id(s) under a different field name once
    /// normalized (`folder` → `folderId`).
    pub fn stored_as(mut self, id_key: impl Into<String>) -> Self {
        self.id_key = id_key.into();
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn id_key(&self) -> &str {
        &self.id_key
    }

    pub fn target(&self) -> &EntityType {
        &self.target
    }

    pub fn cardinality(&self) -> Cardinality {
        self.cardinality
    }
}

/// Shape of one entity type.
#[derive(Clone, Debug)]
pub struct EntitySchema {
    name: EntityType,
    id_attribute: String,
    relations: Vec<Arc<Relation>>,
}

impl EntitySchema {
    pub fn new(name: impl Into<EntityType>) -> Self {
        Self { name: name.into(), id_attribute: DEFAULT_ID_ATTRIBUTE.to_string(), relations: Vec::new() }
    }

    /// Use a field other than `id` as the entity's identifier.
    pub fn id_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.id_attribute = attribute.into();
        self
    }

    pub fn relation(mut self, relation: Relation) -> Self {
        self.relations.push(Arc::new(relation));
        self
    }

    pub fn name(&self) -> &EntityType {
        &self.name
    }

    pub fn id_field(&self) -> &str {
        &self.id_attribute
    }

    pub fn relations(&self) -> &[Arc<Relation>] {
        &self.relations
    }

    /// Extract the id of an entity of this type.
    ///
    /// Returns [`ErrorKind::InvalidEntity`] when the value is not an object,
    /// or its id field is missing or not a valid [`EntityId`].
    pub fn id_of(&self, entity: &Value) -> Result<EntityId> {
        let Some(object) = entity.as_object() else {
            exn::bail!(self.invalid("not an object"));
        };
        match object.get(&self.id_attribute) {
            None | Some(Value::Null) => exn::bail!(self.invalid("missing id")),
            Some(id) => match EntityId::from_value(id) {
                Some(id) => Ok(id),
                None => exn::bail!(self.invalid("id is neither an integer nor a string")),
            },
        }
    }

    pub(crate) fn invalid(&self, reason: &'static str) -> ErrorKind {
        ErrorKind::InvalidEntity { entity_type: self.name.to_string(), reason }
    }

    pub(crate) fn invalid_reference(&self, relation: &str) -> ErrorKind {
        ErrorKind::InvalidReference { entity_type: self.name.to_string(), field: relation.to_string() }
    }

    fn validate(&self, declared: &HashSet<&str>) -> std::result::Result<(), String> {
        let mut fields = HashSet::new();
        for relation in &self.relations {
            if !declared.contains(relation.target.as_str()) {
                return Err(format!("{}.{} references undeclared type {}", self.name, relation.key, relation.target));
            }
            for field in BTreeSet::from([relation.key.as_str(), relation.id_key.as_str()]) {
                if field == self.id_attribute {
                    return Err(format!("{}.{field} shadows the id attribute", self.name));
                }
                if !fields.insert(field) {
                    return Err(format!("{}.{field} is used by more than one relation", self.name));
                }
            }
        }
        Ok(())
    }
}

/// Incrementally declares the entity types making up a [`Schema`].
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entities: Vec<EntitySchema>,
}

impl SchemaBuilder {
    pub fn entity(mut self, entity: EntitySchema) -> Self {
        self.entities.push(entity);
        self
    }

    /// Validate every declaration and produce the schema.
    ///
    /// Fails with [`ErrorKind::InvalidSchema`] if a type is declared twice, a
    /// relation targets an undeclared type, or two relations (or a relation
    /// and the id attribute) claim the same field.
    pub fn build(self) -> Result<Schema> {
        let declared: HashSet<&str> = self.entities.iter().map(|entity| entity.name.as_str()).collect();
        if declared.len() != self.entities.len() {
            exn::bail!(ErrorKind::InvalidSchema("entity type declared more than once".to_string()));
        }
        for entity in &self.entities {
            if let Err(reason) = entity.validate(&declared) {
                exn::bail!(ErrorKind::InvalidSchema(reason));
            }
        }
        let entities = self.entities.into_iter().map(|entity| (entity.name.clone(), entity)).collect();
        Ok(Schema { entities })
    }
}

/// The closed set of entity types known to the application.
///
/// # Examples
///
/// ```
/// use strata_schema::{EntitySchema, Relation, Schema};
///
/// let schema = Schema::builder()
///     .entity(EntitySchema::new("folder").relation(Relation::many("pages", "page").stored_as("pageIds")))
///     .entity(EntitySchema::new("page").relation(Relation::one("folder", "folder").stored_as("folderId")))
///     .build()
///     .unwrap();
///
/// assert!(schema.get("folder").is_ok());
/// assert!(schema.get("user").is_err());
/// ```
#[derive(Clone, Debug)]
pub struct Schema {
    entities: BTreeMap<EntityType, EntitySchema>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Look up an entity type, failing with [`ErrorKind::UnknownType`] if it
    /// was never declared.
    pub fn get(&self, entity_type: &str) -> Result<&EntitySchema> {
        match self.entities.get(entity_type) {
            Some(entity) => Ok(entity),
            None => exn::bail!(ErrorKind::UnknownType(entity_type.to_string())),
        }
    }

    /// The canonical [`EntityType`] for a branch name.
    pub fn entity_type(&self, entity_type: &str) -> Result<EntityType> {
        self.get(entity_type).map(|entity| entity.name.clone())
    }

    pub fn types(&self) -> impl Iterator<Item = &EntityType> {
        self.entities.keys()
    }

    /// Every type whose entities can appear in the denormalized form of
    /// `entity_type`, including `entity_type` itself.
    pub fn reachable(&self, entity_type: &str) -> Result<BTreeSet<EntityType>> {
        let root = self.get(entity_type)?;
        let mut seen = BTreeSet::from([root.name.clone()]);
        let mut pending = vec![root];
        while let Some(entity) = pending.pop() {
            for relation in &entity.relations {
                if seen.insert(relation.target.clone()) {
                    pending.push(self.get(relation.target.as_str())?);
                }
            }
        }
        Ok(seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cms() -> Schema {
        Schema::builder()
            .entity(EntitySchema::new("user"))
            .entity(EntitySchema::new("folder").relation(Relation::many("pages", "page").stored_as("pageIds")))
            .entity(
                EntitySchema::new("page")
                    .relation(Relation::one("folder", "folder").stored_as("folderId"))
                    .relation(Relation::one("editor", "user")),
            )
            .entity(EntitySchema::new("tag"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = cms().get("gizmo").unwrap_err();
        assert_eq!(*err, ErrorKind::UnknownType("gizmo".to_string()));
    }

    #[test]
    fn test_relation_to_undeclared_type_is_rejected() {
        let err = Schema::builder()
            .entity(EntitySchema::new("page").relation(Relation::one("folder", "folder")))
            .build()
            .unwrap_err();
        assert!(matches!(*err, ErrorKind::InvalidSchema(_)));
    }

    #[test]
    fn test_duplicate_declaration_is_rejected() {
        let err = Schema::builder().entity(EntitySchema::new("page")).entity(EntitySchema::new("page")).build();
        assert!(err.is_err());
    }

    #[test]
    fn test_relation_fields_must_be_unique() {
        let err = Schema::builder()
            .entity(EntitySchema::new("user"))
            .entity(
                EntitySchema::new("page")
                    .relation(Relation::one("creator", "user").stored_as("userId"))
                    .relation(Relation::one("editor", "user").stored_as("userId")),
            )
            .build();
        assert!(err.is_err());
        let err = Schema::builder()
            .entity(EntitySchema::new("user").relation(Relation::one("id", "user")))
            .build();
        assert!(err.is_err());
    }

    #[test]
    fn test_reachable_follows_relations_transitively() {
        let schema = cms();
        let reachable: Vec<_> = schema.reachable("folder").unwrap().into_iter().collect();
        assert_eq!(reachable, vec![EntityType::from("folder"), EntityType::from("page"), EntityType::from("user")]);
        let reachable: Vec<_> = schema.reachable("tag").unwrap().into_iter().collect();
        assert_eq!(reachable, vec![EntityType::from("tag")]);
    }

    #[test]
    fn test_id_of_honours_custom_id_attribute() {
        let entity = EntitySchema::new("node").id_attribute("uuid");
        assert_eq!(entity.id_of(&json!({"uuid": "a-b"})).unwrap(), EntityId::from("a-b"));
        assert!(entity.id_of(&json!({"id": 1})).is_err());
        assert!(entity.id_of(&json!([1])).is_err());
    }
}
