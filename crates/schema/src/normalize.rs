//! Splitting raw (nested) entity graphs into per-type, id-keyed tables.

use crate::error::Result;
use crate::id::{EntityId, EntityType};
use crate::schema::{Cardinality, EntitySchema, Relation, Schema};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::instrument;

/// Normalized entities grouped by type, then by id.
pub type EntityTables = BTreeMap<EntityType, BTreeMap<EntityId, Value>>;

/// Id(s) of the top-level entity (or entities) that were normalized.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NormalizedResult {
    One(EntityId),
    Many(Vec<EntityId>),
}

impl NormalizedResult {
    pub fn into_ids(self) -> Vec<EntityId> {
        match self {
            Self::One(id) => vec![id],
            Self::Many(ids) => ids,
        }
    }
}

/// Output of [`normalize`].
#[derive(Clone, Debug, PartialEq)]
pub struct Normalized {
    pub entities: EntityTables,
    pub result: NormalizedResult,
}

impl Normalized {
    /// Look up one normalized entity produced by this run.
    pub fn get(&self, entity_type: &str, id: &EntityId) -> Option<&Value> {
        self.entities.get(entity_type).and_then(|table| table.get(id))
    }
}

/// Normalize a raw entity (object) or list of raw entities (array).
///
/// Embedded objects found under a relation's [`key`](Relation::key) are
/// normalized into their own type's table, recursively, and replaced by their
/// id under the relation's [`id_key`](Relation::id_key). Plain ids are kept
/// as they are. When the same entity shows up more than once, the occurrences
/// are shallow-merged (see [`merge_entity`]).
///
/// The input is never modified, and the output only depends on the input.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use strata_schema::{EntityId, EntitySchema, Relation, Schema, normalize};
///
/// let schema = Schema::builder()
///     .entity(EntitySchema::new("folder"))
///     .entity(EntitySchema::new("page").relation(Relation::one("folder", "folder").stored_as("folderId")))
///     .build()
///     .unwrap();
///
/// let raw = json!({"id": 10, "title": "A", "folder": {"id": 1, "name": "Root"}});
/// let normalized = normalize(&schema, "page", &raw).unwrap();
///
/// assert_eq!(normalized.get("page", &EntityId::from(10)), Some(&json!({"id": 10, "title": "A", "folderId": 1})));
/// assert_eq!(normalized.get("folder", &EntityId::from(1)), Some(&json!({"id": 1, "name": "Root"})));
/// ```
#[instrument(level = "trace", skip(schema, input))]
pub fn normalize(schema: &Schema, entity_type: &str, input: &Value) -> Result<Normalized> {
    let entity = schema.get(entity_type)?;
    let mut entities = EntityTables::new();
    let result = match input {
        Value::Array(items) => NormalizedResult::Many(
            items.iter().map(|item| visit(schema, entity, item, &mut entities)).collect::<Result<Vec<_>>>()?,
        ),
        item => NormalizedResult::One(visit(schema, entity, item, &mut entities)?),
    };
    Ok(Normalized { entities, result })
}

/// Shallow merge: fields of `patch` overwrite fields of `base`; fields only
/// present in `base` survive. Non-object values are replaced wholesale.
pub fn merge_entity(base: &Value, patch: &Value) -> Value {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            let mut merged = base.clone();
            merged.extend(patch.iter().map(|(key, value)| (key.clone(), value.clone())));
            Value::Object(merged)
        },
        _ => patch.clone(),
    }
}

fn visit(schema: &Schema, entity: &EntitySchema, raw: &Value, out: &mut EntityTables) -> Result<EntityId> {
    let id = entity.id_of(raw)?;
    let mut object: Map<String, Value> = raw.as_object().cloned().unwrap_or_default();
    for relation in entity.relations() {
        let target = schema.get(relation.target().as_str())?;
        match object.remove(relation.key()) {
            Some(embedded) => {
                let reference = normalize_reference(schema, entity, target, relation, embedded, out)?;
                object.insert(relation.id_key().to_string(), reference);
            },
            None => {
                if let Some(existing) = object.get(relation.id_key()) {
                    validate_ids(entity, relation, existing)?;
                }
            },
        }
    }
    let table = out.entry(entity.name().clone()).or_default();
    let normalized = Value::Object(object);
    let normalized = match table.get(&id) {
        Some(previous) => merge_entity(previous, &normalized),
        None => normalized,
    };
    table.insert(id.clone(), normalized);
    Ok(id)
}

fn normalize_reference(
    schema: &Schema,
    owner: &EntitySchema,
    target: &EntitySchema,
    relation: &Relation,
    value: Value,
    out: &mut EntityTables,
) -> Result<Value> {
    let mut single = |value: Value| -> Result<Value> {
        match value {
            Value::Object(_) => Ok(visit(schema, target, &value, out)?.into()),
            scalar => match EntityId::from_value(&scalar) {
                Some(_) => Ok(scalar),
                None => exn::bail!(owner.invalid_reference(relation.key())),
            },
        }
    };
    match (relation.cardinality(), value) {
        (_, Value::Null) => Ok(Value::Null),
        (Cardinality::Many, Value::Array(items)) => {
            Ok(Value::Array(items.into_iter().map(&mut single).collect::<Result<Vec<_>>>()?))
        },
        (Cardinality::Many, _) | (Cardinality::One, Value::Array(_)) => {
            exn::bail!(owner.invalid_reference(relation.key()))
        },
        (Cardinality::One, value) => single(value),
    }
}

fn validate_ids(owner: &EntitySchema, relation: &Relation, value: &Value) -> Result<()> {
    let valid = match (relation.cardinality(), value) {
        (_, Value::Null) => true,
        (Cardinality::Many, Value::Array(items)) => items.iter().all(|item| EntityId::from_value(item).is_some()),
        (Cardinality::Many, _) => false,
        (Cardinality::One, value) => EntityId::from_value(value).is_some(),
    };
    match valid {
        true => Ok(()),
        false => exn::bail!(owner.invalid_reference(relation.id_key())),
    }
}
