//! Expanding normalized entities back into entity graphs.
//!
//! A [`DenormalizedEntity`] keeps the exact normalized [`Arc`] it was built
//! from, and holds every referenced entity as another `Arc<DenormalizedEntity>`.
//! That is what lets callers cheaply answer "is this expansion still current?"
//! ([`DenormalizedEntity::is_current`]) with pointer comparisons only, and lets
//! [`denormalize`] reuse the untouched parts of a previous expansion.
//!
//! An entity reached through several references is expanded once and shared,
//! so an expansion is a graph rather than a tree. Its JSON rendering
//! ([`DenormalizedEntity::to_value`]) still writes each occurrence out.

use crate::error::Result;
use crate::id::{EntityId, EntityType};
use crate::normalize::{EntityTables, merge_entity};
use crate::schema::{Cardinality, EntitySchema, Relation, Schema};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::instrument;

/// Anything normalized entities can be looked up in.
pub trait EntitySource {
    fn entity(&self, entity_type: &str, id: &EntityId) -> Option<&Arc<Value>>;
}

/// Plain in-memory tables, mostly useful for tests and one-off lookups.
pub type SourceTables = BTreeMap<EntityType, BTreeMap<EntityId, Arc<Value>>>;

impl EntitySource for SourceTables {
    fn entity(&self, entity_type: &str, id: &EntityId) -> Option<&Arc<Value>> {
        self.get(entity_type).and_then(|table| table.get(id))
    }
}

/// Entities layered on top of another source.
///
/// Used to denormalize a caller-supplied entity (and whatever it embeds)
/// without writing any of it into the store. Layered entities are
/// shallow-merged over the base's version of the same entity, the same way
/// the store merges incoming entities.
pub struct Overlay<'a> {
    base: &'a dyn EntitySource,
    entities: SourceTables,
}

impl<'a> Overlay<'a> {
    pub fn new(base: &'a dyn EntitySource, entities: EntityTables) -> Self {
        let entities = entities
            .into_iter()
            .map(|(entity_type, table)| {
                let table = table
                    .into_iter()
                    .map(|(id, value)| {
                        let value = match base.entity(entity_type.as_str(), &id) {
                            Some(existing) => merge_entity(existing, &value),
                            None => value,
                        };
                        (id, Arc::new(value))
                    })
                    .collect();
                (entity_type, table)
            })
            .collect();
        Self { base, entities }
    }
}

impl EntitySource for Overlay<'_> {
    fn entity(&self, entity_type: &str, id: &EntityId) -> Option<&Arc<Value>> {
        self.entities.entity(entity_type, id).or_else(|| self.base.entity(entity_type, id))
    }
}

/// One resolved (or unresolvable) reference inside a denormalized entity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reference {
    Resolved(Arc<DenormalizedEntity>),
    /// The referenced entity hasn't been loaded (yet). Not an error: the
    /// caller decides how to present it.
    Missing(EntityId),
    /// The referenced entity was still being expanded further up the path
    /// when this reference was reached; it is left as an id so the expansion
    /// stays finite.
    Cycle(EntityId),
}

impl Reference {
    pub fn id(&self) -> &EntityId {
        match self {
            Self::Resolved(entity) => entity.id(),
            Self::Missing(id) | Self::Cycle(id) => id,
        }
    }

    pub fn resolved(&self) -> Option<&Arc<DenormalizedEntity>> {
        match self {
            Self::Resolved(entity) => Some(entity),
            _ => None,
        }
    }

    fn is_current(
        &self,
        target: &EntityType,
        source: &dyn EntitySource,
        visited: &mut HashSet<*const DenormalizedEntity>,
    ) -> bool {
        match self {
            Self::Resolved(entity) => entity.is_current_within(source, visited),
            Self::Missing(id) => source.entity(target.as_str(), id).is_none(),
            Self::Cycle(_) => true,
        }
    }

    fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Resolved(a), Self::Resolved(b)) => Arc::ptr_eq(a, b),
            (Self::Missing(a), Self::Missing(b)) | (Self::Cycle(a), Self::Cycle(b)) => a == b,
            _ => false,
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Resolved(entity) => entity.to_value(),
            Self::Missing(_) => Value::Null,
            Self::Cycle(id) => id.to_value(),
        }
    }
}

/// Expanded value of one relation field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Expanded {
    Null,
    One(Reference),
    Many(Vec<Reference>),
}

impl Expanded {
    pub fn references(&self) -> &[Reference] {
        match self {
            Self::Null => &[],
            Self::One(reference) => std::slice::from_ref(reference),
            Self::Many(references) => references,
        }
    }

    fn same_as(&self, other: &Self) -> bool {
        let (references, others) = (self.references(), other.references());
        matches!((self, other), (Self::Null, Self::Null) | (Self::One(_), Self::One(_)) | (Self::Many(_), Self::Many(_)))
            && references.len() == others.len()
            && references.iter().zip(others).all(|(a, b)| a.same_as(b))
    }

    fn find(&self, id: &EntityId) -> Option<&Arc<DenormalizedEntity>> {
        self.references().iter().filter_map(Reference::resolved).find(|entity| entity.id() == id)
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Null => Value::Null,
            Self::One(reference) => reference.to_value(),
            Self::Many(references) => Value::Array(references.iter().map(Reference::to_value).collect()),
        }
    }
}

/// An entity with every reference replaced by the referenced entity.
#[derive(Debug, PartialEq, Eq)]
pub struct DenormalizedEntity {
    entity_type: EntityType,
    id: EntityId,
    normalized: Arc<Value>,
    expanded: Vec<(Arc<Relation>, Expanded)>,
}

impl DenormalizedEntity {
    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }

    /// The normalized form this expansion was computed from.
    pub fn normalized(&self) -> &Arc<Value> {
        &self.normalized
    }

    /// A plain (non-relation) field of the entity.
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.normalized.get(name)
    }

    /// The expansion of a relation, by its [`key`](Relation::key). `None` if
    /// the normalized entity didn't carry the relation at all.
    pub fn relation(&self, key: &str) -> Option<&Expanded> {
        self.expanded.iter().find(|(relation, _)| relation.key() == key).map(|(_, expanded)| expanded)
    }

    /// Every resolved entity of a relation, skipping missing and cyclic references.
    pub fn resolved<'a>(&'a self, key: &str) -> impl Iterator<Item = &'a Arc<DenormalizedEntity>> + use<'a> {
        self.relation(key).map(Expanded::references).unwrap_or_default().iter().filter_map(Reference::resolved)
    }

    /// Whether this expansion still reflects `source`.
    ///
    /// True iff the entity's normalized form in `source` is the very same
    /// allocation this was built from, every resolved reference is (recursively)
    /// current, and every missing reference is still missing. Entities shared
    /// between several references are only checked once.
    pub fn is_current(&self, source: &dyn EntitySource) -> bool {
        self.is_current_within(source, &mut HashSet::new())
    }

    fn is_current_within(&self, source: &dyn EntitySource, visited: &mut HashSet<*const Self>) -> bool {
        if !visited.insert(self as *const Self) {
            return true;
        }
        match source.entity(self.entity_type.as_str(), &self.id) {
            Some(current) if Arc::ptr_eq(current, &self.normalized) => {},
            _ => return false,
        }
        for (relation, expanded) in &self.expanded {
            for reference in expanded.references() {
                if !reference.is_current(relation.target(), source, visited) {
                    return false;
                }
            }
        }
        true
    }

    /// Same normalized allocation, and every reference points at the very
    /// same expansion (or is the same missing/cyclic id).
    fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.normalized, &other.normalized)
            && self.expanded.len() == other.expanded.len()
            && self.expanded.iter().zip(&other.expanded).all(|((relation, expanded), (other_relation, other))| {
                relation.key() == other_relation.key() && expanded.same_as(other)
            })
    }

    /// Render the full expansion as JSON.
    ///
    /// Each relation's [`id_key`](Relation::id_key) field is replaced with its
    /// [`key`](Relation::key) field holding the embedded entities. Missing
    /// references become `null`, cyclic ones their bare id.
    pub fn to_value(&self) -> Value {
        let mut value = (*self.normalized).clone();
        if let Value::Object(object) = &mut value {
            for (relation, expanded) in &self.expanded {
                object.remove(relation.id_key());
                object.insert(relation.key().to_string(), expanded.to_value());
            }
        }
        value
    }
}

/// Expand one normalized entity against `source`.
///
/// Referenced entities that `source` doesn't have are represented as
/// [`Reference::Missing`]; a reference back to an entity already on the
/// current expansion path becomes [`Reference::Cycle`]. Only malformed input
/// (not an object, unusable id, malformed reference field) is an error.
///
/// Every referenced entity is expanded at most once per call: later
/// references to it share the same `Arc`, so the result grows with the number
/// of distinct entities reached rather than the number of paths to them.
///
/// When `previous` is an earlier expansion of the same entity, nested entities
/// whose normalized form and references are unchanged are reused as-is rather
/// than rebuilt, so untouched sub-graphs keep their identity.
#[instrument(level = "trace", skip(schema, normalized, source, previous))]
pub fn denormalize(
    schema: &Schema,
    entity_type: &str,
    normalized: &Arc<Value>,
    source: &dyn EntitySource,
    previous: Option<&DenormalizedEntity>,
) -> Result<Arc<DenormalizedEntity>> {
    let entity = schema.get(entity_type)?;
    let mut walk = Walk { schema, source, path: Vec::new(), expanded: HashMap::new() };
    Ok(Arc::new(walk.expand(entity, normalized, previous)?))
}

type Key = (EntityType, EntityId);

struct Walk<'a> {
    schema: &'a Schema,
    source: &'a dyn EntitySource,
    path: Vec<Key>,
    /// Entities fully expanded so far in this call.
    expanded: HashMap<Key, Arc<DenormalizedEntity>>,
}

impl Walk<'_> {
    fn expand(
        &mut self,
        entity: &EntitySchema,
        normalized: &Arc<Value>,
        previous: Option<&DenormalizedEntity>,
    ) -> Result<DenormalizedEntity> {
        let id = entity.id_of(normalized)?;
        self.path.push((entity.name().clone(), id.clone()));
        let mut expanded = Vec::with_capacity(entity.relations().len());
        for relation in entity.relations() {
            let Some(value) = normalized.get(relation.id_key()) else {
                continue;
            };
            let previous = previous.and_then(|previous| previous.relation(relation.key()));
            expanded.push((Arc::clone(relation), self.relation(entity, relation, value, previous)?));
        }
        self.path.pop();
        Ok(DenormalizedEntity { entity_type: entity.name().clone(), id, normalized: Arc::clone(normalized), expanded })
    }

    fn nested(
        &mut self,
        entity: &EntitySchema,
        normalized: &Arc<Value>,
        previous: Option<&Arc<DenormalizedEntity>>,
    ) -> Result<Arc<DenormalizedEntity>> {
        let built = self.expand(entity, normalized, previous.map(|previous| &**previous))?;
        let result = match previous {
            Some(previous) if built.same_as(previous) => Arc::clone(previous),
            _ => Arc::new(built),
        };
        self.expanded.insert((result.entity_type.clone(), result.id.clone()), Arc::clone(&result));
        Ok(result)
    }

    fn relation(
        &mut self,
        owner: &EntitySchema,
        relation: &Relation,
        value: &Value,
        previous: Option<&Expanded>,
    ) -> Result<Expanded> {
        match (relation.cardinality(), value) {
            (_, Value::Null) => Ok(Expanded::Null),
            (Cardinality::Many, Value::Array(ids)) => Ok(Expanded::Many(
                ids.iter()
                    .map(|id| self.reference(owner, relation, id, previous))
                    .collect::<Result<Vec<_>>>()?,
            )),
            (Cardinality::One, id) => Ok(Expanded::One(self.reference(owner, relation, id, previous)?)),
            (Cardinality::Many, _) => exn::bail!(owner.invalid_reference(relation.id_key())),
        }
    }

    fn reference(
        &mut self,
        owner: &EntitySchema,
        relation: &Relation,
        id: &Value,
        previous: Option<&Expanded>,
    ) -> Result<Reference> {
        let Some(id) = EntityId::from_value(id) else {
            exn::bail!(owner.invalid_reference(relation.id_key()));
        };
        let key = (relation.target().clone(), id);
        if self.path.contains(&key) {
            return Ok(Reference::Cycle(key.1));
        }
        if let Some(done) = self.expanded.get(&key) {
            return Ok(Reference::Resolved(Arc::clone(done)));
        }
        let source = self.source;
        let Some(current) = source.entity(key.0.as_str(), &key.1) else {
            return Ok(Reference::Missing(key.1));
        };
        let schema = self.schema;
        let target = schema.get(key.0.as_str())?;
        let previous = previous.and_then(|previous| previous.find(&key.1));
        Ok(Reference::Resolved(self.nested(target, current, previous)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::normalize::normalize;
    use crate::schema::{EntitySchema, Relation};
    use serde_json::json;

    fn cms() -> Schema {
        Schema::builder()
            .entity(EntitySchema::new("user"))
            .entity(
                EntitySchema::new("folder")
                    .relation(Relation::many("pages", "page").stored_as("pageIds"))
                    .relation(Relation::one("owner", "user")),
            )
            .entity(
                EntitySchema::new("page")
                    .relation(Relation::one("folder", "folder").stored_as("folderId"))
                    .relation(Relation::one("editor", "user")),
            )
            .build()
            .unwrap()
    }

    fn tables(entries: &[(&str, Value)]) -> SourceTables {
        let schema = cms();
        let mut tables = SourceTables::new();
        for (entity_type, value) in entries {
            let id = schema.get(entity_type).unwrap().id_of(value).unwrap();
            tables.entry(EntityType::from(*entity_type)).or_default().insert(id, Arc::new(value.clone()));
        }
        tables
    }

    fn folder_scenario() -> SourceTables {
        tables(&[
            ("folder", json!({"id": 1, "name": "Root", "pageIds": [10, 11]})),
            ("page", json!({"id": 10, "title": "A", "folderId": 1})),
            ("page", json!({"id": 11, "title": "B", "folderId": 1})),
        ])
    }

    fn lookup(source: &SourceTables, entity_type: &str, id: i64) -> Arc<Value> {
        Arc::clone(source.entity(entity_type, &EntityId::from(id)).unwrap())
    }

    #[test]
    fn test_references_are_expanded() {
        let source = folder_scenario();
        let folder = denormalize(&cms(), "folder", &lookup(&source, "folder", 1), &source, None).unwrap();

        assert_eq!(
            folder.to_value(),
            json!({
                "id": 1,
                "name": "Root",
                "pages": [
                    {"id": 10, "title": "A", "folder": 1},
                    {"id": 11, "title": "B", "folder": 1},
                ],
            })
        );
        let titles: Vec<_> = folder.resolved("pages").map(|page| page.field("title").unwrap().clone()).collect();
        assert_eq!(titles, vec![json!("A"), json!("B")]);
    }

    #[test]
    fn test_back_references_become_cycles() {
        let source = folder_scenario();
        let page = denormalize(&cms(), "page", &lookup(&source, "page", 10), &source, None).unwrap();
        let Some(Expanded::One(Reference::Resolved(folder))) = page.relation("folder") else {
            panic!("folder should resolve");
        };
        let pages = folder.relation("pages").unwrap().references();
        assert_eq!(pages[0], Reference::Cycle(EntityId::from(10)));
        assert!(matches!(pages[1], Reference::Resolved(_)));
    }

    #[test]
    fn test_shared_references_are_expanded_once() {
        let source = tables(&[
            ("folder", json!({"id": 1, "pageIds": [10, 11]})),
            ("page", json!({"id": 10, "editor": "u1"})),
            ("page", json!({"id": 11, "editor": "u1"})),
            ("user", json!({"id": "u1", "login": "admin"})),
        ]);
        let folder = denormalize(&cms(), "folder", &lookup(&source, "folder", 1), &source, None).unwrap();
        let editors: Vec<_> = folder.resolved("pages").flat_map(|page| page.resolved("editor")).collect();
        assert_eq!(editors.len(), 2);
        assert!(Arc::ptr_eq(editors[0], editors[1]));
        assert_eq!(
            folder.to_value(),
            json!({"id": 1, "pages": [
                {"id": 10, "editor": {"id": "u1", "login": "admin"}},
                {"id": 11, "editor": {"id": "u1", "login": "admin"}},
            ]})
        );
    }

    /// `n` users and `n` groups, every user a member of every group.
    fn memberships(n: i64) -> (Schema, SourceTables) {
        let schema = Schema::builder()
            .entity(EntitySchema::new("user").relation(Relation::many("groups", "group").stored_as("groupIds")))
            .entity(EntitySchema::new("group").relation(Relation::many("members", "user").stored_as("memberIds")))
            .build()
            .unwrap();
        let ids: Vec<i64> = (1..=n).collect();
        let mut source = SourceTables::new();
        for (entity_type, key) in [("user", "groupIds"), ("group", "memberIds")] {
            let table = ids.iter().map(|&id| (EntityId::from(id), Arc::new(json!({"id": id, key: ids})))).collect();
            source.insert(EntityType::from(entity_type), table);
        }
        (schema, source)
    }

    /// Distinct expansions reachable from `root`, and the references they hold.
    fn graph_size(root: &Arc<DenormalizedEntity>) -> (usize, usize) {
        let mut seen = HashSet::new();
        let mut references = 0;
        let mut pending = vec![Arc::clone(root)];
        while let Some(entity) = pending.pop() {
            if !seen.insert(Arc::as_ptr(&entity)) {
                continue;
            }
            for (_, expanded) in &entity.expanded {
                references += expanded.references().len();
                pending.extend(expanded.references().iter().filter_map(Reference::resolved).cloned());
            }
        }
        (seen.len(), references)
    }

    #[test]
    fn test_dense_many_to_many_expands_each_entity_once() {
        let n = 12;
        let (schema, source) = memberships(n);
        let user = denormalize(&schema, "user", &lookup(&source, "user", 1), &source, None).unwrap();

        let (entities, references) = graph_size(&user);
        assert_eq!(entities, 2 * n as usize);
        assert_eq!(references, entities * n as usize);
        assert!(user.is_current(&source));

        let again = denormalize(&schema, "user", &lookup(&source, "user", 1), &source, Some(user.as_ref())).unwrap();
        assert!(user.resolved("groups").zip(again.resolved("groups")).all(|(a, b)| Arc::ptr_eq(a, b)));
    }

    #[test]
    fn test_missing_references_are_not_errors() {
        let source = tables(&[("page", json!({"id": 10, "folderId": 99, "editor": "ghost"}))]);
        let page = denormalize(&cms(), "page", &lookup(&source, "page", 10), &source, None).unwrap();
        assert_eq!(page.relation("folder"), Some(&Expanded::One(Reference::Missing(EntityId::from(99)))));
        assert_eq!(page.to_value(), json!({"id": 10, "folder": null, "editor": null}));
    }

    #[test]
    fn test_absent_relations_are_left_out() {
        let source = tables(&[("page", json!({"id": 10, "title": "A"}))]);
        let page = denormalize(&cms(), "page", &lookup(&source, "page", 10), &source, None).unwrap();
        assert!(page.relation("folder").is_none());
        assert_eq!(page.to_value(), json!({"id": 10, "title": "A"}));
    }

    #[test]
    fn test_malformed_reference_is_an_error() {
        let source = tables(&[("folder", json!({"id": 1, "pageIds": 10}))]);
        let err = denormalize(&cms(), "folder", &lookup(&source, "folder", 1), &source, None).unwrap_err();
        assert!(matches!(*err, ErrorKind::InvalidReference { .. }));
    }

    #[test]
    fn test_is_current_tracks_pointer_identity() {
        let mut source = folder_scenario();
        let folder = denormalize(&cms(), "folder", &lookup(&source, "folder", 1), &source, None).unwrap();
        assert!(folder.is_current(&source));

        // Deeply equal, but a different allocation.
        let page = json!({"id": 11, "title": "B", "folderId": 1});
        source.get_mut("page").unwrap().insert(EntityId::from(11), Arc::new(page));
        assert!(!folder.is_current(&source));
    }

    #[test]
    fn test_missing_reference_stops_being_current_once_loaded() {
        let mut source = tables(&[("page", json!({"id": 10, "editor": "u1"}))]);
        let page = denormalize(&cms(), "page", &lookup(&source, "page", 10), &source, None).unwrap();
        assert!(page.is_current(&source));
        source.insert(EntityType::from("user"), tables(&[("user", json!({"id": "u1"}))]).remove("user").unwrap());
        assert!(!page.is_current(&source));
    }

    #[test]
    fn test_previous_expansion_is_reused_where_current() {
        let mut source = folder_scenario();
        let before = denormalize(&cms(), "folder", &lookup(&source, "folder", 1), &source, None).unwrap();

        let page = json!({"id": 10, "title": "A2", "folderId": 1});
        source.get_mut("page").unwrap().insert(EntityId::from(10), Arc::new(page));
        let after =
            denormalize(&cms(), "folder", &lookup(&source, "folder", 1), &source, Some(before.as_ref())).unwrap();

        let before: Vec<_> = before.resolved("pages").collect();
        let after: Vec<_> = after.resolved("pages").collect();
        assert!(!Arc::ptr_eq(before[0], after[0]));
        assert_eq!(after[0].field("title"), Some(&json!("A2")));
        assert!(Arc::ptr_eq(before[1], after[1]));
    }

    #[test]
    fn test_overlay_takes_precedence_over_base() {
        let source = folder_scenario();
        let partial = json!({"id": 12, "title": "Draft", "folder": {"id": 1, "name": "Renamed"}});
        let normalized = normalize(&cms(), "page", &partial).unwrap();
        let overlay = Overlay::new(&source, normalized.entities);
        let page = overlay.entity("page", &EntityId::from(12)).cloned().unwrap();

        let page = denormalize(&cms(), "page", &page, &overlay, None).unwrap();
        let folder = page.resolved("folder").next().unwrap();
        assert_eq!(folder.field("name"), Some(&json!("Renamed")));
        // The folder's pages still come from the base source.
        assert_eq!(folder.resolved("pages").count(), 2);
    }

    #[test]
    fn test_round_trip() {
        let schema = cms();
        let raw = json!({
            "id": 1,
            "name": "Root",
            "owner": {"id": "u1", "login": "admin"},
            "pages": [
                {"id": 10, "title": "A", "editor": {"id": "u2", "login": "jo"}},
                {"id": 11, "title": "B", "editor": {"id": "u1", "login": "admin"}},
            ],
        });
        let normalized = normalize(&schema, "folder", &raw).unwrap();
        let empty = SourceTables::new();
        let overlay = Overlay::new(&empty, normalized.entities);
        let folder = overlay.entity("folder", &EntityId::from(1)).cloned().unwrap();

        let folder = denormalize(&schema, "folder", &folder, &overlay, None).unwrap();
        assert_eq!(folder.to_value(), raw);
    }
}
