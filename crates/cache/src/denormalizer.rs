use serde_json::Value;
use std::sync::Arc;
use strata_schema::{DenormalizedEntity, EntityId, EntitySource, EntityType, Schema, denormalize};

/// The expansion step of a pass.
///
/// [`SchemaDenormalizer`] is the real thing; the seam exists so that callers
/// can observe or instrument every recomputation a pass performs.
pub trait Denormalize {
    fn denormalize(
        &mut self,
        id: &EntityId,
        normalized: &Arc<Value>,
        source: &dyn EntitySource,
        previous: Option<&DenormalizedEntity>,
    ) -> strata_schema::error::Result<Arc<DenormalizedEntity>>;
}

/// Expands the entities of one branch with [`denormalize`].
#[derive(Clone, Debug)]
pub struct SchemaDenormalizer {
    schema: Arc<Schema>,
    entity_type: EntityType,
}

impl SchemaDenormalizer {
    pub fn new(schema: Arc<Schema>, entity_type: EntityType) -> Self {
        Self { schema, entity_type }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }
}

impl Denormalize for SchemaDenormalizer {
    fn denormalize(
        &mut self,
        _id: &EntityId,
        normalized: &Arc<Value>,
        source: &dyn EntitySource,
        previous: Option<&DenormalizedEntity>,
    ) -> strata_schema::error::Result<Arc<DenormalizedEntity>> {
        denormalize(&self.schema, self.entity_type.as_str(), normalized, source, previous)
    }
}
