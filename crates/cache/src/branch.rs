use crate::denormalizer::Denormalize;
use crate::entry::{CacheEntry, DenormalizationCache};
use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use std::sync::Arc;
use strata_schema::{DenormalizedEntity, EntitySource, EntityType};
use strata_store::Branch;
use tracing::instrument;

/// Counters for one pass, logged at debug level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassReport {
    pub generation: u64,
    /// Entities denormalized during the pass.
    pub recomputed: usize,
    /// Entities whose cached expansion was still current.
    pub reused: usize,
}

/// Memoized denormalization of one branch.
///
/// An entity is only expanded again when its cached expansion is no longer
/// current: either its own normalized form is a different allocation than the
/// one the expansion was built from, or some entity the expansion reached has
/// since been replaced (or a missing one has arrived). Anything still current
/// is returned as the very same [`Arc`], so consumers can detect change with
/// [`Arc::ptr_eq`].
///
/// Entries of entities that leave the branch are not dropped by the pass
/// itself; call [`evict_stale`](Self::evict_stale) with the generation of the
/// latest pass to reclaim them.
pub struct BranchCache {
    entity_type: EntityType,
    cache: Box<dyn DenormalizationCache>,
    generation: u64,
}

impl BranchCache {
    pub fn new(entity_type: EntityType, cache: Box<dyn DenormalizationCache>) -> Self {
        Self { entity_type, cache, generation: 0 }
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    /// Generation of the latest pass; `0` before the first one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn cache(&self) -> &dyn DenormalizationCache {
        &*self.cache
    }

    /// Denormalize every entity of `branch`, in branch order, reusing
    /// whatever is still current in `source`.
    ///
    /// Expansions that do have to be rebuilt are handed their previous
    /// version, so the parts of it that are still current keep their
    /// identity too. A failing entity aborts the pass; entries already
    /// refreshed by it stay valid.
    #[instrument(skip_all, fields(entity_type = %self.entity_type, entities = branch.len()))]
    pub fn run_pass(
        &mut self,
        branch: &Branch,
        source: &dyn EntitySource,
        denormalizer: &mut dyn Denormalize,
    ) -> Result<(Vec<Arc<DenormalizedEntity>>, PassReport)> {
        self.generation += 1;
        let generation = self.generation;
        let mut report = PassReport { generation, ..PassReport::default() };
        let mut output = Vec::with_capacity(branch.len());

        for (id, normalized) in branch {
            if let Some(entry) = self.cache.get_mut(id).filter(|entry| {
                Arc::ptr_eq(&entry.normalized_snapshot, normalized) && entry.denormalized_result.is_current(source)
            }) {
                entry.last_seen_generation = generation;
                output.push(Arc::clone(&entry.denormalized_result));
                report.reused += 1;
                continue;
            }

            let previous = self.cache.get(id).map(|entry| Arc::clone(&entry.denormalized_result));
            let result = denormalizer.denormalize(id, normalized, source, previous.as_deref()).or_raise(|| {
                ErrorKind::Denormalize { entity_type: self.entity_type.to_string(), id: id.to_string() }
            })?;
            self.cache.put(
                id.clone(),
                CacheEntry {
                    last_seen_generation: generation,
                    normalized_snapshot: Arc::clone(normalized),
                    denormalized_result: Arc::clone(&result),
                },
            );
            output.push(result);
            report.recomputed += 1;
        }

        tracing::debug!(generation, recomputed = report.recomputed, reused = report.reused, "Denormalization pass complete");
        Ok((output, report))
    }

    /// Drop every entry not seen by a pass since `latest_generation`.
    /// Returns how many were dropped.
    pub fn evict_stale(&mut self, latest_generation: u64) -> usize {
        let before = self.cache.len();
        self.cache.retain(&mut |_, entry| entry.last_seen_generation >= latest_generation);
        let evicted = before - self.cache.len();
        tracing::trace!(entity_type = %self.entity_type, latest_generation, evicted, "Evicted stale cache entries");
        evicted
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }
}

impl std::fmt::Debug for BranchCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BranchCache")
            .field("entity_type", &self.entity_type)
            .field("entries", &self.cache.len())
            .field("generation", &self.generation)
            .finish()
    }
}
