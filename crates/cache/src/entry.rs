use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use strata_schema::{DenormalizedEntity, EntityId};

/// What a [`BranchCache`](crate::BranchCache) remembers about one entity.
#[derive(Clone, Debug)]
pub struct CacheEntry {
    /// The last pass that produced or confirmed this entry.
    pub last_seen_generation: u64,
    /// The normalized form `denormalized_result` was computed from.
    pub normalized_snapshot: Arc<Value>,
    pub denormalized_result: Arc<DenormalizedEntity>,
}

/// Storage for cache entries, keyed by entity id.
///
/// One instance lives exactly as long as the branch subscription that owns
/// it. Implementations only need to behave like a map; every decision about
/// validity and staleness is made by [`BranchCache`](crate::BranchCache).
pub trait DenormalizationCache: Send {
    fn get(&self, id: &EntityId) -> Option<&CacheEntry>;
    fn get_mut(&mut self, id: &EntityId) -> Option<&mut CacheEntry>;
    fn put(&mut self, id: EntityId, entry: CacheEntry);
    fn evict(&mut self, id: &EntityId) -> Option<CacheEntry>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Keep only the entries for which `keep` returns `true`.
    fn retain(&mut self, keep: &mut dyn FnMut(&EntityId, &CacheEntry) -> bool);
    fn clear(&mut self);
}

/// Builds the cache for each new branch subscription.
pub type CacheFactory = Arc<dyn Fn() -> Box<dyn DenormalizationCache> + Send + Sync>;

/// The default, hash map backed cache.
#[derive(Debug, Default)]
pub struct MapCache {
    entries: HashMap<EntityId, CacheEntry>,
}

impl MapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// A factory producing empty [`MapCache`]s.
    pub fn factory() -> CacheFactory {
        Arc::new(|| -> Box<dyn DenormalizationCache> { Box::new(Self::new()) })
    }
}

impl DenormalizationCache for MapCache {
    fn get(&self, id: &EntityId) -> Option<&CacheEntry> {
        self.entries.get(id)
    }

    fn get_mut(&mut self, id: &EntityId) -> Option<&mut CacheEntry> {
        self.entries.get_mut(id)
    }

    fn put(&mut self, id: EntityId, entry: CacheEntry) {
        self.entries.insert(id, entry);
    }

    fn evict(&mut self, id: &EntityId) -> Option<CacheEntry> {
        self.entries.remove(id)
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn retain(&mut self, keep: &mut dyn FnMut(&EntityId, &CacheEntry) -> bool) {
        self.entries.retain(|id, entry| keep(id, entry));
    }

    fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_schema::{EntitySchema, Schema, SourceTables, denormalize};

    fn entry(id: i64, generation: u64) -> CacheEntry {
        let schema = Schema::builder().entity(EntitySchema::new("page")).build().unwrap();
        let normalized = Arc::new(json!({"id": id}));
        let result = denormalize(&schema, "page", &normalized, &SourceTables::new(), None).unwrap();
        CacheEntry { last_seen_generation: generation, normalized_snapshot: normalized, denormalized_result: result }
    }

    #[test]
    fn test_map_cache_behaves_like_a_map() {
        let mut cache = MapCache::factory()();
        assert!(cache.is_empty());
        cache.put(EntityId::from(1), entry(1, 1));
        cache.put(EntityId::from(2), entry(2, 2));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&EntityId::from(1)).unwrap().last_seen_generation, 1);

        cache.get_mut(&EntityId::from(1)).unwrap().last_seen_generation = 3;
        assert_eq!(cache.get(&EntityId::from(1)).unwrap().last_seen_generation, 3);

        assert!(cache.evict(&EntityId::from(2)).is_some());
        assert!(cache.evict(&EntityId::from(2)).is_none());
        assert!(cache.get(&EntityId::from("1")).is_none());

        cache.put(EntityId::from(4), entry(4, 1));
        cache.retain(&mut |_, entry| entry.last_seen_generation > 1);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
