use crate::denormalizer::{BranchDenormalizer, DenormalizedStream};
use crate::error::{ErrorKind, Result};
use async_stream::stream;
use exn::{OptionExt, ResultExt};
use futures::{Stream, StreamExt};
use serde_json::Value;
use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use strata_asyncutils::StreamDistinctExt;
use strata_cache::{CacheFactory, MapCache};
use strata_config::{Config, EntityEquality};
use strata_schema::{
    DenormalizedEntity, EntityId, EntitySource, EntityType, Normalized, NormalizedResult, Overlay, Schema,
    denormalize, normalize,
};
use strata_store::{Snapshot, StoreHandle};
use tracing::instrument;

/// A live view that never fails once subscribed.
pub type EntityStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// The one entry point the rest of an application uses to read and write
/// entity data.
///
/// Cheap to clone; clones share the store and every branch subscription.
///
/// # Examples
///
/// ```
/// use futures::StreamExt;
/// use serde_json::json;
/// use std::sync::Arc;
/// use strata_manager::EntityManager;
/// use strata_schema::{EntitySchema, Relation, Schema};
/// use strata_store::Store;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let schema = Schema::builder()
///     .entity(EntitySchema::new("folder").relation(Relation::many("pages", "page").stored_as("pageIds")))
///     .entity(EntitySchema::new("page"))
///     .build()
///     .unwrap();
/// let manager = EntityManager::new(Arc::new(Store::new(Arc::new(schema)))).unwrap();
///
/// manager.add_entity("folder", &json!({"id": 1, "pages": [{"id": 10, "title": "A"}]})).unwrap();
/// let mut folders = manager.watch_denormalized_entities_list("folder").unwrap();
/// let folders = folders.next().await.unwrap().unwrap();
/// assert_eq!(folders[0].to_value(), json!({"id": 1, "pages": [{"id": 10, "title": "A"}]}));
/// # }
/// ```
#[derive(Clone)]
pub struct EntityManager {
    inner: Arc<Inner>,
}

struct Inner {
    store: StoreHandle,
    config: Config,
    denormalizers: BTreeMap<EntityType, BranchDenormalizer>,
}

/// Builder for [`EntityManager`].
pub struct EntityManagerBuilder {
    store: StoreHandle,
    config: Config,
    cache_factory: CacheFactory,
}

impl EntityManagerBuilder {
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// How each branch subscription builds its denormalization cache.
    /// Defaults to [`MapCache::factory`].
    pub fn cache_factory(mut self, factory: CacheFactory) -> Self {
        self.cache_factory = factory;
        self
    }

    pub fn build(self) -> Result<EntityManager> {
        let types: Vec<_> = self.store.schema().types().cloned().collect();
        let denormalizers = types
            .into_iter()
            .map(|entity_type| {
                let denormalizer = BranchDenormalizer::new(
                    Arc::clone(&self.store),
                    entity_type.clone(),
                    Arc::clone(&self.cache_factory),
                    self.config.cleanup_delay(),
                )?;
                Ok((entity_type, denormalizer))
            })
            .collect::<Result<_>>()?;
        let inner = Inner { store: self.store, config: self.config, denormalizers };
        Ok(EntityManager { inner: Arc::new(inner) })
    }
}

impl EntityManager {
    pub fn builder(store: StoreHandle) -> EntityManagerBuilder {
        EntityManagerBuilder { store, config: Config::default(), cache_factory: MapCache::factory() }
    }

    /// A manager with the default configuration and caches.
    pub fn new(store: StoreHandle) -> Result<Self> {
        Self::builder(store).build()
    }

    pub fn store(&self) -> &StoreHandle {
        &self.inner.store
    }

    pub fn schema(&self) -> &Arc<Schema> {
        self.inner.store.schema()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The current store contents, for read-only inspection.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.store.snapshot()
    }

    fn branch(&self, entity_type: &str) -> Result<EntityType> {
        self.schema().entity_type(entity_type).or_raise(|| ErrorKind::UnknownBranch(entity_type.to_string()))
    }

    fn denormalizer(&self, entity_type: &str) -> Result<&BranchDenormalizer> {
        self.inner.denormalizers.get(entity_type).ok_or_raise(|| ErrorKind::UnknownBranch(entity_type.to_string()))
    }

    /// Live view of one entity's normalized form; `None` while it isn't
    /// stored.
    ///
    /// Yields the current value straight away, then again whenever it
    /// changes. Consecutive values that are equal under the configured
    /// [`EntityEquality`] are only yielded once.
    pub fn get_entity(
        &self,
        entity_type: &str,
        id: impl Into<EntityId>,
    ) -> Result<EntityStream<Option<Arc<Value>>>> {
        let entity_type = self.branch(entity_type)?;
        let id = id.into();
        let mut receiver = self.inner.store.subscribe();
        let entities = stream!({
            loop {
                let entity = receiver.borrow_and_update().get(entity_type.as_str(), &id).cloned();
                yield entity;
                if receiver.changed().await.is_err() {
                    return;
                }
            }
        });
        let equality = self.inner.config.entity_equality;
        Ok(entities
            .distinct_until_changed_by(move |a: &Option<Arc<Value>>, b: &Option<Arc<Value>>| match equality {
                EntityEquality::Deep => a == b,
                EntityEquality::Reference => match (a, b) {
                    (Some(a), Some(b)) => Arc::ptr_eq(a, b),
                    (None, None) => true,
                    _ => false,
                },
            })
            .boxed())
    }

    /// Denormalize a caller-supplied, possibly partial entity against the
    /// current snapshot, without storing anything.
    ///
    /// Nested objects in `entity` take precedence over (are shallow-merged
    /// onto) what the store holds for the same ids. Branch caches are
    /// neither consulted nor updated.
    #[instrument(skip(self, entity))]
    pub fn denormalize_entity(&self, entity_type: &str, entity: &Value) -> Result<Arc<DenormalizedEntity>> {
        let entity_type = self.branch(entity_type)?;
        let (normalized, id) = self.normalize_one(&entity_type, entity)?;
        let snapshot = self.snapshot();
        let overlay = Overlay::new(&*snapshot, normalized.entities);
        let root = overlay
            .entity(entity_type.as_str(), &id)
            .cloned()
            .ok_or_raise(|| ErrorKind::Normalize(entity_type.to_string()))?;
        denormalize(self.schema(), entity_type.as_str(), &root, &overlay, None)
            .or_raise(|| ErrorKind::Denormalize(entity_type.to_string()))
    }

    /// Live list of a branch's normalized entities, in id order. Yields
    /// whenever the branch changes.
    pub fn watch_normalized_entities_list(&self, entity_type: &str) -> Result<EntityStream<Vec<Arc<Value>>>> {
        let entity_type = self.branch(entity_type)?;
        let mut receiver = self.inner.store.subscribe();
        let branches = stream!({
            loop {
                let Ok(branch) = receiver.borrow_and_update().branch(entity_type.as_str()).map(Arc::clone) else {
                    return;
                };
                yield branch;
                if receiver.changed().await.is_err() {
                    return;
                }
            }
        });
        Ok(branches.distinct_until_changed_by(Arc::ptr_eq).map(|branch| branch.values().cloned().collect()).boxed())
    }

    /// Live list of a branch's denormalized entities, in id order.
    ///
    /// Every watcher of a branch shares one cache. The list is replayed to
    /// each new watcher straight away; afterwards it is re-derived whenever
    /// the branch, or a branch it references, changes, and yielded only if
    /// at least one entity changed. Unchanged entities keep their identity
    /// across lists. A denormalization failure is yielded once, then the
    /// stream ends.
    pub fn watch_denormalized_entities_list(&self, entity_type: &str) -> Result<DenormalizedStream> {
        Ok(self.denormalizer(entity_type)?.subscribe())
    }

    /// Number of live denormalized watchers of a branch.
    pub fn denormalized_watchers(&self, entity_type: &str) -> Result<usize> {
        Ok(self.denormalizer(entity_type)?.subscribers())
    }

    /// Size of a branch's denormalization cache; `None` while the branch
    /// isn't watched.
    pub fn cached_entities(&self, entity_type: &str) -> Result<Option<usize>> {
        Ok(self.denormalizer(entity_type)?.cached_entries())
    }

    /// Normalize `raw` (a single entity, possibly embedding others) and merge
    /// the result into the store. Returns the entity's id.
    #[instrument(skip(self, raw))]
    pub fn add_entity(&self, entity_type: &str, raw: &Value) -> Result<EntityId> {
        let entity_type = self.branch(entity_type)?;
        let (normalized, id) = self.normalize_one(&entity_type, raw)?;
        self.inner.store.merge(normalized.entities).or_raise(|| ErrorKind::Store)?;
        Ok(id)
    }

    /// Normalize a batch and merge it into the store in one mutation.
    ///
    /// If any element fails to normalize, nothing from the batch is stored.
    /// Batches of at least [`offload_threshold`](Config::offload_threshold)
    /// entities are normalized on Tokio's blocking pool when a runtime is
    /// available. Returns the ids in input order.
    #[instrument(skip(self, raws), fields(count = raws.len()))]
    pub async fn add_entities(&self, entity_type: &str, raws: Vec<Value>) -> Result<Vec<EntityId>> {
        let entity_type = self.branch(entity_type)?;
        let input = Value::Array(raws);
        let offload = input.as_array().is_some_and(|raws| raws.len() >= self.inner.config.offload_threshold);
        let normalized = match tokio::runtime::Handle::try_current() {
            Ok(runtime) if offload => {
                tracing::debug!("Normalizing batch on the blocking pool");
                let schema = Arc::clone(self.schema());
                let target = entity_type.clone();
                runtime
                    .spawn_blocking(move || normalize(&schema, target.as_str(), &input))
                    .await
                    .or_raise(|| ErrorKind::Worker)?
            },
            _ => normalize(self.schema(), entity_type.as_str(), &input),
        }
        .or_raise(|| ErrorKind::Normalize(entity_type.to_string()))?;
        self.inner.store.merge(normalized.entities).or_raise(|| ErrorKind::Store)?;
        Ok(normalized.result.into_ids())
    }

    /// Remove entities by id. Returns whether anything was removed; unknown
    /// ids and an empty list are not errors.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub fn delete_entities(&self, entity_type: &str, ids: &[EntityId]) -> Result<bool> {
        let entity_type = self.branch(entity_type)?;
        self.inner.store.delete(entity_type.as_str(), ids).or_raise(|| ErrorKind::Store)
    }

    /// Empty a whole branch. Returns whether it held anything.
    #[instrument(skip(self))]
    pub fn delete_all_entities_in_branch(&self, entity_type: &str) -> Result<bool> {
        let entity_type = self.branch(entity_type)?;
        self.inner.store.clear(entity_type.as_str()).or_raise(|| ErrorKind::Store)
    }

    fn normalize_one(&self, entity_type: &EntityType, raw: &Value) -> Result<(Normalized, EntityId)> {
        if !raw.is_object() {
            exn::bail!(ErrorKind::Normalize(entity_type.to_string()));
        }
        let normalized = normalize(self.schema(), entity_type.as_str(), raw)
            .or_raise(|| ErrorKind::Normalize(entity_type.to_string()))?;
        let NormalizedResult::One(id) = &normalized.result else {
            exn::bail!(ErrorKind::Normalize(entity_type.to_string()));
        };
        let id = id.clone();
        Ok((normalized, id))
    }
}
