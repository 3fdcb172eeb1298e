//! Shared, reference-counted denormalized views of one branch.

use crate::error::{ErrorKind, Result};
use async_stream::stream;
use exn::ResultExt;
use futures::Stream;
use parking_lot::Mutex;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use strata_asyncutils::Debouncer;
use strata_cache::{BranchCache, CacheFactory, SchemaDenormalizer};
use strata_schema::{DenormalizedEntity, EntityType};
use strata_store::{Branch, Snapshot, StoreHandle};

/// One pass worth of denormalized entities, in branch order.
pub type EntityList = Arc<[Arc<DenormalizedEntity>]>;
/// Live denormalized view of a branch. Ends after yielding an error.
pub type DenormalizedStream = Pin<Box<dyn Stream<Item = Result<EntityList>> + Send>>;

/// Multicasts the denormalized view of one branch to every subscriber.
///
/// The pipeline (cache, generation counter, last emitted list) only exists
/// while at least one stream is alive. The first subscriber builds it with a
/// fresh cache and primes it with one pass; the last one to go drops it,
/// along with any pending cleanup.
///
/// Passes are pulled, not pushed: whichever subscriber first sees a new
/// store snapshot runs the pass under the pipeline lock, and everyone else
/// picks up the list it produced.
#[derive(Clone)]
pub(crate) struct BranchDenormalizer {
    shared: Arc<Shared>,
}

struct Shared {
    entity_type: EntityType,
    /// The watched branch first, followed by every branch it can reach.
    watched: Vec<EntityType>,
    store: StoreHandle,
    factory: CacheFactory,
    state: Mutex<State>,
    cleanup: Mutex<Cleanup>,
}

#[derive(Default)]
struct State {
    subscribers: usize,
    epoch: u64,
    pipeline: Option<Pipeline>,
}

/// Locked before `State` whenever both are needed, never the other way round.
struct Cleanup {
    epoch: u64,
    debouncer: Debouncer,
}

struct Pipeline {
    cache: BranchCache,
    denormalizer: SchemaDenormalizer,
    version: Option<u64>,
    branches: Vec<Arc<Branch>>,
    latest: EntityList,
    emissions: u64,
    failure: Option<ErrorKind>,
}

impl BranchDenormalizer {
    pub(crate) fn new(
        store: StoreHandle,
        entity_type: EntityType,
        factory: CacheFactory,
        cleanup_delay: Duration,
    ) -> Result<Self> {
        let reachable = store
            .schema()
            .reachable(entity_type.as_str())
            .or_raise(|| ErrorKind::UnknownBranch(entity_type.to_string()))?;
        let watched = std::iter::once(entity_type.clone())
            .chain(reachable.into_iter().filter(|reached| *reached != entity_type))
            .collect();
        let shared = Shared {
            entity_type,
            watched,
            store,
            factory,
            state: Mutex::new(State::default()),
            cleanup: Mutex::new(Cleanup { epoch: 0, debouncer: Debouncer::new(cleanup_delay) }),
        };
        Ok(Self { shared: Arc::new(shared) })
    }

    /// Attach a new subscriber. It immediately receives the latest list.
    pub(crate) fn subscribe(&self) -> DenormalizedStream {
        let mut receiver = self.shared.store.subscribe();
        let attachment = Attachment::new(Arc::clone(&self.shared));
        Box::pin(stream!({
            let shared = Arc::clone(&attachment.0);
            let _attachment = attachment;
            let mut seen = 0;
            loop {
                let snapshot = Arc::clone(&receiver.borrow_and_update());
                if let Err(err) = shared.sync(&snapshot) {
                    yield Err(err);
                    return;
                }
                if let Some((emission, list)) = shared.latest_since(seen) {
                    seen = emission;
                    yield Ok(list);
                }
                if receiver.changed().await.is_err() {
                    return;
                }
            }
        }))
    }

    pub(crate) fn subscribers(&self) -> usize {
        self.shared.state.lock().subscribers
    }

    /// Number of cache entries, or `None` while nobody is subscribed.
    pub(crate) fn cached_entries(&self) -> Option<usize> {
        self.shared.state.lock().pipeline.as_ref().map(|pipeline| pipeline.cache.cache().len())
    }
}

impl Shared {
    fn attach(&self) {
        let mut state = self.state.lock();
        state.subscribers += 1;
        if state.subscribers > 1 {
            return;
        }
        state.epoch += 1;
        let mut pipeline = Pipeline {
            cache: BranchCache::new(self.entity_type.clone(), (self.factory)()),
            denormalizer: SchemaDenormalizer::new(Arc::clone(self.store.schema()), self.entity_type.clone()),
            version: None,
            branches: Vec::new(),
            latest: Arc::new([]),
            emissions: 0,
            failure: None,
        };
        // A failing priming pass is recorded on the pipeline and reported to
        // the stream when it is first polled.
        let _ = pipeline.advance(&self.entity_type, &self.watched, &self.store.snapshot());
        state.pipeline = Some(pipeline);
        tracing::debug!(entity_type = %self.entity_type, epoch = state.epoch, "Built denormalization pipeline");
    }

    fn detach(&self) {
        let (epoch, pipeline) = {
            let mut state = self.state.lock();
            state.subscribers = state.subscribers.saturating_sub(1);
            if state.subscribers > 0 {
                return;
            }
            (state.epoch, state.pipeline.take())
        };
        drop(pipeline);
        let mut cleanup = self.cleanup.lock();
        if cleanup.epoch == epoch {
            cleanup.debouncer.cancel();
        }
        tracing::debug!(entity_type = %self.entity_type, epoch, "Tore down denormalization pipeline");
    }

    /// Bring the pipeline up to date with `snapshot`. Idempotent per
    /// snapshot version; fails if the pipeline is (or just became) poisoned.
    fn sync(self: &Arc<Self>, snapshot: &Snapshot) -> Result<()> {
        let epoch = {
            let mut state = self.state.lock();
            let epoch = state.epoch;
            let Some(pipeline) = state.pipeline.as_mut() else {
                return Ok(());
            };
            if !pipeline.advance(&self.entity_type, &self.watched, snapshot)? {
                return Ok(());
            }
            epoch
        };
        self.schedule_cleanup(epoch);
        Ok(())
    }

    fn latest_since(&self, seen: u64) -> Option<(u64, EntityList)> {
        let state = self.state.lock();
        let pipeline = state.pipeline.as_ref()?;
        (pipeline.emissions > seen).then(|| (pipeline.emissions, Arc::clone(&pipeline.latest)))
    }

    fn schedule_cleanup(self: &Arc<Self>, epoch: u64) {
        let shared = Arc::downgrade(self);
        let mut cleanup = self.cleanup.lock();
        cleanup.epoch = epoch;
        cleanup.debouncer.schedule(move || {
            if let Some(shared) = shared.upgrade() {
                shared.evict_stale(epoch);
            }
        });
    }

    /// Evict everything the latest pass didn't see, unless the pipeline the
    /// cleanup was scheduled for has since been torn down.
    fn evict_stale(&self, epoch: u64) {
        let mut state = self.state.lock();
        if state.epoch != epoch {
            return;
        }
        if let Some(pipeline) = state.pipeline.as_mut() {
            let generation = pipeline.cache.generation();
            pipeline.cache.evict_stale(generation);
        }
    }
}

impl Pipeline {
    /// Returns whether a pass ran.
    fn advance(&mut self, entity_type: &EntityType, watched: &[EntityType], snapshot: &Snapshot) -> Result<bool> {
        if let Some(failure) = &self.failure {
            exn::bail!(failure.clone());
        }
        if self.version.is_some_and(|version| version >= snapshot.version()) {
            return Ok(false);
        }
        self.version = Some(snapshot.version());

        let branches = watched
            .iter()
            .map(|watched| snapshot.branch(watched.as_str()).map(Arc::clone))
            .collect::<strata_store::error::Result<Vec<_>>>()
            .or_raise(|| ErrorKind::Store)?;
        if branches.len() == self.branches.len() && branches.iter().zip(&self.branches).all(|(a, b)| Arc::ptr_eq(a, b))
        {
            return Ok(false);
        }
        self.branches = branches;

        let (entities, report) = match self.cache.run_pass(&self.branches[0], snapshot, &mut self.denormalizer) {
            Ok(pass) => pass,
            Err(err) => {
                let err = err.raise(ErrorKind::Denormalize(entity_type.to_string()));
                tracing::warn!(entity_type = %entity_type, error = ?err, "Denormalization pass failed; pipeline is unusable");
                self.failure = Some((*err).clone());
                return Err(err);
            },
        };

        let unchanged = entities.len() == self.latest.len()
            && entities.iter().zip(self.latest.iter()).all(|(a, b)| Arc::ptr_eq(a, b));
        if !unchanged || self.emissions == 0 {
            self.latest = entities.into();
            self.emissions += 1;
        }
        tracing::debug!(
            entity_type = %entity_type,
            version = snapshot.version(),
            generation = report.generation,
            recomputed = report.recomputed,
            reused = report.reused,
            published = !unchanged,
            "Advanced denormalization pipeline"
        );
        Ok(true)
    }
}

/// Keeps a subscriber counted for as long as its stream is alive.
struct Attachment(Arc<Shared>);

impl Attachment {
    fn new(shared: Arc<Shared>) -> Self {
        shared.attach();
        Self(shared)
    }
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.0.detach();
    }
}
