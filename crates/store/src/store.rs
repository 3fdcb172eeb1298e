use crate::error::Result;
use crate::snapshot::Snapshot;
use std::sync::Arc;
use strata_schema::{EntityId, EntityTables, Schema};
use tokio::sync::watch;
use tracing::instrument;

/// The process-wide normalized entity store.
///
/// Holds the current [`Snapshot`] in a [`watch`] channel. Mutations are
/// serialized by the channel: each one reads the current snapshot, derives
/// its successor and publishes it in a single step, so readers only ever see
/// complete snapshots and mutations apply in call order. Mutations that change
/// nothing publish nothing, and subscribers are not woken.
///
/// Share it through a [`StoreHandle`](crate::StoreHandle).
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use std::sync::Arc;
/// use strata_schema::{EntityId, EntitySchema, Schema, normalize};
/// use strata_store::Store;
///
/// let schema = Arc::new(Schema::builder().entity(EntitySchema::new("user")).build().unwrap());
/// let store = Store::new(Arc::clone(&schema));
///
/// let normalized = normalize(&schema, "user", &json!({"id": 1, "login": "admin"})).unwrap();
/// assert!(store.merge(normalized.entities).unwrap());
/// assert_eq!(store.snapshot().get("user", &EntityId::from(1)).unwrap()["login"], "admin");
/// ```
#[derive(Debug)]
pub struct Store {
    schema: Arc<Schema>,
    sender: watch::Sender<Arc<Snapshot>>,
}

impl Store {
    /// Create a store with one empty branch per type declared in `schema`.
    pub fn new(schema: Arc<Schema>) -> Self {
        let snapshot = Arc::new(Snapshot::empty(&schema));
        Self { schema, sender: watch::Sender::new(snapshot) }
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&self.sender.borrow())
    }

    /// Watch for new snapshots. The receiver starts out having seen the
    /// current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Snapshot>> {
        self.sender.subscribe()
    }

    /// Shallow-merge normalized entities, atomically.
    ///
    /// Either every table is merged, or (on an unknown branch) none is.
    /// Returns whether a new snapshot was published.
    ///
    /// An entity whose merge result is deeply equal to what is stored keeps
    /// its stored `Arc`. Deep and reference equality for single-entity
    /// watchers therefore only disagree after a delete followed by a re-add.
    #[instrument(skip_all, fields(branches = entities.len()))]
    pub fn merge(&self, entities: EntityTables) -> Result<bool> {
        self.mutate(|snapshot| snapshot.merged(entities))
    }

    /// Remove entities by id. Ids that aren't stored are ignored; an empty
    /// list is a no-op.
    #[instrument(skip(self, ids), fields(count = ids.len()))]
    pub fn delete(&self, entity_type: &str, ids: &[EntityId]) -> Result<bool> {
        self.mutate(|snapshot| snapshot.without(entity_type, ids))
    }

    /// Remove every entity of a branch.
    #[instrument(skip(self))]
    pub fn clear(&self, entity_type: &str) -> Result<bool> {
        self.mutate(|snapshot| snapshot.cleared(entity_type))
    }

    fn mutate(&self, derive: impl FnOnce(&Snapshot) -> Result<Option<Snapshot>>) -> Result<bool> {
        let mut outcome = Ok(false);
        self.sender.send_if_modified(|current| match derive(&**current) {
            Ok(Some(next)) => {
                let version = current.version() + 1;
                *current = Arc::new(next.with_version(version));
                tracing::debug!(version, "Published store snapshot");
                outcome = Ok(true);
                true
            },
            Ok(None) => false,
            Err(err) => {
                outcome = Err(err);
                false
            },
        });
        outcome
    }
}
