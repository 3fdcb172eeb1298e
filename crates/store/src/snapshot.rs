//! Immutable views of the whole store.

use crate::error::{ErrorKind, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use strata_schema::{EntityId, EntitySource, EntityTables, EntityType, Schema, merge_entity};

/// All entities of one type, keyed by id, in normalized form.
pub type Branch = BTreeMap<EntityId, Arc<Value>>;

/// The complete store contents at one point in time.
///
/// Snapshots are never modified. A mutation builds a new snapshot that shares
/// every untouched branch (and every untouched entity within a touched branch)
/// with its predecessor, so consumers detect changes by comparing [`Arc`]s.
#[derive(Clone, Debug)]
pub struct Snapshot {
    version: u64,
    branches: BTreeMap<EntityType, Arc<Branch>>,
}

impl Snapshot {
    pub(crate) fn empty(schema: &Schema) -> Self {
        let branches = schema.types().map(|entity_type| (entity_type.clone(), Arc::default())).collect();
        Self { version: 0, branches }
    }

    /// Incremented once per published mutation; starts at `0`.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Fails with [`ErrorKind::UnknownBranch`] for types missing from the schema.
    pub fn branch(&self, entity_type: &str) -> Result<&Arc<Branch>> {
        match self.branches.get(entity_type) {
            Some(branch) => Ok(branch),
            None => exn::bail!(ErrorKind::UnknownBranch(entity_type.to_string())),
        }
    }

    pub fn get(&self, entity_type: &str, id: &EntityId) -> Option<&Arc<Value>> {
        self.branches.get(entity_type).and_then(|branch| branch.get(id))
    }

    pub fn branches(&self) -> impl Iterator<Item = (&EntityType, &Arc<Branch>)> {
        self.branches.iter()
    }

    pub(crate) fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Shallow-merge normalized entities into the snapshot.
    ///
    /// Every branch is checked before anything is applied, so an unknown
    /// branch leaves the store untouched. Returns `None` when the merge would
    /// not change anything: entities that come out deeply equal to what is
    /// already stored keep their existing allocation.
    pub(crate) fn merged(&self, entities: EntityTables) -> Result<Option<Self>> {
        for entity_type in entities.keys() {
            self.branch(entity_type.as_str())?;
        }
        let mut branches = self.branches.clone();
        let mut changed = false;
        for (entity_type, table) in entities {
            let current = self.branch(entity_type.as_str())?;
            let mut next: Option<Branch> = None;
            for (id, incoming) in table {
                let merged = match current.get(&id) {
                    Some(existing) => {
                        let merged = merge_entity(existing, &incoming);
                        if merged == **existing {
                            continue;
                        }
                        merged
                    },
                    None => incoming,
                };
                next.get_or_insert_with(|| (**current).clone()).insert(id, Arc::new(merged));
            }
            if let Some(next) = next {
                branches.insert(entity_type, Arc::new(next));
                changed = true;
            }
        }
        Ok(changed.then(|| Self { version: self.version, branches }))
    }

    pub(crate) fn without(&self, entity_type: &str, ids: &[EntityId]) -> Result<Option<Self>> {
        let current = self.branch(entity_type)?;
        if !ids.iter().any(|id| current.contains_key(id)) {
            return Ok(None);
        }
        let mut next = (**current).clone();
        for id in ids {
            next.remove(id);
        }
        Ok(Some(self.replacing(entity_type, next)))
    }

    pub(crate) fn cleared(&self, entity_type: &str) -> Result<Option<Self>> {
        match self.branch(entity_type)?.is_empty() {
            true => Ok(None),
            false => Ok(Some(self.replacing(entity_type, Branch::new()))),
        }
    }

    fn replacing(&self, entity_type: &str, branch: Branch) -> Self {
        let mut branches = self.branches.clone();
        if let Some(slot) = branches.get_mut(entity_type) {
            *slot = Arc::new(branch);
        }
        Self { version: self.version, branches }
    }
}

impl EntitySource for Snapshot {
    fn entity(&self, entity_type: &str, id: &EntityId) -> Option<&Arc<Value>> {
        self.get(entity_type, id)
    }
}
