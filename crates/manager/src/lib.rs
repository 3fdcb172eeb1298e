//! The entity manager: the public surface over the normalized store.
//!
//! Payloads go in through [`EntityManager::add_entity`] and
//! [`EntityManager::add_entities`], are normalized against the store's
//! schema, and merged into the store. Out come live views:
//!
//! - [`get_entity`](EntityManager::get_entity): one entity, normalized;
//! - [`watch_normalized_entities_list`](EntityManager::watch_normalized_entities_list):
//!   a whole branch, normalized;
//! - [`watch_denormalized_entities_list`](EntityManager::watch_denormalized_entities_list):
//!   a whole branch with every reference expanded, shared between all its
//!   watchers and only re-expanding what changed.
//!
//! The [`tree`] module reconciles reloaded hierarchical rows with the rows
//! previously displayed.

mod denormalizer;
pub mod error;
mod manager;
pub mod tree;

pub use crate::denormalizer::{DenormalizedStream, EntityList};
pub use crate::manager::{EntityManager, EntityManagerBuilder, EntityStream};
