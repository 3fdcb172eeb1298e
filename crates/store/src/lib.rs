//! The normalized entity store.
//!
//! One [`Branch`] per entity type declared in the [`Schema`](strata_schema::Schema),
//! each mapping an id to that entity's normalized form. The store is only ever
//! replaced, never modified in place: every mutation publishes a fresh
//! [`Snapshot`] that shares all untouched branches and entities with the
//! previous one. Identity (`Arc::ptr_eq`) is therefore a reliable and cheap
//! change signal for everything downstream.

pub mod error;
mod snapshot;
mod store;

pub use crate::snapshot::{Branch, Snapshot};
pub use crate::store::Store;
use std::sync::Arc;

pub type StoreHandle = Arc<Store>;
