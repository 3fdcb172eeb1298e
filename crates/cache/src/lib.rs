//! The branch denormalization cache.
//!
//! Keeps, for every entity of one branch, the expansion last computed for it
//! together with the normalized form it was computed from, and only expands
//! an entity again once that expansion stops being current. The cache itself
//! is a replaceable [`DenormalizationCache`]; [`BranchCache`] holds the pass
//! and eviction logic on top of it.

mod branch;
mod denormalizer;
mod entry;
pub mod error;

pub use crate::branch::{BranchCache, PassReport};
pub use crate::denormalizer::{Denormalize, SchemaDenormalizer};
pub use crate::entry::{CacheEntry, CacheFactory, DenormalizationCache, MapCache};
