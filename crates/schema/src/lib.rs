//! Entity schemas and the pure normalize/denormalize functions.
//!
//! Server payloads arrive as nested JSON graphs (a folder embedding its pages,
//! each page embedding its editor, ...). This crate:
//!
//! - describes which fields of which entity type reference which other types
//!   ([`Schema`], [`EntitySchema`], [`Relation`]);
//! - splits a nested graph into flat, id-keyed tables ([`normalize`]);
//! - expands a normalized entity back into a graph against any
//!   [`EntitySource`] ([`denormalize`]), tolerating entities that haven't been
//!   loaded yet.
//!
//! Nothing here holds state; the store and the caches live in other crates.

mod denormalize;
pub mod error;
mod id;
mod normalize;
mod schema;

pub use crate::denormalize::{
    DenormalizedEntity, EntitySource, Expanded, Overlay, Reference, SourceTables, denormalize,
};
pub use crate::id::{EntityId, EntityType};
pub use crate::normalize::{EntityTables, Normalized, NormalizedResult, merge_entity, normalize};
pub use crate::schema::{Cardinality, DEFAULT_ID_ATTRIBUTE, EntitySchema, Relation, Schema, SchemaBuilder};
