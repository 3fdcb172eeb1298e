//! Async building blocks shared by the other crates.
//!
//! - [`Debouncer`]: trailing-edge debounce of work scheduled on Tokio, with
//!   cancel-and-reschedule on every call.
//! - [`StreamDistinctExt`]: drop consecutive duplicates from a [`Stream`](futures::Stream),
//!   by value or with a custom comparison (e.g. pointer identity).

mod debounce;
mod distinct;

pub use crate::debounce::Debouncer;
pub use crate::distinct::{DistinctUntilChanged, StreamDistinctExt};
