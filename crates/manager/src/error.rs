//! Manager Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction. Errors raised by the schema, store
//! and cache crates are kept as children in the error tree.

use derive_more::{Display, Error};

/// An entity manager error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for entity manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The entity type isn't declared in the schema. A programming error in
    /// the caller; raised at the call site, before anything is subscribed or
    /// modified.
    #[display("unknown branch: {_0}")]
    UnknownBranch(#[error(not(source))] String),
    /// A payload could not be normalized. Nothing from it was stored.
    #[display("could not normalize {_0} payload")]
    Normalize(#[error(not(source))] String),
    /// A stored entity could not be denormalized. Ends every stream watching
    /// the branch; re-subscribe once the data has been fixed.
    #[display("could not denormalize {_0} branch")]
    Denormalize(#[error(not(source))] String),
    /// The store rejected a mutation.
    #[display("store mutation failed")]
    Store,
    /// The background worker normalizing a large batch did not finish.
    #[display("normalization worker failed")]
    Worker,
    /// A tree loader failed to fetch rows.
    #[display("could not load tree rows: {_0}")]
    Load(#[error(not(source))] String),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    ///
    /// Nothing here retries on its own: re-fetching is the caller's call.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Load(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::UnknownBranch("tag".to_string()), "unknown branch: tag", false)]
    #[case(ErrorKind::Normalize("page".to_string()), "could not normalize page payload", false)]
    #[case(ErrorKind::Denormalize("folder".to_string()), "could not denormalize folder branch", false)]
    #[case(ErrorKind::Load("timeout".to_string()), "could not load tree rows: timeout", true)]
    fn test_display_and_retryable(#[case] kind: ErrorKind, #[case] display: &str, #[case] retryable: bool) {
        assert_eq!(kind.to_string(), display);
        assert_eq!(kind.is_retryable(), retryable);
    }
}
