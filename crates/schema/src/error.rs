//! Schema Error Types
//!
//! This module provides structured errors using `exn` for automatic location
//! tracking and error tree construction.

use derive_more::{Display, Error};

/// A schema error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for schema, normalization and denormalization operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
/// Everything here is a programming or payload error: the same input will fail
/// the same way every time.
#[derive(Debug, Display, Error, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The entity type was never declared in the [`Schema`](crate::Schema).
    #[display("unknown entity type: {_0}")]
    UnknownType(#[error(not(source))] String),
    /// The schema definition itself is inconsistent (duplicate type, relation
    /// pointing at an undeclared type, ...).
    #[display("invalid schema: {_0}")]
    InvalidSchema(#[error(not(source))] String),
    /// A raw or normalized entity is not an object, or has no usable id.
    #[display("invalid {entity_type} entity: {reason}")]
    InvalidEntity {
        /// Type the entity was expected to be.
        entity_type: String,
        /// What was wrong with it.
        reason: &'static str,
    },
    /// A relation field holds something that is neither an id, an embedded
    /// entity nor (for to-many relations) an array of those.
    #[display("invalid reference in {entity_type}.{field}")]
    InvalidReference {
        /// Type of the entity holding the reference.
        entity_type: String,
        /// Name of the offending field.
        field: String,
    },
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::UnknownType("gizmo".to_string()).to_string(), "unknown entity type: gizmo");
        assert_eq!(
            ErrorKind::InvalidEntity { entity_type: "page".to_string(), reason: "missing id" }.to_string(),
            "invalid page entity: missing id"
        );
        assert_eq!(
            ErrorKind::InvalidReference { entity_type: "folder".to_string(), field: "pageIds".to_string() }
                .to_string(),
            "invalid reference in folder.pageIds"
        );
    }

    #[test]
    fn nothing_is_retryable() {
        assert!(!ErrorKind::UnknownType("x".to_string()).is_retryable());
        assert!(!ErrorKind::InvalidSchema("x".to_string()).is_retryable());
    }
}
