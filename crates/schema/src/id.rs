//! Identifiers for entity types (branches) and entities.

use derive_more::Display;
use serde_json::Value;
use std::borrow::Borrow;
use std::sync::Arc;

/// Name of an entity type, which is also the name of its store branch.
///
/// Cheap to clone; comparisons and hashing behave exactly like the underlying
/// `str`, so maps keyed by `EntityType` can be queried with a plain `&str`.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityType(Arc<str>);

impl EntityType {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}
impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}
impl From<String> for EntityType {
    fn from(name: String) -> Self {
        Self(Arc::from(name))
    }
}
impl Borrow<str> for EntityType {
    fn borrow(&self) -> &str {
        &self.0
    }
}
impl AsRef<str> for EntityType {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of a single entity within its branch.
///
/// Ids come straight from server payloads, which use either integers or
/// strings. The two are never coerced into each other: `1` and `"1"` are
/// different keys. Ordering puts all integers (ascending) before all strings,
/// and is the order every branch listing is emitted in.
#[derive(Clone, Debug, Display, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityId {
    #[display("{_0}")]
    Int(i64),
    #[display("{_0}")]
    Str(String),
}

impl EntityId {
    /// Read an id out of a JSON value.
    ///
    /// Returns `None` for anything that isn't an integer representable as an
    /// `i64` or a string.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_i64().map(Self::Int),
            Value::String(string) => Some(Self::Str(string.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(int) => Value::from(*int),
            Self::Str(string) => Value::from(string.as_str()),
        }
    }
}
impl From<i64> for EntityId {
    fn from(id: i64) -> Self {
        Self::Int(id)
    }
}
impl From<i32> for EntityId {
    fn from(id: i32) -> Self {
        Self::Int(i64::from(id))
    }
}
impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::Str(id.to_string())
    }
}
impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self::Str(id)
    }
}
impl From<EntityId> for Value {
    fn from(id: EntityId) -> Self {
        match id {
            EntityId::Int(int) => Value::from(int),
            EntityId::Str(string) => Value::String(string),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use std::collections::HashMap;

    #[rstest]
    #[case(json!(10), Some(EntityId::Int(10)))]
    #[case(json!(-3), Some(EntityId::Int(-3)))]
    #[case(json!("abc"), Some(EntityId::Str("abc".to_string())))]
    #[case(json!("10"), Some(EntityId::Str("10".to_string())))]
    #[case(json!(1.5), None)]
    #[case(json!(u64::MAX), None)]
    #[case(json!(null), None)]
    #[case(json!(true), None)]
    #[case(json!({"id": 1}), None)]
    fn test_id_from_value(#[case] input: Value, #[case] expected: Option<EntityId>) {
        assert_eq!(EntityId::from_value(&input), expected);
    }

    #[test]
    fn test_int_and_string_ids_never_collide() {
        assert_ne!(EntityId::from(1), EntityId::from("1"));
    }

    #[test]
    fn test_integers_sort_before_strings() {
        let mut ids = vec![EntityId::from("b"), EntityId::from(20), EntityId::from("a"), EntityId::from(3)];
        ids.sort();
        assert_eq!(ids, vec![EntityId::from(3), EntityId::from(20), EntityId::from("a"), EntityId::from("b")]);
    }

    #[test]
    fn test_entity_type_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(EntityType::from("folder"), 1);
        assert_eq!(map.get("folder"), Some(&1));
        assert_eq!(EntityType::from("folder").to_string(), "folder");
    }
}
