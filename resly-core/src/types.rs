use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::pattern::is_valid_rid;

/// A resource reference, serialized as `{"rid": "<resource-id>"}`.
///
/// Embedding a `Ref` in a model, collection, or call result links the
/// containing resource to the referenced one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ref {
    pub rid: String,
}

impl Ref {
    pub fn new(rid: impl Into<String>) -> Self {
        Ref { rid: rid.into() }
    }

    /// Reports whether the reference points to a valid resource ID.
    pub fn is_valid(&self) -> bool {
        is_valid_rid(&self.rid, true)
    }
}

impl From<&str> for Ref {
    fn from(rid: &str) -> Self {
        Ref::new(rid)
    }
}

/// A soft resource reference, serialized as
/// `{"rid": "<resource-id>", "soft": true}`.
///
/// Soft references do not cause the referenced resource to be subscribed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SoftRef {
    pub rid: String,
}

impl SoftRef {
    pub fn new(rid: impl Into<String>) -> Self {
        SoftRef { rid: rid.into() }
    }

    pub fn is_valid(&self) -> bool {
        is_valid_rid(&self.rid, true)
    }
}

impl Serialize for SoftRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeStruct;
        let mut s = serializer.serialize_struct("SoftRef", 2)?;
        s.serialize_field("rid", &self.rid)?;
        s.serialize_field("soft", &true)?;
        s.end()
    }
}

/// The marker value encoding a key deletion in a change event:
/// `{"action": "delete"}`.
pub fn delete_action() -> Value {
    serde_json::json!({"action": "delete"})
}

/// A data value, serialized as `{"data": <value>}`.
///
/// Model values and collection entries are restricted to primitives and
/// references; wrapping a nested structure in a `DataValue` passes it
/// through as opaque data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataValue<T> {
    pub data: T,
}

impl<T> DataValue<T> {
    pub fn new(data: T) -> Self {
        DataValue { data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ref_serializes_to_rid_object() {
        let json = serde_json::to_value(Ref::new("library.book.42")).unwrap();
        assert_eq!(json, serde_json::json!({"rid": "library.book.42"}));
    }

    #[test]
    fn soft_ref_serializes_with_soft_flag() {
        let json = serde_json::to_value(SoftRef::new("library.book.42")).unwrap();
        assert_eq!(json, serde_json::json!({"rid": "library.book.42", "soft": true}));
    }

    #[test]
    fn ref_validity_follows_rid_rules() {
        assert!(Ref::new("library.book.42").is_valid());
        assert!(Ref::new("library.books?limit=10").is_valid());
        assert!(!Ref::new("").is_valid());
        assert!(!Ref::new("library..book").is_valid());
        assert!(!Ref::new("library.book?").is_valid());
    }

    #[test]
    fn delete_action_shape() {
        assert_eq!(delete_action(), serde_json::json!({"action": "delete"}));
    }

    #[test]
    fn data_value_wraps_nested_structures() {
        let v = DataValue::new(serde_json::json!([1, 2, 3]));
        assert_eq!(
            serde_json::to_value(&v).unwrap(),
            serde_json::json!({"data": [1, 2, 3]})
        );
    }
}
