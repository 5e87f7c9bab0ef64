//! Key paths - the field (or ordered field list) identifying a record's key.

use crate::error::Error;
use rkyv::{Archive, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// The field or ordered field list identifying a record's primary key
/// within a store, or the indexed value within an index.
///
/// A path segment may be dotted (`"author.id"`) to navigate into nested
/// documents. Key paths are immutable once the owning store is created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Archive, Serialize, Deserialize)]
pub enum KeyPath {
    /// A single field.
    Single(String),
    /// An ordered list of fields forming a composite key.
    Composite(Vec<String>),
}

impl KeyPath {
    /// Key path over a single field.
    pub fn single(field: impl Into<String>) -> Self {
        KeyPath::Single(field.into())
    }

    /// Key path over an ordered list of fields.
    pub fn composite<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        KeyPath::Composite(fields.into_iter().map(Into::into).collect())
    }

    /// Extract the key value this path identifies within `doc`.
    ///
    /// A composite path yields an array of the component values, in path
    /// order. Returns `None` if any referenced field is absent, so callers
    /// can distinguish "not indexable" from a malformed document.
    pub fn extract(&self, doc: &Value) -> Option<Value> {
        match self {
            KeyPath::Single(field) => lookup(doc, field).cloned(),
            KeyPath::Composite(fields) => {
                let mut parts = Vec::with_capacity(fields.len());
                for field in fields {
                    parts.push(lookup(doc, field)?.clone());
                }
                Some(Value::Array(parts))
            }
        }
    }

    /// Extract the key value, failing if any referenced field is absent.
    pub fn extract_required(&self, doc: &Value) -> Result<Value, Error> {
        self.extract(doc)
            .ok_or_else(|| Error::InvalidKey(format!("document has no value at key path '{self}'")))
    }
}

impl fmt::Display for KeyPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyPath::Single(field) => write!(f, "{field}"),
            KeyPath::Composite(fields) => write!(f, "[{}]", fields.join(", ")),
        }
    }
}

/// Navigate a dotted field path into a document.
fn lookup<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_single_extract() {
        let doc = json!({ "id": 42, "name": "alice" });
        let key = KeyPath::single("id").extract(&doc);
        assert_eq!(key, Some(json!(42)));
    }

    #[test]
    fn test_dotted_extract() {
        let doc = json!({ "author": { "id": "u1" } });
        let key = KeyPath::single("author.id").extract(&doc);
        assert_eq!(key, Some(json!("u1")));
    }

    #[test]
    fn test_composite_extract_preserves_order() {
        let doc = json!({ "year": 2024, "slug": "hello" });
        let key = KeyPath::composite(["year", "slug"]).extract(&doc);
        assert_eq!(key, Some(json!([2024, "hello"])));
    }

    #[test]
    fn test_missing_field_yields_none() {
        let doc = json!({ "id": 1 });
        assert!(KeyPath::single("missing").extract(&doc).is_none());
        assert!(KeyPath::composite(["id", "missing"]).extract(&doc).is_none());
    }

    #[test]
    fn test_extract_required_error_names_path() {
        let doc = json!({});
        let err = KeyPath::single("id").extract_required(&doc).unwrap_err();
        assert!(err.to_string().contains("id"));
    }

    #[test]
    fn test_deep_equality() {
        assert_eq!(KeyPath::single("id"), KeyPath::single("id"));
        assert_ne!(KeyPath::single("id"), KeyPath::single("uuid"));
        assert_ne!(
            KeyPath::composite(["a", "b"]),
            KeyPath::composite(["b", "a"])
        );
        assert_ne!(KeyPath::single("a"), KeyPath::composite(["a"]));
    }

    #[test]
    fn test_display() {
        assert_eq!(KeyPath::single("id").to_string(), "id");
        assert_eq!(KeyPath::composite(["a", "b"]).to_string(), "[a, b]");
    }
}
