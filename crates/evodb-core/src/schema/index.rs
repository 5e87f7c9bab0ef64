//! Index definitions.

use super::KeyPath;
use rkyv::{Archive, Deserialize, Serialize};

/// Definition of a secondary index within a store.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Index name, unique within its store.
    pub name: String,
    /// The field (or ordered field list) the index covers.
    pub key_path: KeyPath,
    /// Whether the index rejects duplicate values.
    pub unique: bool,
    /// Whether an array value fans out into one entry per element.
    pub multi_entry: bool,
}

impl IndexDefinition {
    /// Create a non-unique, single-entry index.
    pub fn new(name: impl Into<String>, key_path: KeyPath) -> Self {
        Self {
            name: name.into(),
            key_path,
            unique: false,
            multi_entry: false,
        }
    }

    /// Mark the index as unique.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Mark the index as multi-entry.
    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }

    /// Whether another definition describes the same physical index
    /// (same key path, uniqueness, and multi-entry behavior).
    pub fn same_shape(&self, other: &IndexDefinition) -> bool {
        self.key_path == other.key_path
            && self.unique == other.unique
            && self.multi_entry == other.multi_entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let idx = IndexDefinition::new("by_email", KeyPath::single("email"));
        assert_eq!(idx.name, "by_email");
        assert!(!idx.unique);
        assert!(!idx.multi_entry);
    }

    #[test]
    fn test_builder_flags() {
        let idx = IndexDefinition::new("by_email", KeyPath::single("email"))
            .unique()
            .multi_entry();
        assert!(idx.unique);
        assert!(idx.multi_entry);
    }

    #[test]
    fn test_same_shape_ignores_name() {
        let a = IndexDefinition::new("a", KeyPath::single("email")).unique();
        let b = IndexDefinition::new("b", KeyPath::single("email")).unique();
        assert!(a.same_shape(&b));

        let c = IndexDefinition::new("a", KeyPath::single("email"));
        assert!(!a.same_shape(&c));
    }
}
