//! Store schemas - the declared structure of a single store.

use super::{IndexDefinition, KeyPath};
use crate::error::Error;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::HashSet;

/// Declared structure of a store: its name, primary key path, and
/// secondary indexes.
///
/// Store schemas are constructed once from static declarations and never
/// mutated afterwards. The key path is immutable once the store has been
/// created; changing it requires an explicit migration.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct StoreSchema {
    /// Store name, unique within a database.
    pub name: String,
    /// Primary key path.
    pub key_path: KeyPath,
    /// Secondary indexes, unique by name within the store.
    pub indexes: Vec<IndexDefinition>,
}

impl StoreSchema {
    /// Create a store schema with no indexes.
    pub fn new(name: impl Into<String>, key_path: KeyPath) -> Self {
        Self {
            name: name.into(),
            key_path,
            indexes: Vec::new(),
        }
    }

    /// Add an index to the store.
    pub fn with_index(mut self, index: IndexDefinition) -> Self {
        self.indexes.push(index);
        self
    }

    /// Get an index definition by name.
    pub fn index(&self, name: &str) -> Option<&IndexDefinition> {
        self.indexes.iter().find(|i| i.name == name)
    }

    /// Check that index names are unique within the store.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for index in &self.indexes {
            if !seen.insert(index.name.as_str()) {
                return Err(Error::DuplicateDefinition {
                    kind: "index",
                    name: format!("{}.{}", self.name, index.name),
                });
            }
        }
        Ok(())
    }

    /// Serialize the schema to bytes for persistence.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a schema from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> StoreSchema {
        StoreSchema::new("users", KeyPath::single("id"))
            .with_index(IndexDefinition::new("by_email", KeyPath::single("email")).unique())
            .with_index(IndexDefinition::new("by_tag", KeyPath::single("tags")).multi_entry())
    }

    #[test]
    fn test_builder() {
        let store = sample_store();
        assert_eq!(store.name, "users");
        assert_eq!(store.indexes.len(), 2);
        assert!(store.index("by_email").is_some());
        assert!(store.index("missing").is_none());
    }

    #[test]
    fn test_validate_rejects_duplicate_index_names() {
        let store = StoreSchema::new("users", KeyPath::single("id"))
            .with_index(IndexDefinition::new("by_email", KeyPath::single("email")))
            .with_index(IndexDefinition::new("by_email", KeyPath::single("alt_email")));

        let err = store.validate().unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateDefinition { kind: "index", .. }
        ));
    }

    #[test]
    fn test_serialization_roundtrip() {
        let store = sample_store();
        let bytes = store.to_bytes().unwrap();
        let decoded = StoreSchema::from_bytes(&bytes).unwrap();
        assert_eq!(store, decoded);
    }
}
