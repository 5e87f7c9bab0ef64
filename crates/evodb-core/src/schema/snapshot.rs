//! Existing-schema snapshots read back from persisted structural metadata.

use super::StoreSchema;
use crate::error::Error;
use crate::storage::{RESERVED_PREFIX, STORE_META_PREFIX};
use std::collections::BTreeMap;

/// Canonical snapshot of the schema a database currently persists:
/// store name to (key path, indexes).
///
/// Snapshots are recomputed on every open from a short-lived probing
/// handle and discarded after use. Reading never mutates state; the
/// probing handle is dropped immediately after conversion, never
/// committed. Reserved stores (the migration ledger and backup stores,
/// identified by the `__` name prefix) are excluded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaSnapshot {
    stores: BTreeMap<String, StoreSchema>,
}

impl SchemaSnapshot {
    /// An empty snapshot (no prior database).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Read the persisted structural metadata of a database.
    pub(crate) fn read(db: &sled::Db) -> Result<Self, Error> {
        let meta = db.open_tree(crate::storage::META_TREE)?;
        let mut snapshot = SchemaSnapshot::empty();

        for entry in meta.scan_prefix(STORE_META_PREFIX.as_bytes()) {
            let (key, value) = entry?;
            let name = std::str::from_utf8(&key[STORE_META_PREFIX.len()..])
                .map_err(|e| Error::Deserialization(e.to_string()))?;
            if name.starts_with(RESERVED_PREFIX) {
                continue;
            }
            snapshot.insert(StoreSchema::from_bytes(&value)?);
        }

        Ok(snapshot)
    }

    /// Add a store to the snapshot.
    pub fn insert(&mut self, store: StoreSchema) {
        self.stores.insert(store.name.clone(), store);
    }

    /// Get a store's schema by name.
    pub fn get(&self, name: &str) -> Option<&StoreSchema> {
        self.stores.get(name)
    }

    /// Whether the snapshot contains a store.
    pub fn contains(&self, name: &str) -> bool {
        self.stores.contains_key(name)
    }

    /// Store names in sorted order.
    pub fn store_names(&self) -> impl Iterator<Item = &str> {
        self.stores.keys().map(String::as_str)
    }

    /// Iterate stores in sorted name order.
    pub fn iter(&self) -> impl Iterator<Item = &StoreSchema> {
        self.stores.values()
    }

    /// Number of stores in the snapshot.
    pub fn len(&self) -> usize {
        self.stores.len()
    }

    /// Whether the snapshot has no stores.
    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }
}
