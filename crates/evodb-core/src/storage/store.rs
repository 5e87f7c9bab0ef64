//! Record storage and index maintenance for a single store.
//!
//! Each store maps to one sled data tree plus one tree per index. The
//! low-level document functions are shared by [`StoreHandle`] (normal
//! reads and writes) and upgrade-transaction commit (structural changes
//! and migration writes), so index maintenance is identical on both
//! paths.

use crate::error::Error;
use crate::schema::{IndexDefinition, StoreSchema};
use crate::storage::value_codec::encode_key;
use serde_json::Value;
use tracing::debug;

/// Sled tree holding a store's records, keyed by encoded primary key.
pub(crate) fn data_tree_name(store: &str) -> String {
    format!("data:{store}")
}

/// Sled tree holding one index's entries.
pub(crate) fn index_tree_name(store: &str, index: &str) -> String {
    format!("index:{store}:{index}")
}

pub(crate) fn encode_document(doc: &Value) -> Result<Vec<u8>, Error> {
    serde_json::to_vec(doc).map_err(|e| Error::Serialization(e.to_string()))
}

pub(crate) fn decode_document(bytes: &[u8]) -> Result<Value, Error> {
    serde_json::from_slice(bytes).map_err(|e| Error::Deserialization(e.to_string()))
}

/// Extract and encode a document's primary key.
pub(crate) fn primary_key_bytes(schema: &StoreSchema, doc: &Value) -> Result<Vec<u8>, Error> {
    let key = schema.key_path.extract_required(doc)?;
    encode_key(&key)
}

/// Encoded values a document contributes to an index. A multi-entry
/// index over an array value fans out to one value per element;
/// documents lacking the index key path, or holding a value that is not
/// a valid key, contribute nothing.
pub(crate) fn index_key_values(index: &IndexDefinition, doc: &Value) -> Vec<Vec<u8>> {
    let Some(value) = index.key_path.extract(doc) else {
        return Vec::new();
    };

    let values: Vec<&Value> = match (&value, index.multi_entry) {
        (Value::Array(items), true) => items.iter().collect(),
        _ => vec![&value],
    };

    values.iter().filter_map(|v| encode_key(v).ok()).collect()
}

/// Index entry keys for a document: `encode(value) ++ 0x00 ++ pk`.
///
/// The codec is prefix-free, so `encode(value) ++ 0x00` is a sound scan
/// prefix.
fn index_entry_keys(index: &IndexDefinition, doc: &Value, pk: &[u8]) -> Vec<Vec<u8>> {
    index_key_values(index, doc)
        .into_iter()
        .map(|mut encoded| {
            encoded.push(0);
            encoded.extend_from_slice(pk);
            encoded
        })
        .collect()
}

fn remove_index_entries(
    db: &sled::Db,
    store: &str,
    index: &IndexDefinition,
    doc: &Value,
    pk: &[u8],
) -> Result<(), Error> {
    let tree = db.open_tree(index_tree_name(store, &index.name))?;
    for entry_key in index_entry_keys(index, doc, pk) {
        tree.remove(entry_key)?;
    }
    Ok(())
}

fn insert_index_entries(
    db: &sled::Db,
    store: &str,
    index: &IndexDefinition,
    doc: &Value,
    pk: &[u8],
) -> Result<(), Error> {
    let tree = db.open_tree(index_tree_name(store, &index.name))?;
    for entry_key in index_entry_keys(index, doc, pk) {
        if index.unique {
            // Entry keys embed the primary key, so a different record
            // under the same value prefix is a violation.
            let prefix = &entry_key[..entry_key.len() - pk.len()];
            for existing in tree.scan_prefix(prefix) {
                let (_, existing_pk) = existing?;
                if existing_pk.as_ref() != pk {
                    return Err(Error::ConstraintViolation {
                        store: store.to_string(),
                        index: index.name.clone(),
                    });
                }
            }
        }
        tree.insert(entry_key, pk)?;
    }
    Ok(())
}

/// Insert or replace a document, maintaining all index entries.
/// Returns the encoded primary key.
pub(crate) fn put_document(
    db: &sled::Db,
    schema: &StoreSchema,
    doc: &Value,
) -> Result<Vec<u8>, Error> {
    let pk = primary_key_bytes(schema, doc)?;
    let data = db.open_tree(data_tree_name(&schema.name))?;

    let old = match data.get(&pk)? {
        Some(bytes) => Some(decode_document(&bytes)?),
        None => None,
    };

    if let Some(old_doc) = &old {
        for index in &schema.indexes {
            remove_index_entries(db, &schema.name, index, old_doc, &pk)?;
        }
    }
    for index in &schema.indexes {
        insert_index_entries(db, &schema.name, index, doc, &pk)?;
    }

    data.insert(&pk, encode_document(doc)?)?;
    Ok(pk)
}

/// Delete a document by primary key value, cleaning up its index entries.
/// Returns whether a record existed.
pub(crate) fn delete_document(
    db: &sled::Db,
    schema: &StoreSchema,
    key: &Value,
) -> Result<bool, Error> {
    let pk = encode_key(key)?;
    let data = db.open_tree(data_tree_name(&schema.name))?;

    let Some(bytes) = data.get(&pk)? else {
        return Ok(false);
    };
    let doc = decode_document(&bytes)?;
    for index in &schema.indexes {
        remove_index_entries(db, &schema.name, index, &doc, &pk)?;
    }
    data.remove(&pk)?;
    Ok(true)
}

/// All documents in a store, in primary key order.
pub(crate) fn read_all(db: &sled::Db, store: &str) -> Result<Vec<Value>, Error> {
    let data = db.open_tree(data_tree_name(store))?;
    let mut docs = Vec::new();
    for entry in data.iter() {
        let (_, bytes) = entry?;
        docs.push(decode_document(&bytes)?);
    }
    Ok(docs)
}

/// Build an index from scratch over a store's existing records.
pub(crate) fn backfill_index(
    db: &sled::Db,
    schema: &StoreSchema,
    index: &IndexDefinition,
) -> Result<(), Error> {
    debug!(store = %schema.name, index = %index.name, "backfilling index");
    let data = db.open_tree(data_tree_name(&schema.name))?;
    for entry in data.iter() {
        let (pk, bytes) = entry?;
        let doc = decode_document(&bytes)?;
        insert_index_entries(db, &schema.name, index, &doc, &pk)?;
    }
    Ok(())
}

/// A handle for reading and writing records of one store on an open
/// connection.
#[derive(Debug, Clone)]
pub struct StoreHandle {
    pub(crate) db: sled::Db,
    pub(crate) schema: StoreSchema,
}

impl StoreHandle {
    /// The store's name.
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// The store's schema.
    pub fn schema(&self) -> &StoreSchema {
        &self.schema
    }

    /// Insert or replace a document. The primary key is extracted from
    /// the document via the store's key path.
    pub fn put(&self, doc: &Value) -> Result<(), Error> {
        put_document(&self.db, &self.schema, doc)?;
        Ok(())
    }

    /// Fetch a document by primary key value.
    pub fn get(&self, key: &Value) -> Result<Option<Value>, Error> {
        let pk = encode_key(key)?;
        let data = self.db.open_tree(data_tree_name(&self.schema.name))?;
        match data.get(pk)? {
            Some(bytes) => Ok(Some(decode_document(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Delete a document by primary key value. Returns whether a record
    /// existed.
    pub fn delete(&self, key: &Value) -> Result<bool, Error> {
        delete_document(&self.db, &self.schema, key)
    }

    /// All documents, in primary key order.
    pub fn get_all(&self) -> Result<Vec<Value>, Error> {
        read_all(&self.db, &self.schema.name)
    }

    /// Number of documents in the store.
    pub fn count(&self) -> Result<usize, Error> {
        let data = self.db.open_tree(data_tree_name(&self.schema.name))?;
        Ok(data.len())
    }

    /// Fetch all documents whose indexed value equals `value`, in primary
    /// key order within the value.
    pub fn get_by_index(&self, index_name: &str, value: &Value) -> Result<Vec<Value>, Error> {
        let index = self
            .schema
            .index(index_name)
            .ok_or_else(|| Error::StoreNotFound(format!("{}.{index_name}", self.schema.name)))?;

        let mut prefix = encode_key(value)?;
        prefix.push(0);

        let tree = self
            .db
            .open_tree(index_tree_name(&self.schema.name, &index.name))?;
        let data = self.db.open_tree(data_tree_name(&self.schema.name))?;

        let mut docs = Vec::new();
        for entry in tree.scan_prefix(prefix) {
            let (_, pk) = entry?;
            if let Some(bytes) = data.get(&pk)? {
                docs.push(decode_document(&bytes)?);
            }
        }
        Ok(docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{IndexDefinition, KeyPath};
    use serde_json::json;

    fn handle(dir: &tempfile::TempDir, schema: StoreSchema) -> StoreHandle {
        StoreHandle {
            db: sled::open(dir.path()).unwrap(),
            schema,
        }
    }

    #[test]
    fn test_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        let store = handle(&dir, StoreSchema::new("users", KeyPath::single("id")));

        let alice = json!({ "id": 1, "name": "alice" });
        store.put(&alice).unwrap();
        assert_eq!(store.get(&json!(1)).unwrap(), Some(alice.clone()));
        assert_eq!(store.count().unwrap(), 1);

        // Replace under the same key.
        let alice2 = json!({ "id": 1, "name": "alice2" });
        store.put(&alice2).unwrap();
        assert_eq!(store.get(&json!(1)).unwrap(), Some(alice2));
        assert_eq!(store.count().unwrap(), 1);

        assert!(store.delete(&json!(1)).unwrap());
        assert!(!store.delete(&json!(1)).unwrap());
        assert_eq!(store.get(&json!(1)).unwrap(), None);
    }

    #[test]
    fn test_put_rejects_missing_key() {
        let dir = tempfile::tempdir().unwrap();
        let store = handle(&dir, StoreSchema::new("users", KeyPath::single("id")));

        let err = store.put(&json!({ "name": "no id" })).unwrap_err();
        assert!(matches!(err, Error::InvalidKey(_)));
    }

    #[test]
    fn test_index_lookup_and_update() {
        let dir = tempfile::tempdir().unwrap();
        let store = handle(
            &dir,
            StoreSchema::new("users", KeyPath::single("id"))
                .with_index(IndexDefinition::new("by_city", KeyPath::single("city"))),
        );

        store.put(&json!({ "id": 1, "city": "oslo" })).unwrap();
        store.put(&json!({ "id": 2, "city": "oslo" })).unwrap();
        store.put(&json!({ "id": 3, "city": "bergen" })).unwrap();

        let oslo = store.get_by_index("by_city", &json!("oslo")).unwrap();
        assert_eq!(oslo.len(), 2);

        // Moving a record off the value removes its old entry.
        store.put(&json!({ "id": 2, "city": "bergen" })).unwrap();
        assert_eq!(store.get_by_index("by_city", &json!("oslo")).unwrap().len(), 1);
        assert_eq!(
            store.get_by_index("by_city", &json!("bergen")).unwrap().len(),
            2
        );

        store.delete(&json!(3)).unwrap();
        assert_eq!(
            store.get_by_index("by_city", &json!("bergen")).unwrap().len(),
            1
        );
    }

    #[test]
    fn test_unique_index_violation() {
        let dir = tempfile::tempdir().unwrap();
        let store = handle(
            &dir,
            StoreSchema::new("users", KeyPath::single("id"))
                .with_index(IndexDefinition::new("by_email", KeyPath::single("email")).unique()),
        );

        store.put(&json!({ "id": 1, "email": "a@x" })).unwrap();
        // Re-putting the same record is fine.
        store.put(&json!({ "id": 1, "email": "a@x" })).unwrap();

        let err = store.put(&json!({ "id": 2, "email": "a@x" })).unwrap_err();
        assert!(matches!(
            err,
            Error::ConstraintViolation { ref index, .. } if index == "by_email"
        ));
        assert_eq!(store.get(&json!(2)).unwrap(), None);
    }

    #[test]
    fn test_multi_entry_index_fans_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = handle(
            &dir,
            StoreSchema::new("posts", KeyPath::single("id")).with_index(
                IndexDefinition::new("by_tag", KeyPath::single("tags")).multi_entry(),
            ),
        );

        store
            .put(&json!({ "id": 1, "tags": ["rust", "db"] }))
            .unwrap();
        store.put(&json!({ "id": 2, "tags": ["rust"] })).unwrap();

        assert_eq!(store.get_by_index("by_tag", &json!("rust")).unwrap().len(), 2);
        assert_eq!(store.get_by_index("by_tag", &json!("db")).unwrap().len(), 1);
    }

    #[test]
    fn test_records_without_index_value_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = handle(
            &dir,
            StoreSchema::new("users", KeyPath::single("id"))
                .with_index(IndexDefinition::new("by_city", KeyPath::single("city"))),
        );

        store.put(&json!({ "id": 1 })).unwrap();
        store.put(&json!({ "id": 2, "city": "oslo" })).unwrap();

        assert_eq!(store.count().unwrap(), 2);
        assert_eq!(store.get_by_index("by_city", &json!("oslo")).unwrap().len(), 1);
    }

    #[test]
    fn test_backfill_index() {
        let dir = tempfile::tempdir().unwrap();
        let bare = StoreSchema::new("users", KeyPath::single("id"));
        let store = handle(&dir, bare.clone());
        store.put(&json!({ "id": 1, "city": "oslo" })).unwrap();
        store.put(&json!({ "id": 2, "city": "oslo" })).unwrap();

        let index = IndexDefinition::new("by_city", KeyPath::single("city"));
        let indexed = bare.with_index(index.clone());
        backfill_index(&store.db, &indexed, &index).unwrap();

        let indexed_handle = StoreHandle {
            db: store.db.clone(),
            schema: indexed,
        };
        assert_eq!(
            indexed_handle
                .get_by_index("by_city", &json!("oslo"))
                .unwrap()
                .len(),
            2
        );
    }
}
