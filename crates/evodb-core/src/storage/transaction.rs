//! The privileged upgrade transaction.
//!
//! All structural changes and migration writes happen inside exactly one
//! [`UpgradeTransaction`] per version bump. Operations are staged in an
//! in-memory buffer and applied to sled in a single pass at commit, with
//! the version bump written last and the database flushed afterwards.
//! Aborting discards the buffer, so a failed upgrade leaves the database
//! at its previous version with no partial changes.

use crate::error::Error;
use crate::migration::ledger::{LedgerRecord, MigrationLedger, LEDGER_STORE};
use crate::schema::{IndexDefinition, KeyPath, StoreSchema};
use crate::storage::store::{
    backfill_index, data_tree_name, delete_document, index_key_values, index_tree_name,
    put_document,
};
use crate::storage::value_codec::encode_key;
use crate::storage::{store_meta_key, META_TREE, RESERVED_PREFIX, VERSION_KEY};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// Lifecycle of a single database open with respect to upgrading.
/// Transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradePhase {
    /// No upgrade has begun.
    NotStarted,
    /// The upgrade transaction is running.
    InUpgrade {
        /// Version before the upgrade (0 for a fresh database).
        old_version: u64,
    },
    /// The upgrade committed and the version bump is durable.
    Committed,
    /// The upgrade failed and every staged change was discarded.
    Aborted,
}

#[derive(Debug)]
enum UpgradeOp {
    CreateStore(StoreSchema),
    DeleteStore(String),
    CreateIndex { store: String, index: IndexDefinition },
    DeleteIndex { store: String, index: String },
    Put { store: String, doc: Value },
    Delete { store: String, key: Value },
    AppendLedger(String),
}

/// Staged, buffered transaction over one version bump.
///
/// Reads merge the committed state with the staged buffer, so migration
/// code observes its own writes and the structural changes applied
/// before it.
pub struct UpgradeTransaction {
    db: sled::Db,
    old_version: u64,
    new_version: u64,
    /// Schema view including staged structural changes, reserved stores
    /// included.
    view: BTreeMap<String, StoreSchema>,
    ops: Vec<UpgradeOp>,
    /// Staged record writes per store: encoded primary key to document
    /// (`None` marks a staged delete).
    overlay: HashMap<String, BTreeMap<Vec<u8>, Option<Value>>>,
    /// Stores created in this transaction; their committed trees (from a
    /// prior life of the name) must not leak into reads.
    created: HashSet<String>,
}

impl UpgradeTransaction {
    pub(crate) fn begin(db: sled::Db, old_version: u64, new_version: u64) -> Result<Self, Error> {
        let meta = db.open_tree(META_TREE)?;
        let mut view = BTreeMap::new();
        for entry in meta.scan_prefix(crate::storage::STORE_META_PREFIX.as_bytes()) {
            let (_, value) = entry?;
            let schema = StoreSchema::from_bytes(&value)?;
            view.insert(schema.name.clone(), schema);
        }

        debug!(old_version, new_version, "upgrade transaction started");
        Ok(Self {
            db,
            old_version,
            new_version,
            view,
            ops: Vec::new(),
            overlay: HashMap::new(),
            created: HashSet::new(),
        })
    }

    /// Version before the upgrade (0 for a fresh database).
    pub fn old_version(&self) -> u64 {
        self.old_version
    }

    /// Version this transaction upgrades to.
    pub fn new_version(&self) -> u64 {
        self.new_version
    }

    /// Non-reserved store names visible at this point in the transaction,
    /// sorted.
    pub fn store_names(&self) -> Vec<String> {
        self.view
            .keys()
            .filter(|name| !name.starts_with(RESERVED_PREFIX))
            .cloned()
            .collect()
    }

    /// Schema of a visible store.
    pub fn store_schema(&self, store: &str) -> Option<&StoreSchema> {
        self.view.get(store)
    }

    /// Stage creation of a store.
    pub fn create_store(&mut self, schema: StoreSchema) -> Result<(), Error> {
        if self.view.contains_key(&schema.name) {
            return Err(Error::DuplicateDefinition {
                kind: "store",
                name: schema.name,
            });
        }
        self.created.insert(schema.name.clone());
        self.overlay.entry(schema.name.clone()).or_default();
        self.view.insert(schema.name.clone(), schema.clone());
        self.ops.push(UpgradeOp::CreateStore(schema));
        Ok(())
    }

    /// Stage deletion of a store and all its records and indexes.
    pub fn delete_store(&mut self, store: &str) -> Result<(), Error> {
        if self.view.remove(store).is_none() {
            return Err(Error::StoreNotFound(store.to_string()));
        }
        self.overlay.remove(store);
        self.created.remove(store);
        self.ops.push(UpgradeOp::DeleteStore(store.to_string()));
        Ok(())
    }

    /// Stage creation of an index, backfilled from the store's records at
    /// commit. A unique index is verified against the transaction-visible
    /// records up front, so a backfill over duplicate values fails here
    /// instead of mid-commit.
    pub fn create_index(&mut self, store: &str, index: IndexDefinition) -> Result<(), Error> {
        let schema = self
            .view
            .get(store)
            .ok_or_else(|| Error::StoreNotFound(store.to_string()))?;
        if schema.index(&index.name).is_some() {
            return Err(Error::DuplicateDefinition {
                kind: "index",
                name: format!("{store}.{}", index.name),
            });
        }

        if index.unique {
            let mut owners: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
            for (pk, doc) in self.merged_docs(store)? {
                for value in index_key_values(&index, &doc) {
                    if let Some(prev) = owners.insert(value, pk.clone()) {
                        if prev != pk {
                            return Err(Error::ConstraintViolation {
                                store: store.to_string(),
                                index: index.name.clone(),
                            });
                        }
                    }
                }
            }
        }

        self.view
            .get_mut(store)
            .ok_or_else(|| Error::StoreNotFound(store.to_string()))?
            .indexes
            .push(index.clone());
        self.ops.push(UpgradeOp::CreateIndex {
            store: store.to_string(),
            index,
        });
        Ok(())
    }

    /// Stage deletion of an index and its entries.
    pub fn delete_index(&mut self, store: &str, index: &str) -> Result<(), Error> {
        let schema = self
            .view
            .get_mut(store)
            .ok_or_else(|| Error::StoreNotFound(store.to_string()))?;
        let before = schema.indexes.len();
        schema.indexes.retain(|i| i.name != index);
        if schema.indexes.len() == before {
            return Err(Error::StoreNotFound(format!("{store}.{index}")));
        }
        self.ops.push(UpgradeOp::DeleteIndex {
            store: store.to_string(),
            index: index.to_string(),
        });
        Ok(())
    }

    /// Stage an insert or replace. The primary key is extracted and
    /// unique indexes are enforced eagerly, so invalid documents fail at
    /// the call site, not at commit.
    pub fn put(&mut self, store: &str, doc: Value) -> Result<(), Error> {
        let schema = self
            .view
            .get(store)
            .ok_or_else(|| Error::StoreNotFound(store.to_string()))?;
        let pk = crate::storage::store::primary_key_bytes(schema, &doc)?;
        self.check_unique_indexes(schema, &doc, &pk)?;
        self.overlay
            .entry(store.to_string())
            .or_default()
            .insert(pk, Some(doc.clone()));
        self.ops.push(UpgradeOp::Put {
            store: store.to_string(),
            doc,
        });
        Ok(())
    }

    /// Stage a delete by primary key value.
    pub fn delete(&mut self, store: &str, key: &Value) -> Result<(), Error> {
        if !self.view.contains_key(store) {
            return Err(Error::StoreNotFound(store.to_string()));
        }
        let pk = encode_key(key)?;
        self.overlay
            .entry(store.to_string())
            .or_default()
            .insert(pk, None);
        self.ops.push(UpgradeOp::Delete {
            store: store.to_string(),
            key: key.clone(),
        });
        Ok(())
    }

    /// All documents of a store as visible inside the transaction:
    /// committed records merged with staged writes, in primary key order.
    pub fn get_all(&self, store: &str) -> Result<Vec<Value>, Error> {
        if !self.view.contains_key(store) {
            return Err(Error::StoreNotFound(store.to_string()));
        }
        Ok(self.merged_docs(store)?.into_values().collect())
    }

    /// Committed records merged with staged writes, keyed by encoded
    /// primary key.
    fn merged_docs(&self, store: &str) -> Result<BTreeMap<Vec<u8>, Value>, Error> {
        let mut merged: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        if !self.created.contains(store) {
            let data = self.db.open_tree(data_tree_name(store))?;
            for entry in data.iter() {
                let (pk, bytes) = entry?;
                merged.insert(
                    pk.to_vec(),
                    crate::storage::store::decode_document(&bytes)?,
                );
            }
        }
        if let Some(staged) = self.overlay.get(store) {
            for (pk, doc) in staged {
                match doc {
                    Some(doc) => {
                        merged.insert(pk.clone(), doc.clone());
                    }
                    None => {
                        merged.remove(pk);
                    }
                }
            }
        }
        Ok(merged)
    }

    /// Enforce the store's unique indexes against the transaction-visible
    /// state before staging a document. Commit replays the buffer
    /// verbatim, so every deterministic failure must be caught here, at
    /// the staging call site, where it can still abort the upgrade
    /// cleanly.
    fn check_unique_indexes(
        &self,
        schema: &StoreSchema,
        doc: &Value,
        pk: &[u8],
    ) -> Result<(), Error> {
        let unique: Vec<&IndexDefinition> =
            schema.indexes.iter().filter(|i| i.unique).collect();
        if unique.is_empty() {
            return Ok(());
        }

        let new_values: Vec<HashSet<Vec<u8>>> = unique
            .iter()
            .map(|index| index_key_values(index, doc).into_iter().collect())
            .collect();
        if new_values.iter().all(HashSet::is_empty) {
            return Ok(());
        }

        for (other_pk, other_doc) in self.merged_docs(&schema.name)? {
            if other_pk == pk {
                continue;
            }
            for (index, values) in unique.iter().zip(&new_values) {
                if index_key_values(index, &other_doc)
                    .iter()
                    .any(|v| values.contains(v))
                {
                    return Err(Error::ConstraintViolation {
                        store: schema.name.clone(),
                        index: index.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Register the migration ledger store if this database does not have
    /// one yet.
    pub(crate) fn ensure_ledger(&mut self) -> Result<(), Error> {
        if self.view.contains_key(LEDGER_STORE) {
            return Ok(());
        }
        self.create_store(StoreSchema::new(LEDGER_STORE, KeyPath::single("name")))
    }

    /// Stage a ledger append for a migration that just ran.
    pub(crate) fn append_ledger(&mut self, name: &str) {
        self.ops.push(UpgradeOp::AppendLedger(name.to_string()));
    }

    /// Apply every staged operation, write the version bump last, and
    /// flush. Constraint checks already ran when the operations were
    /// staged; a failure here is a storage I/O failure.
    pub(crate) fn commit(self) -> Result<(), Error> {
        let meta = self.db.open_tree(META_TREE)?;

        for op in &self.ops {
            match op {
                UpgradeOp::CreateStore(schema) => {
                    self.db.open_tree(data_tree_name(&schema.name))?;
                    meta.insert(store_meta_key(&schema.name), schema.to_bytes()?)?;
                }
                UpgradeOp::DeleteStore(store) => {
                    let schema = load_schema(&meta, store)?;
                    for index in &schema.indexes {
                        self.db.drop_tree(index_tree_name(store, &index.name))?;
                    }
                    self.db.drop_tree(data_tree_name(store))?;
                    meta.remove(store_meta_key(store))?;
                }
                UpgradeOp::CreateIndex { store, index } => {
                    let mut schema = load_schema(&meta, store)?;
                    schema.indexes.push(index.clone());
                    backfill_index(&self.db, &schema, index)?;
                    meta.insert(store_meta_key(store), schema.to_bytes()?)?;
                }
                UpgradeOp::DeleteIndex { store, index } => {
                    let mut schema = load_schema(&meta, store)?;
                    schema.indexes.retain(|i| &i.name != index);
                    self.db.drop_tree(index_tree_name(store, index))?;
                    meta.insert(store_meta_key(store), schema.to_bytes()?)?;
                }
                UpgradeOp::Put { store, doc } => {
                    let schema = load_schema(&meta, store)?;
                    put_document(&self.db, &schema, doc)?;
                }
                UpgradeOp::Delete { store, key } => {
                    let schema = load_schema(&meta, store)?;
                    delete_document(&self.db, &schema, key)?;
                }
                UpgradeOp::AppendLedger(name) => {
                    MigrationLedger::open(&self.db)?.insert(&LedgerRecord::new(name))?;
                }
            }
        }

        meta.insert(VERSION_KEY, &self.new_version.to_be_bytes())?;
        self.db.flush()?;
        info!(
            old_version = self.old_version,
            new_version = self.new_version,
            ops = self.ops.len(),
            "upgrade committed"
        );
        Ok(())
    }

    /// Discard every staged operation.
    pub(crate) fn abort(self) {
        debug!(
            old_version = self.old_version,
            new_version = self.new_version,
            ops = self.ops.len(),
            "upgrade aborted, staged changes discarded"
        );
    }
}

fn load_schema(meta: &sled::Tree, store: &str) -> Result<StoreSchema, Error> {
    let bytes = meta
        .get(store_meta_key(store))?
        .ok_or_else(|| Error::StoreNotFound(store.to_string()))?;
    StoreSchema::from_bytes(&bytes)
}
