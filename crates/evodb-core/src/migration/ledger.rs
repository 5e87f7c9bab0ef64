//! Migration ledger: the persisted record of applied migrations.

use crate::error::Error;
use crate::storage::current_timestamp;
use rkyv::{Archive, Deserialize, Serialize};
use std::collections::BTreeSet;

/// Reserved store holding one record per applied migration, keyed by
/// migration name.
pub const LEDGER_STORE: &str = "__migrations__";

/// A single ledger entry: which migration ran, and when.
#[derive(Debug, Clone, PartialEq, Archive, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Migration name, the ledger key.
    pub name: String,
    /// Microseconds since the Unix epoch at application time.
    pub applied_at: u64,
}

impl LedgerRecord {
    /// A record for a migration applied now.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            applied_at: current_timestamp(),
        }
    }

    /// Serialize the record to bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        rkyv::to_bytes::<rkyv::rancor::Error>(self)
            .map(|v| v.to_vec())
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    /// Deserialize a record from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        rkyv::from_bytes::<Self, rkyv::rancor::Error>(bytes)
            .map_err(|e| Error::Deserialization(e.to_string()))
    }
}

/// Handle over the ledger's backing tree.
#[derive(Debug, Clone)]
pub(crate) struct MigrationLedger {
    tree: sled::Tree,
}

impl MigrationLedger {
    /// Open the ledger tree. Creating the tree is idempotent; the store
    /// itself is registered in structural metadata by the upgrade
    /// transaction.
    pub(crate) fn open(db: &sled::Db) -> Result<Self, Error> {
        let tree = db.open_tree(crate::storage::store::data_tree_name(LEDGER_STORE))?;
        Ok(Self { tree })
    }

    /// Names of all applied migrations.
    pub(crate) fn applied_names(&self) -> Result<BTreeSet<String>, Error> {
        let mut names = BTreeSet::new();
        for entry in self.tree.iter() {
            let (_, value) = entry?;
            names.insert(LedgerRecord::from_bytes(&value)?.name);
        }
        Ok(names)
    }

    /// Append a record. Called only from upgrade-transaction commit.
    pub(crate) fn insert(&self, record: &LedgerRecord) -> Result<(), Error> {
        self.tree
            .insert(record.name.as_bytes(), record.to_bytes()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let record = LedgerRecord::new("0001_backfill");
        let decoded = LedgerRecord::from_bytes(&record.to_bytes().unwrap()).unwrap();
        assert_eq!(record, decoded);
        assert!(record.applied_at > 0);
    }

    #[test]
    fn test_applied_names() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let ledger = MigrationLedger::open(&db).unwrap();

        assert!(ledger.applied_names().unwrap().is_empty());

        ledger.insert(&LedgerRecord::new("0002_add_flags")).unwrap();
        ledger.insert(&LedgerRecord::new("0001_backfill")).unwrap();

        let names: Vec<_> = ledger.applied_names().unwrap().into_iter().collect();
        assert_eq!(names, vec!["0001_backfill", "0002_add_flags"]);
    }
}
