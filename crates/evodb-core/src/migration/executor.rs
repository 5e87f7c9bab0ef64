//! Upgrade execution: applies safe schema changes and runs pending
//! migrations inside the upgrade transaction.

use crate::error::Error;
use crate::migration::diff::{SchemaChange, SchemaDiff};
use crate::migration::registry::Migration;
use crate::schema::StoreSchema;
use crate::storage::transaction::UpgradeTransaction;
use serde_json::Value;
use tracing::{debug, info};

/// The surface migration code sees: record access on the upgrade
/// transaction, plus the pre-upgrade version for conditional logic.
pub struct MigrationContext<'tx> {
    txn: &'tx mut UpgradeTransaction,
}

impl MigrationContext<'_> {
    /// Version before the upgrade (0 for a fresh database).
    pub fn old_version(&self) -> u64 {
        self.txn.old_version()
    }

    /// All documents of a store as visible inside the transaction.
    pub fn get_all(&self, store: &str) -> Result<Vec<Value>, Error> {
        self.txn.get_all(store)
    }

    /// Stage an insert or replace.
    pub fn put(&mut self, store: &str, doc: Value) -> Result<(), Error> {
        self.txn.put(store, doc)
    }

    /// Stage a delete by primary key value.
    pub fn delete(&mut self, store: &str, key: &Value) -> Result<(), Error> {
        self.txn.delete(store, key)
    }

    /// Non-reserved store names visible at this point, sorted.
    pub fn store_names(&self) -> Vec<String> {
        self.txn.store_names()
    }
}

/// Apply the resolved safe changes and run pending migrations.
///
/// Structural changes run before migrations so migration code sees the
/// declared schema. For a fresh database the declared stores are created
/// wholesale. Each migration's ledger append is staged immediately after
/// it succeeds, so an error from a later migration aborts the whole
/// transaction and no partial ledger survives.
pub fn execute_upgrade(
    txn: &mut UpgradeTransaction,
    desired: &[StoreSchema],
    diff: &SchemaDiff,
    pending: &[&Migration],
) -> Result<(), Error> {
    txn.ensure_ledger()?;

    if txn.old_version() == 0 {
        for schema in desired {
            debug!(store = %schema.name, "creating store");
            txn.create_store(schema.clone())?;
        }
    } else {
        apply_safe_changes(txn, desired, diff)?;
    }

    for migration in pending {
        info!(migration = migration.name(), "running migration");
        let mut ctx = MigrationContext { txn: &mut *txn };
        migration.run(&mut ctx).map_err(|e| Error::MigrationFailure {
            name: migration.name().to_string(),
            source: Box::new(e),
        })?;
        txn.append_ledger(migration.name());
    }

    Ok(())
}

fn apply_safe_changes(
    txn: &mut UpgradeTransaction,
    desired: &[StoreSchema],
    diff: &SchemaDiff,
) -> Result<(), Error> {
    // Renames first: a rename both frees its old name and must capture
    // the store's records before anything else touches them.
    for change in &diff.safe {
        if let SchemaChange::StoreRename { old, new } = change {
            debug!(from = %old, to = %new, "renaming store");
            let mut schema = txn
                .store_schema(old)
                .cloned()
                .ok_or_else(|| Error::StoreNotFound(old.clone()))?;
            let records = txn.get_all(old)?;
            txn.delete_store(old)?;

            schema.name = new.clone();
            txn.create_store(schema)?;
            for doc in records {
                txn.put(new, doc)?;
            }
        }
    }

    for change in &diff.safe {
        if let SchemaChange::StoreAdd { store } = change {
            debug!(store = %store, "creating store");
            let schema = desired
                .iter()
                .find(|s| &s.name == store)
                .ok_or_else(|| Error::StoreNotFound(store.clone()))?;
            txn.create_store(schema.clone())?;
        }
    }

    // Index changes in diff order, so a replaced index is deleted
    // immediately before its recreation.
    for change in &diff.safe {
        match change {
            SchemaChange::IndexAdd { store, index } => {
                debug!(store = %store, index = %index.name, "creating index");
                txn.create_index(store, index.clone())?;
            }
            SchemaChange::IndexDelete { store, index } => {
                debug!(store = %store, index = %index, "deleting index");
                txn.delete_index(store, index)?;
            }
            _ => {}
        }
    }

    Ok(())
}
