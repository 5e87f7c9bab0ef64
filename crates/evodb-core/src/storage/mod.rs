//! Storage layer: the sled-backed engine, store handles, the privileged
//! upgrade transaction, and the key codec.

pub mod engine;
pub mod store;
pub mod transaction;
pub mod value_codec;

pub use engine::{Connection, Engine, Probe};
pub use store::StoreHandle;
pub use transaction::{UpgradePhase, UpgradeTransaction};

/// Name prefix reserved for internal stores (the migration ledger and
/// deleted-store backups). User declarations may not use it.
pub const RESERVED_PREFIX: &str = "__";

/// Sled tree holding structural metadata: the database version and one
/// entry per store schema.
pub(crate) const META_TREE: &str = "meta";

/// Meta-tree key for the current database version (big-endian u64).
pub(crate) const VERSION_KEY: &[u8] = b"database_version";

/// Meta-tree key prefix for persisted store schemas.
pub(crate) const STORE_META_PREFIX: &str = "store:";

/// Meta-tree key for a store's persisted schema.
pub(crate) fn store_meta_key(store: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(STORE_META_PREFIX.len() + store.len());
    key.extend_from_slice(STORE_META_PREFIX.as_bytes());
    key.extend_from_slice(store.as_bytes());
    key
}

/// Read the persisted database version. `None` means the database has
/// never completed an upgrade.
pub(crate) fn read_version(db: &sled::Db) -> Result<Option<u64>, crate::error::Error> {
    let meta = db.open_tree(META_TREE)?;
    match meta.get(VERSION_KEY)? {
        Some(bytes) => {
            let raw: [u8; 8] = bytes.as_ref().try_into().map_err(|_| {
                crate::error::Error::Deserialization("malformed database version".to_string())
            })?;
            Ok(Some(u64::from_be_bytes(raw)))
        }
        None => Ok(None),
    }
}

/// Microseconds since the Unix epoch, for ledger timestamps.
pub(crate) fn current_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_meta_key_layout() {
        assert_eq!(store_meta_key("users"), b"store:users".to_vec());
        assert_eq!(store_meta_key(""), b"store:".to_vec());
    }

    #[test]
    fn test_current_timestamp_advances() {
        let a = current_timestamp();
        let b = current_timestamp();
        assert!(b >= a);
        assert!(a > 0);
    }
}
