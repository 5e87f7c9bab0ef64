//! The engine: named databases under a root directory, versioned opens,
//! and connection tracking.
//!
//! Each named database is one sled database in its own subdirectory. The
//! engine keeps a process-wide registry of open handles so every
//! connection to the same database shares one sled handle. Each entry
//! carries its own lock and connection count, so a version-bumping open
//! waits only for connections to its own database; opens and probes of
//! other databases are never serialized behind an upgrade.

use crate::error::Error;
use crate::migration::ledger::MigrationLedger;
use crate::schema::SchemaSnapshot;
use crate::storage::store::StoreHandle;
use crate::storage::transaction::{UpgradePhase, UpgradeTransaction};
use crate::storage::{read_version, store_meta_key, META_TREE};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Per-database shared state: the sled handle, a connection count, and
/// the condvar a blocked upgrade waits on. Version-changing opens of one
/// database serialize on `connections`' mutex; other databases are
/// untouched.
#[derive(Debug)]
struct DbEntry {
    db: sled::Db,
    connections: Mutex<usize>,
    cond: Condvar,
}

/// Entry point for opening named databases under a root directory.
#[derive(Clone)]
pub struct Engine {
    root: PathBuf,
    registry: Arc<Mutex<HashMap<String, Arc<DbEntry>>>>,
}

/// Read-only view of a database's persisted state, taken before deciding
/// whether an upgrade is needed.
#[derive(Debug)]
pub struct Probe {
    /// Persisted version, `None` if no upgrade ever completed.
    pub version: Option<u64>,
    /// Persisted schema, reserved stores excluded.
    pub snapshot: SchemaSnapshot,
    /// Names of applied migrations.
    pub applied: BTreeSet<String>,
}

impl Engine {
    /// Create an engine rooted at `root`. The directory is created by
    /// sled on first open.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            registry: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Get or create the shared entry for a database. The registry map
    /// lock is held only for this lookup.
    fn entry(&self, name: &str) -> Result<Arc<DbEntry>, Error> {
        let mut registry = self.registry.lock();
        if let Some(entry) = registry.get(name) {
            return Ok(Arc::clone(entry));
        }
        let db = sled::Config::new()
            .path(self.root.join(name))
            .use_compression(true)
            .open()?;
        let entry = Arc::new(DbEntry {
            db,
            connections: Mutex::new(0),
            cond: Condvar::new(),
        });
        registry.insert(name.to_string(), Arc::clone(&entry));
        Ok(entry)
    }

    /// Inspect a database's persisted version, schema, and applied
    /// migrations without opening a connection.
    pub fn probe(&self, name: &str) -> Result<Probe, Error> {
        let entry = self.entry(name)?;
        Ok(Probe {
            version: read_version(&entry.db)?,
            snapshot: SchemaSnapshot::read(&entry.db)?,
            applied: MigrationLedger::open(&entry.db)?.applied_names()?,
        })
    }

    /// Open a connection to a database at `version`.
    ///
    /// When `version` exceeds the persisted version, the open waits for
    /// all other connections to close (invoking `blocked` once if it has
    /// to wait), then runs `upgrade` inside the single privileged upgrade
    /// transaction. An error from `upgrade` aborts the transaction, every
    /// staged change is discarded, and the open fails. Requesting a
    /// version older than the persisted one is an error.
    pub fn open(
        &self,
        name: &str,
        version: u64,
        blocked: Option<&(dyn Fn(u64, u64) + Send + Sync)>,
        upgrade: impl FnOnce(&mut UpgradeTransaction) -> Result<(), Error>,
    ) -> Result<Connection, Error> {
        let entry = self.entry(name)?;
        let mut connections = entry.connections.lock();
        let current = read_version(&entry.db)?.unwrap_or(0);

        if version < current {
            return Err(Error::Engine(format!(
                "database '{name}' is at version {current}, cannot open at older version {version}"
            )));
        }

        let mut phase = UpgradePhase::NotStarted;
        if version > current {
            let mut notified = false;
            let old_version = loop {
                // Another waiting open may have performed this upgrade
                // while we slept, so re-read the version on every pass.
                let current = read_version(&entry.db)?.unwrap_or(0);
                if version < current {
                    return Err(Error::Engine(format!(
                        "database '{name}' was upgraded to version {current} while \
                         waiting to open at older version {version}"
                    )));
                }
                if version == current {
                    break None;
                }

                if *connections == 0 {
                    break Some(current);
                }

                if !notified {
                    warn!(
                        database = name,
                        current, requested = version,
                        "upgrade blocked by open connections"
                    );
                    if let Some(callback) = blocked {
                        callback(current, version);
                    }
                    notified = true;
                }
                entry.cond.wait(&mut connections);
            };

            if let Some(old_version) = old_version {
                phase = UpgradePhase::InUpgrade { old_version };
                debug!(database = name, ?phase, "entering upgrade");

                let mut txn = UpgradeTransaction::begin(entry.db.clone(), old_version, version)?;
                match upgrade(&mut txn) {
                    Ok(()) => {
                        txn.commit()?;
                        phase = UpgradePhase::Committed;
                    }
                    Err(e) => {
                        txn.abort();
                        phase = UpgradePhase::Aborted;
                        debug!(database = name, ?phase, error = %e, "upgrade failed");
                        return Err(e);
                    }
                }
                info!(database = name, version, "database upgraded");
            }
        }

        *connections += 1;
        debug!(
            database = name,
            version,
            connections = *connections,
            ?phase,
            "connection opened"
        );
        drop(connections);

        Ok(Connection {
            name: name.to_string(),
            version,
            entry,
        })
    }
}

/// An open, versioned connection to one database.
///
/// Dropping the connection releases it; an upgrade waiting for the
/// database is woken.
#[derive(Debug)]
pub struct Connection {
    name: String,
    version: u64,
    entry: Arc<DbEntry>,
}

impl Connection {
    /// The database name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The version this connection was opened at.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The persisted schema, reserved stores excluded.
    pub fn snapshot(&self) -> Result<SchemaSnapshot, Error> {
        SchemaSnapshot::read(&self.entry.db)
    }

    /// Names of applied migrations.
    pub fn applied_migrations(&self) -> Result<BTreeSet<String>, Error> {
        MigrationLedger::open(&self.entry.db)?.applied_names()
    }

    /// Non-reserved store names, sorted.
    pub fn store_names(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .snapshot()?
            .store_names()
            .map(str::to_string)
            .collect())
    }

    /// A read/write handle for one store.
    ///
    /// Backup stores (created by the preserve policy) are addressable by
    /// their reserved name even though they are hidden from
    /// [`Connection::store_names`]; the migration ledger is not.
    pub fn store(&self, name: &str) -> Result<StoreHandle, Error> {
        if name == crate::migration::ledger::LEDGER_STORE {
            return Err(Error::StoreNotFound(name.to_string()));
        }
        let meta = self.entry.db.open_tree(META_TREE)?;
        let bytes = meta
            .get(store_meta_key(name))?
            .ok_or_else(|| Error::StoreNotFound(name.to_string()))?;
        Ok(StoreHandle {
            db: self.entry.db.clone(),
            schema: crate::schema::StoreSchema::from_bytes(&bytes)?,
        })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        let mut connections = self.entry.connections.lock();
        *connections = connections.saturating_sub(1);
        debug!(
            database = %self.name,
            connections = *connections,
            "connection closed"
        );
        drop(connections);
        self.entry.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{KeyPath, StoreSchema};
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    #[test]
    fn test_fresh_open_runs_upgrade_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path());

        let conn = engine
            .open("app", 1, None, |txn| {
                assert_eq!(txn.old_version(), 0);
                txn.create_store(StoreSchema::new("users", KeyPath::single("id")))
            })
            .unwrap();

        assert_eq!(conn.version(), 1);
        assert_eq!(conn.store_names().unwrap(), vec!["users"]);
    }

    #[test]
    fn test_reopen_at_same_version_skips_upgrade() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path());

        engine
            .open("app", 1, None, |txn| {
                txn.create_store(StoreSchema::new("users", KeyPath::single("id")))
            })
            .unwrap();

        let ran = AtomicBool::new(false);
        let conn = engine
            .open("app", 1, None, |_| {
                ran.store(true, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        assert!(!ran.load(Ordering::SeqCst));
        assert_eq!(conn.version(), 1);
    }

    #[test]
    fn test_version_regression_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path());

        engine.open("app", 2, None, |_| Ok(())).unwrap();
        let err = engine.open("app", 1, None, |_| Ok(())).unwrap_err();
        assert!(matches!(err, Error::Engine(_)));
    }

    #[test]
    fn test_failed_upgrade_leaves_version_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path());

        engine.open("app", 1, None, |_| Ok(())).unwrap();
        let err = engine
            .open("app", 2, None, |txn| {
                txn.create_store(StoreSchema::new("posts", KeyPath::single("id")))?;
                Err(Error::Engine("boom".to_string()))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Engine(_)));

        let probe = engine.probe("app").unwrap();
        assert_eq!(probe.version, Some(1));
        assert!(!probe.snapshot.contains("posts"));
    }

    #[test]
    fn test_upgrade_waits_for_open_connections() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path());

        let conn = engine.open("app", 1, None, |_| Ok(())).unwrap();

        let blocked = Arc::new(AtomicBool::new(false));
        let upgraded_to = Arc::new(AtomicU64::new(0));
        let handle = {
            let engine = engine.clone();
            let blocked = Arc::clone(&blocked);
            let upgraded_to = Arc::clone(&upgraded_to);
            std::thread::spawn(move || {
                let notify = {
                    let blocked = Arc::clone(&blocked);
                    move |_current: u64, _requested: u64| {
                        blocked.store(true, Ordering::SeqCst);
                    }
                };
                let conn = engine.open("app", 2, Some(&notify), |_| Ok(())).unwrap();
                upgraded_to.store(conn.version(), Ordering::SeqCst);
            })
        };

        // Give the upgrader time to hit the wait.
        std::thread::sleep(std::time::Duration::from_millis(100));
        assert!(blocked.load(Ordering::SeqCst));
        assert_eq!(upgraded_to.load(Ordering::SeqCst), 0);

        drop(conn);
        handle.join().unwrap();
        assert_eq!(upgraded_to.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_upgrade_on_one_database_does_not_block_another() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path());

        let (started_tx, started_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        // Park an upgrade of "first" inside its callback.
        let handle = {
            let engine = engine.clone();
            std::thread::spawn(move || {
                engine
                    .open("first", 1, None, |txn| {
                        txn.create_store(StoreSchema::new("users", KeyPath::single("id")))?;
                        started_tx.send(()).unwrap();
                        release_rx.recv().unwrap();
                        Ok(())
                    })
                    .unwrap();
            })
        };

        started_rx.recv().unwrap();
        // "second" opens and probes while "first" is mid-upgrade.
        let conn = engine.open("second", 1, None, |_| Ok(())).unwrap();
        assert_eq!(conn.version(), 1);
        assert_eq!(engine.probe("second").unwrap().version, Some(1));

        release_tx.send(()).unwrap();
        handle.join().unwrap();
        assert_eq!(engine.probe("first").unwrap().version, Some(1));
    }

    #[test]
    fn test_probe_reads_without_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path());

        let probe = engine.probe("app").unwrap();
        assert_eq!(probe.version, None);
        assert!(probe.snapshot.is_empty());
        assert!(probe.applied.is_empty());

        {
            let conn = engine
                .open("app", 1, None, |txn| {
                    txn.create_store(StoreSchema::new("users", KeyPath::single("id")))
                })
                .unwrap();
            conn.store("users")
                .unwrap()
                .put(&json!({ "id": 1 }))
                .unwrap();
        }

        let probe = engine.probe("app").unwrap();
        assert_eq!(probe.version, Some(1));
        assert!(probe.snapshot.contains("users"));
    }

    #[test]
    fn test_reserved_store_handle_is_hidden() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::new(dir.path());

        let conn = engine
            .open("app", 1, None, |txn| {
                txn.create_store(StoreSchema::new("users", KeyPath::single("id")))
            })
            .unwrap();

        assert!(matches!(
            conn.store(crate::migration::ledger::LEDGER_STORE).unwrap_err(),
            Error::StoreNotFound(_)
        ));
        assert!(matches!(
            conn.store("missing").unwrap_err(),
            Error::StoreNotFound(_)
        ));
    }
}
