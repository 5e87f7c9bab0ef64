//! High-level database API: declarative configuration and the open flow
//! that ties resolution, upgrading, and connections together.

use crate::error::Error;
use crate::migration::{
    execute_upgrade, resolve, Migration, MigrationRegistry, Resolution, RemovedStorePolicy,
    VersionStrategy,
};
use crate::schema::StoreSchema;
use crate::storage::{Connection, Engine, Probe, StoreHandle, RESERVED_PREFIX};
use std::collections::BTreeSet;
use std::fmt;
use tracing::warn;

/// Declarative configuration of a database: its stores, migrations, and
/// versioning behavior.
///
/// The declaration is the source of truth for the schema. On every open
/// it is compared against what the database persists, and the difference
/// decides whether an upgrade runs.
pub struct DatabaseConfig {
    name: String,
    strategy: VersionStrategy,
    removed_store_policy: RemovedStorePolicy,
    stores: Vec<StoreSchema>,
    migrations: Vec<Migration>,
    on_blocked: Option<Box<dyn Fn(u64, u64) + Send + Sync>>,
}

impl DatabaseConfig {
    /// Start a configuration for the named database.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            strategy: VersionStrategy::default(),
            removed_store_policy: RemovedStorePolicy::default(),
            stores: Vec::new(),
            migrations: Vec::new(),
            on_blocked: None,
        }
    }

    /// Declare a store.
    pub fn with_store(mut self, store: StoreSchema) -> Self {
        self.stores.push(store);
        self
    }

    /// Declare a migration. Migrations run in lexicographic name order,
    /// each at most once per database.
    pub fn with_migration(mut self, migration: Migration) -> Self {
        self.migrations.push(migration);
        self
    }

    /// Pin the database version instead of deriving it.
    pub fn with_version(mut self, version: u64) -> Self {
        self.strategy = VersionStrategy::Explicit(version);
        self
    }

    /// Set the version strategy directly.
    pub fn with_version_strategy(mut self, strategy: VersionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set the policy for stores removed from the declaration.
    pub fn with_removed_store_policy(mut self, policy: RemovedStorePolicy) -> Self {
        self.removed_store_policy = policy;
        self
    }

    /// Register a callback invoked once when this open must wait for
    /// other connections to close before upgrading. Receives the current
    /// and requested versions.
    pub fn on_blocked(mut self, callback: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        self.on_blocked = Some(Box::new(callback));
        self
    }

    /// Validate the declaration itself, before any I/O.
    fn validate(&self) -> Result<(), Error> {
        let mut store_names = BTreeSet::new();
        for store in &self.stores {
            if store.name.starts_with(RESERVED_PREFIX) {
                return Err(Error::Configuration(format!(
                    "store name '{}' uses the reserved '{RESERVED_PREFIX}' prefix",
                    store.name
                )));
            }
            if !store_names.insert(store.name.as_str()) {
                return Err(Error::DuplicateDefinition {
                    kind: "store",
                    name: store.name.clone(),
                });
            }
            store.validate()?;
        }

        let mut migration_names = BTreeSet::new();
        for migration in &self.migrations {
            if !migration_names.insert(migration.name().to_string()) {
                return Err(Error::DuplicateDefinition {
                    kind: "migration",
                    name: migration.name().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Declared migration names not yet applied, in execution order.
    fn pending_names(&self, applied: &BTreeSet<String>) -> Vec<String> {
        let mut names: Vec<String> = self
            .migrations
            .iter()
            .map(|m| m.name().to_string())
            .filter(|n| !applied.contains(n))
            .collect();
        names.sort();
        names
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("name", &self.name)
            .field("strategy", &self.strategy)
            .field("removed_store_policy", &self.removed_store_policy)
            .field("stores", &self.stores)
            .field("migrations", &self.migrations)
            .finish_non_exhaustive()
    }
}

/// An open database: a versioned connection plus any warnings produced
/// during resolution.
#[derive(Debug)]
pub struct Database {
    connection: Connection,
    deferred: Vec<String>,
}

impl Database {
    /// Resolve what opening with this configuration would do, without
    /// opening. Fails on invalid declarations and on dangerous schema
    /// changes.
    pub fn resolve(engine: &Engine, config: &DatabaseConfig) -> Result<Resolution, Error> {
        config.validate()?;
        let probe = engine.probe(&config.name)?;
        Self::resolve_probed(config, &probe)
    }

    fn resolve_probed(config: &DatabaseConfig, probe: &Probe) -> Result<Resolution, Error> {
        let pending = config.pending_names(&probe.applied);
        resolve(
            probe.version,
            &probe.snapshot,
            &config.stores,
            config.strategy,
            config.removed_store_policy,
            &pending,
        )
    }

    /// Open the database, running an upgrade transaction when resolution
    /// calls for one.
    pub fn open(engine: &Engine, config: DatabaseConfig) -> Result<Self, Error> {
        config.validate()?;
        let probe = engine.probe(&config.name)?;
        let resolution = Self::resolve_probed(&config, &probe)?;

        if !resolution.deferred.is_empty() {
            warn!(
                database = %config.name,
                count = resolution.deferred.len(),
                "declaration is ahead of the pinned version"
            );
        }

        let registry = MigrationRegistry::from_declarations(config.migrations)?;
        let connection = if resolution.needs_upgrade() {
            let pending = registry.pending(&probe.applied);
            engine.open(
                &config.name,
                resolution.target_version,
                config.on_blocked.as_deref(),
                |txn| execute_upgrade(txn, &config.stores, &resolution.diff, &pending),
            )?
        } else {
            engine.open(
                &config.name,
                resolution.target_version,
                config.on_blocked.as_deref(),
                |_| Ok(()),
            )?
        };

        Ok(Self {
            connection,
            deferred: resolution.deferred,
        })
    }

    /// The version this database was opened at.
    pub fn version(&self) -> u64 {
        self.connection.version()
    }

    /// A read/write handle for one store.
    pub fn store(&self, name: &str) -> Result<StoreHandle, Error> {
        self.connection.store(name)
    }

    /// Non-reserved store names, sorted.
    pub fn store_names(&self) -> Result<Vec<String>, Error> {
        self.connection.store_names()
    }

    /// Warnings for changes deferred by a pinned version.
    pub fn deferred_changes(&self) -> &[String] {
        &self.deferred
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}
