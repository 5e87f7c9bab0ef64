//! evodb-core: a versioned, structured key-value store with safe schema
//! evolution.
//!
//! Databases are declared, not administered: an application states the
//! stores, indexes, and migrations it expects, and every open compares
//! that declaration against what the database persists. Safe differences
//! (new stores, added or removed indexes) are applied automatically
//! inside a single privileged upgrade transaction; dangerous differences
//! (deleted stores, changed primary keys) fail the open until a
//! migration handles them. Applied migrations are recorded in a ledger
//! and never run twice.
//!
//! ```no_run
//! use evodb_core::{Database, DatabaseConfig, Engine, IndexDefinition, KeyPath, StoreSchema};
//! use serde_json::json;
//!
//! # fn main() -> Result<(), evodb_core::Error> {
//! let engine = Engine::new("./data");
//! let db = Database::open(
//!     &engine,
//!     DatabaseConfig::new("app").with_store(
//!         StoreSchema::new("users", KeyPath::single("id"))
//!             .with_index(IndexDefinition::new("by_email", KeyPath::single("email")).unique()),
//!     ),
//! )?;
//!
//! let users = db.store("users")?;
//! users.put(&json!({ "id": 1, "email": "alice@example.com" }))?;
//! # Ok(())
//! # }
//! ```

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod db;
pub mod error;
pub mod migration;
pub mod schema;
pub mod storage;

pub use db::{Database, DatabaseConfig};
pub use error::Error;
pub use migration::{
    backup_store_name, LedgerRecord, Migration, MigrationContext, RemovedStorePolicy, Resolution,
    SchemaChange, SchemaDiff, VersionStrategy, LEDGER_STORE,
};
pub use schema::{IndexDefinition, KeyPath, SchemaSnapshot, StoreSchema};
pub use storage::{Connection, Engine, Probe, StoreHandle, UpgradePhase, UpgradeTransaction};
