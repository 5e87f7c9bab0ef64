//! Schema evolution: diffing, safety classification, version resolution,
//! migration declarations, the applied-migration ledger, and upgrade
//! execution.

pub mod diff;
pub mod executor;
pub mod ledger;
pub mod registry;
pub mod resolver;

pub use diff::{backup_store_name, RemovedStorePolicy, SchemaChange, SchemaDiff};
pub use executor::{execute_upgrade, MigrationContext};
pub use ledger::{LedgerRecord, LEDGER_STORE};
pub use registry::{Migration, MigrationRegistry};
pub use resolver::{resolve, Resolution, VersionStrategy};
