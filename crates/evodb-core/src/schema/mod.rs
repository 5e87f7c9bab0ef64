//! Schema model: key paths, index and store definitions, and the
//! existing-schema snapshot read back from a live database.

pub mod index;
pub mod key_path;
pub mod snapshot;
pub mod store;

pub use index::IndexDefinition;
pub use key_path::KeyPath;
pub use snapshot::SchemaSnapshot;
pub use store::StoreSchema;
