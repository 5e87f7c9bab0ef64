//! Core error types.

use crate::migration::diff::SchemaChange;
use thiserror::Error;

/// Core database errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid open configuration (e.g. an explicit target version of 0).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Two declarations share a name that must be unique.
    #[error("duplicate {kind} definition: {name}")]
    DuplicateDefinition {
        /// What kind of declaration collided ("store", "index", "migration").
        kind: &'static str,
        /// The colliding name.
        name: String,
    },

    /// The desired schema requires changes that cannot be applied
    /// automatically without risking data loss.
    #[error("{}", fmt_unsafe_changes(.changes))]
    UnsafeSchemaChange {
        /// Every offending change, enumerated.
        changes: Vec<SchemaChange>,
    },

    /// A named migration failed; the enclosing upgrade was aborted.
    #[error("migration '{name}' failed: {source}")]
    MigrationFailure {
        /// Name of the failed migration.
        name: String,
        /// The underlying failure.
        #[source]
        source: Box<Error>,
    },

    /// Opaque failure from the hosting engine (denied or regressing open).
    #[error("engine error: {0}")]
    Engine(String),

    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A document does not yield a valid key at the required key path.
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// The named store does not exist.
    #[error("store not found: {0}")]
    StoreNotFound(String),

    /// A unique index rejected a document.
    #[error("unique constraint violated on index '{index}' of store '{store}'")]
    ConstraintViolation {
        /// Store owning the index.
        store: String,
        /// The unique index that rejected the write.
        index: String,
    },

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

fn fmt_unsafe_changes(changes: &[SchemaChange]) -> String {
    let mut out = String::from("unsafe schema changes require explicit migration: ");
    for (i, change) in changes.iter().enumerate() {
        if i > 0 {
            out.push_str("; ");
        }
        out.push_str(&change.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::KeyPath;

    #[test]
    fn test_unsafe_change_display_enumerates_every_change() {
        let err = Error::UnsafeSchemaChange {
            changes: vec![
                SchemaChange::StoreDelete {
                    store: "posts".to_string(),
                },
                SchemaChange::KeyPathChange {
                    store: "users".to_string(),
                    old: KeyPath::single("id"),
                    new: KeyPath::single("uuid"),
                },
            ],
        };

        let rendered = err.to_string();
        assert!(rendered.contains("posts"));
        assert!(rendered.contains("users"));
        assert!(rendered.contains("id"));
        assert!(rendered.contains("uuid"));
    }

    #[test]
    fn test_migration_failure_names_migration() {
        let err = Error::MigrationFailure {
            name: "0001-backfill".to_string(),
            source: Box::new(Error::InvalidData("bad record".to_string())),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("0001-backfill"));
        assert!(rendered.contains("bad record"));
    }

    #[test]
    fn test_duplicate_definition_display() {
        let err = Error::DuplicateDefinition {
            kind: "migration",
            name: "a-y".to_string(),
        };
        assert_eq!(err.to_string(), "duplicate migration definition: a-y");
    }
}
