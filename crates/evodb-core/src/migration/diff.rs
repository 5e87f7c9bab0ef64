//! Schema diffing algorithm.
//!
//! Compares the persisted schema snapshot against the declared desired
//! schema and produces an ordered, classified list of changes: safe
//! changes are applied automatically inside the upgrade transaction,
//! dangerous changes require explicit developer-authored migration code.

use crate::schema::{IndexDefinition, KeyPath, SchemaSnapshot, StoreSchema};
use std::collections::HashSet;
use std::fmt;

/// A single structural difference between the persisted and desired schema.
#[derive(Debug, Clone, PartialEq)]
pub enum SchemaChange {
    /// A store exists in the desired schema but not in the database.
    StoreAdd {
        /// Name of the store to create.
        store: String,
    },
    /// A store exists in the database but not in the desired schema.
    StoreDelete {
        /// Name of the store that would be deleted.
        store: String,
    },
    /// A store is renamed, preserving its structure and records.
    StoreRename {
        /// Current name.
        old: String,
        /// Replacement name.
        new: String,
    },
    /// A store's primary key path differs from the declaration.
    KeyPathChange {
        /// The affected store.
        store: String,
        /// Persisted key path.
        old: KeyPath,
        /// Declared key path.
        new: KeyPath,
    },
    /// An index is added to an existing store.
    IndexAdd {
        /// The owning store.
        store: String,
        /// The index to create.
        index: IndexDefinition,
    },
    /// An index is removed from an existing store.
    IndexDelete {
        /// The owning store.
        store: String,
        /// Name of the index to delete.
        index: String,
    },
}

impl SchemaChange {
    /// The store this change applies to.
    pub fn store_name(&self) -> &str {
        match self {
            SchemaChange::StoreAdd { store }
            | SchemaChange::StoreDelete { store }
            | SchemaChange::KeyPathChange { store, .. }
            | SchemaChange::IndexAdd { store, .. }
            | SchemaChange::IndexDelete { store, .. } => store,
            SchemaChange::StoreRename { old, .. } => old,
        }
    }
}

impl fmt::Display for SchemaChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchemaChange::StoreAdd { store } => write!(f, "add store '{store}'"),
            SchemaChange::StoreDelete { store } => write!(f, "delete store '{store}'"),
            SchemaChange::StoreRename { old, new } => {
                write!(f, "rename store '{old}' to '{new}'")
            }
            SchemaChange::KeyPathChange { store, old, new } => {
                write!(f, "change key path of store '{store}' from '{old}' to '{new}'")
            }
            SchemaChange::IndexAdd { store, index } => {
                write!(f, "add index '{}' to store '{store}'", index.name)
            }
            SchemaChange::IndexDelete { store, index } => {
                write!(f, "delete index '{index}' from store '{store}'")
            }
        }
    }
}

/// Classified diff between the persisted and desired schema.
#[derive(Debug, Clone, Default)]
pub struct SchemaDiff {
    /// Changes applicable automatically without data loss, in apply order.
    pub safe: Vec<SchemaChange>,
    /// Changes requiring explicit migration code.
    pub dangerous: Vec<SchemaChange>,
}

impl SchemaDiff {
    /// Compute the diff between the persisted snapshot and the desired
    /// store declarations.
    ///
    /// Pure comparison: stores are visited in sorted name order, changes
    /// are deduplicated by (store, index), and for a replaced index the
    /// delete is ordered immediately before the corresponding add.
    pub fn compute(existing: &SchemaSnapshot, desired: &[StoreSchema]) -> Self {
        let mut diff = SchemaDiff::default();
        let mut seen = HashSet::new();

        let mut sorted: Vec<&StoreSchema> = desired.iter().collect();
        sorted.sort_by(|a, b| a.name.cmp(&b.name));

        for store in &sorted {
            match existing.get(&store.name) {
                None => diff.push_safe(
                    &mut seen,
                    SchemaChange::StoreAdd {
                        store: store.name.clone(),
                    },
                ),
                Some(persisted) => {
                    if persisted.key_path != store.key_path {
                        // The key path is unrecoverable without a manual
                        // migration; index comparison is skipped once the
                        // store is flagged.
                        diff.push_dangerous(
                            &mut seen,
                            SchemaChange::KeyPathChange {
                                store: store.name.clone(),
                                old: persisted.key_path.clone(),
                                new: store.key_path.clone(),
                            },
                        );
                        continue;
                    }
                    diff.diff_indexes(&mut seen, persisted, store);
                }
            }
        }

        let desired_names: HashSet<&str> = desired.iter().map(|s| s.name.as_str()).collect();
        for name in existing.store_names() {
            if !desired_names.contains(name) {
                diff.push_dangerous(
                    &mut seen,
                    SchemaChange::StoreDelete {
                        store: name.to_string(),
                    },
                );
            }
        }

        diff
    }

    fn diff_indexes(
        &mut self,
        seen: &mut HashSet<(String, Option<String>)>,
        persisted: &StoreSchema,
        desired: &StoreSchema,
    ) {
        for index in &desired.indexes {
            match persisted.index(&index.name) {
                None => self.push_safe(
                    seen,
                    SchemaChange::IndexAdd {
                        store: desired.name.clone(),
                        index: index.clone(),
                    },
                ),
                Some(existing) if !existing.same_shape(index) => {
                    // Modeled as a replace: delete first, then recreate
                    // under the same name.
                    self.push_safe(
                        seen,
                        SchemaChange::IndexDelete {
                            store: desired.name.clone(),
                            index: index.name.clone(),
                        },
                    );
                    self.safe.push(SchemaChange::IndexAdd {
                        store: desired.name.clone(),
                        index: index.clone(),
                    });
                }
                Some(_) => {}
            }
        }

        for index in &persisted.indexes {
            if desired.index(&index.name).is_none() {
                self.push_safe(
                    seen,
                    SchemaChange::IndexDelete {
                        store: desired.name.clone(),
                        index: index.name.clone(),
                    },
                );
            }
        }
    }

    fn push_safe(&mut self, seen: &mut HashSet<(String, Option<String>)>, change: SchemaChange) {
        if seen.insert(change_key(&change)) {
            self.safe.push(change);
        }
    }

    fn push_dangerous(
        &mut self,
        seen: &mut HashSet<(String, Option<String>)>,
        change: SchemaChange,
    ) {
        if seen.insert(change_key(&change)) {
            self.dangerous.push(change);
        }
    }

    /// Whether the diff contains any change at all.
    pub fn has_changes(&self) -> bool {
        !self.safe.is_empty() || !self.dangerous.is_empty()
    }

    /// Total number of changes.
    pub fn change_count(&self) -> usize {
        self.safe.len() + self.dangerous.len()
    }

    /// Apply the removed-store policy, rewriting dangerous store deletions
    /// into safe renames-with-backup when configured.
    ///
    /// `current_version` is the pre-upgrade database version; embedding it
    /// in the backup name guarantees two deletions of the same store name
    /// at different historical versions never collide.
    pub fn apply_removed_store_policy(
        mut self,
        policy: RemovedStorePolicy,
        current_version: u64,
    ) -> Self {
        if policy == RemovedStorePolicy::Error {
            return self;
        }

        let mut remaining = Vec::with_capacity(self.dangerous.len());
        for change in self.dangerous {
            match change {
                SchemaChange::StoreDelete { store } => {
                    let new = backup_store_name(&store, current_version);
                    self.safe.push(SchemaChange::StoreRename { old: store, new });
                }
                other => remaining.push(other),
            }
        }
        self.dangerous = remaining;
        self
    }
}

/// Deduplication key: (store, index) pair.
fn change_key(change: &SchemaChange) -> (String, Option<String>) {
    match change {
        SchemaChange::StoreAdd { store }
        | SchemaChange::StoreDelete { store }
        | SchemaChange::StoreRename { old: store, .. }
        | SchemaChange::KeyPathChange { store, .. } => (store.clone(), None),
        SchemaChange::IndexAdd { store, index } => (store.clone(), Some(index.name.clone())),
        SchemaChange::IndexDelete { store, index } => (store.clone(), Some(index.clone())),
    }
}

/// Policy for stores present in the database but absent from the desired
/// schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RemovedStorePolicy {
    /// Leave every store deletion dangerous; initialization fails unless
    /// a migration handles it.
    #[default]
    Error,
    /// Rewrite each deletion into a safe rename to a reserved backup
    /// store, preserving the records.
    Preserve,
}

/// Reserved backup name for a store deleted at `version`.
pub fn backup_store_name(store: &str, version: u64) -> String {
    format!("__{store}_deleted_v{version}__")
}
