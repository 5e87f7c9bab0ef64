//! Migration registry: named, ordered migration declarations.

use crate::error::Error;
use crate::migration::executor::MigrationContext;
use std::collections::BTreeSet;
use std::fmt;

type MigrationBody = Box<dyn Fn(&mut MigrationContext<'_>) -> Result<(), Error> + Send + Sync>;

/// A named migration: a closure run once inside the upgrade transaction
/// of the database it is declared for.
///
/// Names double as the ordering key, so a sortable convention (for
/// example `0001_backfill_emails`) is expected. A migration that has been
/// applied is never run again; its name is recorded in the ledger.
pub struct Migration {
    name: String,
    body: MigrationBody,
}

impl Migration {
    /// Declare a migration.
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(&mut MigrationContext<'_>) -> Result<(), Error> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            body: Box::new(body),
        }
    }

    /// The migration's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn run(&self, ctx: &mut MigrationContext<'_>) -> Result<(), Error> {
        (self.body)(ctx)
    }
}

impl fmt::Debug for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Validated, lexicographically ordered set of declared migrations.
#[derive(Debug, Default)]
pub struct MigrationRegistry {
    migrations: Vec<Migration>,
}

impl MigrationRegistry {
    /// Build a registry from declarations, rejecting duplicate names and
    /// sorting lexicographically.
    pub fn from_declarations(declarations: Vec<Migration>) -> Result<Self, Error> {
        let mut seen = BTreeSet::new();
        for migration in &declarations {
            if !seen.insert(migration.name.clone()) {
                return Err(Error::DuplicateDefinition {
                    kind: "migration",
                    name: migration.name.clone(),
                });
            }
        }

        let mut migrations = declarations;
        migrations.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { migrations })
    }

    /// All migration names in execution order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.migrations.iter().map(|m| m.name())
    }

    /// Migrations not yet recorded in the ledger, in execution order.
    pub fn pending(&self, applied: &BTreeSet<String>) -> Vec<&Migration> {
        self.migrations
            .iter()
            .filter(|m| !applied.contains(&m.name))
            .collect()
    }

    /// Whether any declared migration has not been applied yet.
    pub fn has_pending(&self, applied: &BTreeSet<String>) -> bool {
        self.migrations.iter().any(|m| !applied.contains(&m.name))
    }

    /// Number of declared migrations.
    pub fn len(&self) -> usize {
        self.migrations.len()
    }

    /// Whether no migrations are declared.
    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(name: &str) -> Migration {
        Migration::new(name, |_| Ok(()))
    }

    #[test]
    fn test_registry_sorts_lexicographically() {
        let registry = MigrationRegistry::from_declarations(vec![
            noop("0002_add_flags"),
            noop("0001_backfill"),
            noop("0010_rename"),
        ])
        .unwrap();

        let names: Vec<_> = registry.names().collect();
        assert_eq!(names, vec!["0001_backfill", "0002_add_flags", "0010_rename"]);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let err = MigrationRegistry::from_declarations(vec![
            noop("0001_backfill"),
            noop("0001_backfill"),
        ])
        .unwrap_err();

        assert!(matches!(
            err,
            Error::DuplicateDefinition {
                kind: "migration",
                ..
            }
        ));
    }

    #[test]
    fn test_pending_filters_applied() {
        let registry = MigrationRegistry::from_declarations(vec![
            noop("0001_backfill"),
            noop("0002_add_flags"),
        ])
        .unwrap();

        let applied: BTreeSet<String> = ["0001_backfill".to_string()].into();
        let pending = registry.pending(&applied);
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].name(), "0002_add_flags");
        assert!(registry.has_pending(&applied));

        let all: BTreeSet<String> =
            ["0001_backfill".to_string(), "0002_add_flags".to_string()].into();
        assert!(registry.pending(&all).is_empty());
        assert!(!registry.has_pending(&all));
    }
}
