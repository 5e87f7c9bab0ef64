//! Version resolution: decide the target version for an open, and
//! whether an upgrade runs at all.

use crate::error::Error;
use crate::migration::diff::{RemovedStorePolicy, SchemaDiff};
use crate::schema::{SchemaSnapshot, StoreSchema};
use tracing::warn;

/// How the target database version is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionStrategy {
    /// Derive the version: a fresh database opens at 1, and any safe
    /// schema change or pending migration bumps the current version by
    /// one.
    #[default]
    Auto,
    /// Pin the version. Safe changes and pending migrations are deferred
    /// (with warnings) until the pinned version is raised.
    Explicit(u64),
}

/// Outcome of version resolution.
#[derive(Debug)]
pub struct Resolution {
    /// Version the database will be opened at.
    pub target_version: u64,
    /// Persisted version before the open, `None` for a fresh database.
    pub current_version: Option<u64>,
    /// The classified schema diff (dangerous changes are empty here;
    /// resolution fails on them).
    pub diff: SchemaDiff,
    /// Warnings for safe changes and migrations deferred by a pinned
    /// version.
    pub deferred: Vec<String>,
}

impl Resolution {
    /// Whether this open runs an upgrade transaction.
    pub fn needs_upgrade(&self) -> bool {
        self.target_version > self.current_version.unwrap_or(0)
    }
}

/// Resolve the target version for an open.
///
/// Fails before any connection is made when the diff contains dangerous
/// changes, so the database is never touched by a declaration it cannot
/// satisfy safely.
pub fn resolve(
    current: Option<u64>,
    existing: &SchemaSnapshot,
    desired: &[StoreSchema],
    strategy: VersionStrategy,
    policy: RemovedStorePolicy,
    pending: &[String],
) -> Result<Resolution, Error> {
    if let VersionStrategy::Explicit(0) = strategy {
        return Err(Error::Configuration(
            "explicit database version must be at least 1".to_string(),
        ));
    }

    let diff = SchemaDiff::compute(existing, desired)
        .apply_removed_store_policy(policy, current.unwrap_or(0));

    if !diff.dangerous.is_empty() {
        return Err(Error::UnsafeSchemaChange {
            changes: diff.dangerous,
        });
    }

    let has_work = diff.has_changes() || !pending.is_empty();
    let mut deferred = Vec::new();

    let target_version = match strategy {
        VersionStrategy::Explicit(version) => {
            let cur = current.unwrap_or(0);
            if version > cur {
                version
            } else {
                // Pinned at the current version: nothing structural may
                // run, but declarations ahead of the pin are not an
                // error.
                if has_work {
                    for change in &diff.safe {
                        let message = format!(
                            "schema change deferred until version is raised above {cur}: {change}"
                        );
                        warn!("{message}");
                        deferred.push(message);
                    }
                    for name in pending {
                        let message = format!(
                            "migration '{name}' deferred until version is raised above {cur}"
                        );
                        warn!("{message}");
                        deferred.push(message);
                    }
                }
                cur
            }
        }
        VersionStrategy::Auto => match current {
            None => 1,
            Some(cur) if has_work => cur + 1,
            Some(cur) => cur,
        },
    };

    Ok(Resolution {
        target_version,
        current_version: current,
        diff,
        deferred,
    })
}
