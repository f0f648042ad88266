//! Procedural registry and catalog merge
//!
//! The registry is an explicit object constructed by the caller and handed to
//! the engine. There is no process-wide registration side channel, so
//! multiple independent engines in one process are safe. Merging reconciles
//! on-disk sources with registrations and produces one ascending-ordered,
//! version-unique migration list.

use std::collections::BTreeMap;
use std::path::PathBuf;

use sqlx::Database;

use crate::error::{MigrateError, MigrateResult};
use crate::migration::{Migration, Procedural};
use crate::source::{Source, SourceKind};

/// Caller-owned registry of procedural migrations, keyed by version.
pub struct ProceduralRegistry<Db: Database> {
    migrations: BTreeMap<i64, Procedural<Db>>,
}

impl<Db: Database> ProceduralRegistry<Db> {
    pub fn new() -> Self {
        Self {
            migrations: BTreeMap::new(),
        }
    }

    /// Register one procedural migration under a version.
    ///
    /// Registering the same version twice is a startup error.
    pub fn register(&mut self, version: i64, migration: Procedural<Db>) -> MigrateResult<()> {
        if self.migrations.contains_key(&version) {
            return Err(MigrateError::DuplicateRegistration(version));
        }
        self.migrations.insert(version, migration);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.migrations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.migrations.len()
    }
}

impl<Db: Database> Default for ProceduralRegistry<Db> {
    fn default() -> Self {
        Self::new()
    }
}

/// Merge filesystem sources with registered procedural migrations.
///
/// Every SQL source becomes an unparsed SQL migration. Every procedural
/// source found on disk must have a matching registration; files without one
/// are reported together in a single error: a migration file whose code
/// never registered itself is almost always a programmer error and is never
/// silently dropped. Registrations without an on-disk file are still included
/// with an empty path.
pub fn merge<Db: Database>(
    sources: Vec<Source>,
    registry: ProceduralRegistry<Db>,
) -> MigrateResult<Vec<Migration<Db>>> {
    let mut registered = registry.migrations;
    let mut migrations: Vec<Migration<Db>> = Vec::with_capacity(sources.len());
    let mut unregistered: Vec<PathBuf> = Vec::new();

    for source in sources {
        match source.kind {
            SourceKind::Sql => migrations.push(Migration::sql(source)),
            SourceKind::Procedural => match registered.remove(&source.version) {
                Some(procedural) => migrations.push(Migration::procedural(source, procedural)),
                None => unregistered.push(source.path),
            },
        }
    }

    if !unregistered.is_empty() {
        return Err(MigrateError::Unregistered(unregistered));
    }

    // Registrations with no matching file on disk (e.g. compiled into the
    // binary) are included with an empty path.
    for (version, procedural) in registered {
        let source = Source {
            kind: SourceKind::Procedural,
            path: PathBuf::new(),
            version,
        };
        migrations.push(Migration::procedural(source, procedural));
    }

    migrations.sort_by_key(|m| m.version());
    for pair in migrations.windows(2) {
        if pair[0].version() == pair[1].version() {
            return Err(MigrateError::DuplicateVersion {
                version: pair[0].version(),
                first: duplicate_origin(pair[0].source()),
                second: duplicate_origin(pair[1].source()),
            });
        }
    }
    Ok(migrations)
}

/// The path to name in a duplicate-version error. Registrations without an
/// on-disk file have no path to show.
fn duplicate_origin(source: &Source) -> PathBuf {
    if source.path.as_os_str().is_empty() {
        PathBuf::from("(procedural registration)")
    } else {
        source.path.clone()
    }
}
