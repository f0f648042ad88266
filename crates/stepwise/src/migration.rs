//! The migration unit the engine runs
//!
//! A [`Migration`] wraps exactly one of a SQL body (parsed lazily, so
//! operations touching only recent versions never pay for parsing the whole
//! history) or a procedural body (registered apply/revert callbacks tagged
//! transaction-scoped or connection-scoped).

use std::fmt;
use std::fs;
use std::sync::OnceLock;
use std::time::Duration;

use futures_core::future::BoxFuture;
use serde::Serialize;
use sqlx::Database;

use crate::error::{MigrateError, MigrateResult};
use crate::parser::{self, ParsedSql};
use crate::source::{Source, SourceKind};

/// Direction of a migration run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    /// Apply the migration
    Up,
    /// Revert the migration
    Down,
}

impl Direction {
    pub fn is_up(self) -> bool {
        self == Direction::Up
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Up => "up",
            Direction::Down => "down",
        })
    }
}

/// Boxed async callback of a procedural migration.
///
/// The callback receives the live connection; when the migration is
/// transaction-scoped the connection is already inside a transaction managed
/// by the engine. Errors are opaque [`anyhow::Error`] values.
pub type MigrationFn<Db> = Box<
    dyn for<'c> Fn(&'c mut <Db as Database>::Connection) -> BoxFuture<'c, Result<(), anyhow::Error>>
        + Send
        + Sync,
>;

/// Transaction scoping of a procedural migration, fixed at registration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProceduralMode {
    /// Callbacks run inside an engine-managed transaction
    Transactional,
    /// Callbacks run directly against a live connection
    Direct,
}

/// A registered procedural migration: optional apply/revert callbacks plus
/// their transaction scoping. A missing callback is a recorded no-op.
pub struct Procedural<Db: Database> {
    pub(crate) mode: ProceduralMode,
    pub(crate) up: Option<MigrationFn<Db>>,
    pub(crate) down: Option<MigrationFn<Db>>,
}

impl<Db: Database> Procedural<Db> {
    /// A migration whose callbacks run inside a transaction.
    pub fn transactional(up: Option<MigrationFn<Db>>, down: Option<MigrationFn<Db>>) -> Self {
        Self {
            mode: ProceduralMode::Transactional,
            up,
            down,
        }
    }

    /// A migration whose callbacks run directly on a connection, outside any
    /// transaction (for statements that cannot run inside one).
    pub fn direct(up: Option<MigrationFn<Db>>, down: Option<MigrationFn<Db>>) -> Self {
        Self {
            mode: ProceduralMode::Direct,
            up,
            down,
        }
    }

    pub fn mode(&self) -> ProceduralMode {
        self.mode
    }
}

impl<Db: Database> fmt::Debug for Procedural<Db> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Procedural")
            .field("mode", &self.mode)
            .field("up", &self.up.is_some())
            .field("down", &self.down.is_some())
            .finish()
    }
}

pub(crate) enum MigrationBody<Db: Database> {
    Sql { parsed: OnceLock<ParsedSql> },
    Procedural(Procedural<Db>),
}

/// One versioned, reversible unit of schema change.
///
/// Built once per engine instance and read-only thereafter.
pub struct Migration<Db: Database> {
    source: Source,
    pub(crate) body: MigrationBody<Db>,
}

impl<Db: Database> Migration<Db> {
    pub(crate) fn sql(source: Source) -> Self {
        debug_assert_eq!(source.kind, SourceKind::Sql);
        Self {
            source,
            body: MigrationBody::Sql {
                parsed: OnceLock::new(),
            },
        }
    }

    pub(crate) fn procedural(source: Source, procedural: Procedural<Db>) -> Self {
        debug_assert_eq!(source.kind, SourceKind::Procedural);
        Self {
            source,
            body: MigrationBody::Procedural(procedural),
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn version(&self) -> i64 {
        self.source.version
    }

    /// Whether this migration's body runs inside a transaction.
    ///
    /// Forces the lazy parse for SQL migrations.
    pub fn use_tx(&self) -> MigrateResult<bool> {
        match &self.body {
            MigrationBody::Sql { parsed } => Ok(load_parsed(&self.source, parsed)?.use_tx),
            MigrationBody::Procedural(p) => Ok(p.mode == ProceduralMode::Transactional),
        }
    }

    /// Force the lazy parse without using the result. Called for a whole
    /// batch before execution starts so a parse error aborts before any
    /// database write.
    pub(crate) fn ensure_parsed(&self) -> MigrateResult<()> {
        if let MigrationBody::Sql { parsed } = &self.body {
            load_parsed(&self.source, parsed)?;
        }
        Ok(())
    }
}

/// Read and parse a SQL migration file on first use, caching the result for
/// the lifetime of the catalog. The cache always belongs to the migration
/// built from `source`.
pub(crate) fn load_parsed<'a>(
    source: &Source,
    cache: &'a OnceLock<ParsedSql>,
) -> MigrateResult<&'a ParsedSql> {
    if let Some(sql) = cache.get() {
        return Ok(sql);
    }
    let raw = fs::read_to_string(&source.path).map_err(|e| MigrateError::Io {
        path: source.path.clone(),
        source: e,
    })?;
    let sql = parser::parse_migration(&raw).map_err(|e| MigrateError::Parse {
        path: source.path.clone(),
        source: e,
    })?;
    Ok(cache.get_or_init(|| sql))
}

impl<Db: Database> fmt::Debug for Migration<Db> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migration")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// The outcome of running one migration in one direction.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationResult {
    pub source: Source,
    pub direction: Direction,
    pub duration: Duration,
    /// True when a syntactically valid migration produced no statements or no
    /// callback. It is still recorded as applied.
    pub empty: bool,
}
