//! Migration orchestrator
//!
//! The top-level state machine: owns the merged migration list, a dedicated
//! connection, and the bookkeeping table name; decides which migrations to
//! run for each operation; executes them strictly sequentially with correct
//! transaction scoping; and reports partial success on failure.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Connection, Database, Executor, Pool};
use tokio::sync::Mutex;

use crate::error::{MigrateError, MigrateResult, PartialError};
use crate::lock::{self, SessionLock};
use crate::migration::{
    self, Direction, Migration, MigrationBody, MigrationResult, ProceduralMode,
};
use crate::registry::{self, ProceduralRegistry};
use crate::source::{scan_directory, Source};
use crate::store::{VersionRecord, VersionStore};

/// Default name of the bookkeeping table.
pub const DEFAULT_VERSION_TABLE: &str = "goose_db_version";

/// Reported state of one catalog migration.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationStatus {
    pub source: Source,
    pub state: StatusState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum StatusState {
    Pending,
    Applied { tstamp: DateTime<Utc> },
}

/// Configuration for a [`Migrator`].
#[derive(Debug, Clone)]
pub struct MigratorConfig {
    /// Directory holding migration files
    pub directory: PathBuf,
    /// Bookkeeping table name
    pub table: String,
    /// Permit out-of-order ("missing") migrations to be applied
    pub allow_missing: bool,
    /// Guard every operation with the cross-process session lock
    pub use_session_lock: bool,
    /// Base filenames to skip while scanning
    pub excludes: HashSet<String>,
}

impl MigratorConfig {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            table: DEFAULT_VERSION_TABLE.to_string(),
            allow_missing: false,
            use_session_lock: false,
            excludes: HashSet::new(),
        }
    }

    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn allow_missing(mut self, allow: bool) -> Self {
        self.allow_missing = allow;
        self
    }

    pub fn use_session_lock(mut self, lock: bool) -> Self {
        self.use_session_lock = lock;
        self
    }

    pub fn exclude(mut self, name: impl Into<String>) -> Self {
        self.excludes.insert(name.into());
        self
    }
}

enum OpKind {
    Up { target: i64, by_one: bool },
    Down { target: i64, by_one: bool },
    Apply { version: i64, direction: Direction },
}

/// The migration engine.
///
/// Owns a read-only migration catalog built once at construction (re-scanning
/// requires constructing a new `Migrator`) and one dedicated connection. A
/// per-instance mutex serializes operations, so two tasks sharing one
/// `Migrator` cannot interleave; the optional session lock adds cross-process
/// exclusion on top of that.
pub struct Migrator<Db: Database> {
    config: MigratorConfig,
    migrations: Vec<Migration<Db>>,
    pool: Option<Pool<Db>>,
    conn: Mutex<Db::Connection>,
}

impl<Db> Migrator<Db>
where
    Db: Database,
    Db::Connection: VersionStore + SessionLock,
    for<'c> &'c mut Db::Connection: Executor<'c, Database = Db>,
{
    /// Build a migrator over a dedicated connection with no procedural
    /// migrations.
    pub fn new(conn: Db::Connection, config: MigratorConfig) -> MigrateResult<Self> {
        Self::with_registry(conn, config, ProceduralRegistry::new())
    }

    /// Build a migrator over a dedicated connection, merging the filesystem
    /// catalog with the caller's procedural registry.
    pub fn with_registry(
        conn: Db::Connection,
        config: MigratorConfig,
        registry: ProceduralRegistry<Db>,
    ) -> MigrateResult<Self> {
        let sources = scan_directory(&config.directory, &config.excludes, false)?;
        let migrations = registry::merge(sources, registry)?;
        Ok(Self {
            config,
            migrations,
            pool: None,
            conn: Mutex::new(conn),
        })
    }

    /// Build a migrator that detaches one dedicated connection from the
    /// caller's pool and keeps the pool handle for connection-scoped
    /// procedural migrations.
    ///
    /// Do not cap the pool at exactly one connection when connection-scoped
    /// procedural migrations are registered and the session lock is enabled:
    /// the lock occupies the dedicated connection while the migration waits
    /// for a second one from the same pool, which deadlocks.
    pub async fn from_pool(
        pool: &Pool<Db>,
        config: MigratorConfig,
        registry: ProceduralRegistry<Db>,
    ) -> MigrateResult<Self> {
        let conn = pool.acquire().await?.detach();
        let mut migrator = Self::with_registry(conn, config, registry)?;
        migrator.pool = Some(pool.clone());
        Ok(migrator)
    }

    /// The merged, ascending-ordered migration catalog.
    pub fn migrations(&self) -> &[Migration<Db>] {
        &self.migrations
    }

    /// Apply every pending migration.
    pub async fn up(&self) -> MigrateResult<Vec<MigrationResult>> {
        self.execute_op(OpKind::Up {
            target: i64::MAX,
            by_one: false,
        })
        .await
    }

    /// Apply only the next pending migration.
    pub async fn up_by_one(&self) -> MigrateResult<MigrationResult> {
        let results = self
            .execute_op(OpKind::Up {
                target: i64::MAX,
                by_one: true,
            })
            .await?;
        results.into_iter().next().ok_or(MigrateError::NoNextVersion)
    }

    /// Apply pending migrations up to and including `target`.
    pub async fn up_to(&self, target: i64) -> MigrateResult<Vec<MigrationResult>> {
        self.execute_op(OpKind::Up {
            target,
            by_one: false,
        })
        .await
    }

    /// Revert the most recently applied migration.
    pub async fn down(&self) -> MigrateResult<MigrationResult> {
        let results = self
            .execute_op(OpKind::Down {
                target: 0,
                by_one: true,
            })
            .await?;
        results.into_iter().next().ok_or(MigrateError::NoNextVersion)
    }

    /// Revert applied migrations down to (but not including) `target`.
    ///
    /// `down_to(0)` reverts everything; version 0 is the synthetic root and
    /// reverting below it is a no-op, not an error.
    pub async fn down_to(&self, target: i64) -> MigrateResult<Vec<MigrationResult>> {
        self.execute_op(OpKind::Down {
            target,
            by_one: false,
        })
        .await
    }

    /// Apply or revert exactly one migration by version, regardless of its
    /// position in the catalog.
    pub async fn apply_version(
        &self,
        version: i64,
        direction: Direction,
    ) -> MigrateResult<MigrationResult> {
        let results = self
            .execute_op(OpKind::Apply { version, direction })
            .await?;
        results
            .into_iter()
            .next()
            .ok_or(MigrateError::VersionNotFound(version))
    }

    /// Classify every catalog migration as pending or applied.
    ///
    /// Read-only; never fails merely because migrations are pending.
    pub async fn status(&self) -> MigrateResult<Vec<MigrationStatus>> {
        let mut conn = self.conn.lock().await;
        let locked = self.config.use_session_lock;
        if locked {
            lock::acquire_session_lock(&mut *conn).await?;
        }
        let result = self.status_inner(&mut conn).await;
        if locked {
            lock::release_session_lock(&mut *conn).await;
        }
        result
    }

    /// The highest currently-applied version (0 on a fresh database).
    pub async fn current_version(&self) -> MigrateResult<i64> {
        let mut conn = self.conn.lock().await;
        let locked = self.config.use_session_lock;
        if locked {
            lock::acquire_session_lock(&mut *conn).await?;
        }
        let result = self.current_version_inner(&mut conn).await;
        if locked {
            lock::release_session_lock(&mut *conn).await;
        }
        result
    }

    async fn execute_op(&self, op: OpKind) -> MigrateResult<Vec<MigrationResult>> {
        let mut conn = self.conn.lock().await;
        let locked = self.config.use_session_lock;
        if locked {
            lock::acquire_session_lock(&mut *conn).await?;
        }
        let result = self.execute_op_inner(&mut conn, op).await;
        if locked {
            lock::release_session_lock(&mut *conn).await;
        }
        result
    }

    async fn execute_op_inner(
        &self,
        conn: &mut Db::Connection,
        op: OpKind,
    ) -> MigrateResult<Vec<MigrationResult>> {
        conn.ensure_version_table(&self.config.table).await?;

        let (batch, direction) = match op {
            OpKind::Up { target, by_one } => {
                let rows = conn.list_versions(&self.config.table).await?;
                let state = applied_state(&rows);
                let mut batch = plan_up(
                    &self.migrations,
                    &state,
                    target,
                    self.config.allow_missing,
                )?;
                if by_one {
                    if batch.is_empty() {
                        return Err(MigrateError::NoNextVersion);
                    }
                    batch.truncate(1);
                }
                (batch, Direction::Up)
            }
            OpKind::Down { target, by_one } => {
                let rows = conn.list_versions(&self.config.table).await?;
                let state = applied_state(&rows);
                let mut batch = plan_down(&self.migrations, &state, target)?;
                if by_one {
                    if batch.is_empty() {
                        return Err(MigrateError::NoNextVersion);
                    }
                    batch.truncate(1);
                }
                (batch, Direction::Down)
            }
            OpKind::Apply { version, direction } => {
                let idx = self
                    .migrations
                    .iter()
                    .position(|m| m.version() == version)
                    .ok_or(MigrateError::VersionNotFound(version))?;
                let exists = match conn.get_version(&self.config.table, version).await {
                    Ok(_) => true,
                    Err(MigrateError::VersionNotFound(_)) => false,
                    Err(e) => return Err(e),
                };
                match direction {
                    Direction::Up if exists => {
                        return Err(MigrateError::AlreadyApplied(version));
                    }
                    Direction::Down if !exists => {
                        return Err(MigrateError::NotApplied(version));
                    }
                    _ => {}
                }
                (vec![idx], direction)
            }
        };

        self.run_batch(conn, &batch, direction).await
    }

    async fn run_batch(
        &self,
        conn: &mut Db::Connection,
        batch: &[usize],
        direction: Direction,
    ) -> MigrateResult<Vec<MigrationResult>> {
        // Parse every SQL body up front so a malformed file anywhere in the
        // batch aborts before the first database write.
        for &idx in batch {
            self.migrations[idx].ensure_parsed()?;
        }

        let mut applied = Vec::with_capacity(batch.len());
        for &idx in batch {
            let migration = &self.migrations[idx];
            tracing::info!(
                version = migration.version(),
                direction = %direction,
                "running migration"
            );
            let start = Instant::now();
            match self.run_one(conn, migration, direction).await {
                Ok(empty) => {
                    let duration = start.elapsed();
                    tracing::info!(
                        version = migration.version(),
                        direction = %direction,
                        ?duration,
                        "migration finished"
                    );
                    applied.push(MigrationResult {
                        source: migration.source().clone(),
                        direction,
                        duration,
                        empty,
                    });
                }
                Err(cause) => {
                    tracing::error!(
                        version = migration.version(),
                        direction = %direction,
                        error = %cause,
                        "migration failed"
                    );
                    let failed = MigrationResult {
                        source: migration.source().clone(),
                        direction,
                        duration: start.elapsed(),
                        empty: false,
                    };
                    return Err(PartialError {
                        applied,
                        failed,
                        cause: Box::new(cause),
                    }
                    .into());
                }
            }
        }
        Ok(applied)
    }

    /// Run one migration with correct transaction scoping and record it.
    ///
    /// Returns whether the migration was empty (no statements / no callback).
    async fn run_one(
        &self,
        conn: &mut Db::Connection,
        migration: &Migration<Db>,
        direction: Direction,
    ) -> MigrateResult<bool> {
        if migration.use_tx()? {
            let mut tx = conn.begin().await?;
            match run_body(&mut *tx, migration, direction).await {
                Ok(empty) => {
                    record(&mut *tx, &self.config.table, migration.version(), direction).await?;
                    tx.commit().await?;
                    Ok(empty)
                }
                Err(e) => {
                    let _ = tx.rollback().await;
                    Err(e)
                }
            }
        } else {
            // No transaction: the bookkeeping write is not atomic with the
            // migration's effects. That is the documented trade-off for
            // statements that cannot run inside a transaction.
            let empty = match (&migration.body, &self.pool) {
                (MigrationBody::Procedural(p), Some(pool))
                    if p.mode() == ProceduralMode::Direct =>
                {
                    let mut pooled = pool.acquire().await?;
                    run_body(&mut *pooled, migration, direction).await?
                }
                _ => run_body(conn, migration, direction).await?,
            };
            record(conn, &self.config.table, migration.version(), direction).await?;
            Ok(empty)
        }
    }

    async fn status_inner(
        &self,
        conn: &mut Db::Connection,
    ) -> MigrateResult<Vec<MigrationStatus>> {
        conn.ensure_version_table(&self.config.table).await?;
        let mut statuses = Vec::with_capacity(self.migrations.len());
        for migration in &self.migrations {
            let state = match conn
                .get_version(&self.config.table, migration.version())
                .await
            {
                Ok(record) if record.is_applied => StatusState::Applied {
                    tstamp: record.tstamp,
                },
                Ok(_) | Err(MigrateError::VersionNotFound(_)) => StatusState::Pending,
                Err(e) => return Err(e),
            };
            statuses.push(MigrationStatus {
                source: migration.source().clone(),
                state,
            });
        }
        Ok(statuses)
    }

    async fn current_version_inner(&self, conn: &mut Db::Connection) -> MigrateResult<i64> {
        conn.ensure_version_table(&self.config.table).await?;
        let rows = conn.list_versions(&self.config.table).await?;
        Ok(applied_state(&rows).max)
    }
}

/// Run a migration body against an executor-capable connection.
async fn run_body<Db>(
    conn: &mut Db::Connection,
    migration: &Migration<Db>,
    direction: Direction,
) -> MigrateResult<bool>
where
    Db: Database,
    for<'c> &'c mut Db::Connection: Executor<'c, Database = Db>,
{
    match &migration.body {
        MigrationBody::Sql { parsed } => {
            let parsed = migration::load_parsed(migration.source(), parsed)?;
            let statements = match direction {
                Direction::Up => &parsed.up,
                Direction::Down => &parsed.down,
            };
            for statement in statements {
                (&mut *conn).execute(statement.as_str()).await?;
            }
            Ok(statements.is_empty())
        }
        MigrationBody::Procedural(procedural) => {
            let callback = match direction {
                Direction::Up => &procedural.up,
                Direction::Down => &procedural.down,
            };
            match callback {
                Some(callback) => {
                    callback(conn).await.map_err(MigrateError::Procedural)?;
                    Ok(false)
                }
                None => Ok(true),
            }
        }
    }
}

/// Write or delete the bookkeeping row for one executed migration.
async fn record<C: VersionStore + ?Sized>(
    conn: &mut C,
    table: &str,
    version: i64,
    direction: Direction,
) -> MigrateResult<()> {
    match direction {
        Direction::Up => conn.insert_version(table, version, true).await,
        Direction::Down => conn.delete_version(table, version).await,
    }
}

/// The currently-applied set derived from bookkeeping history.
///
/// Rows arrive recency-descending, so the first row seen for a version is its
/// current state. The synthetic version 0 is excluded.
#[derive(Debug, Default)]
struct AppliedState {
    applied: Vec<i64>, // ascending
    max: i64,
}

fn applied_state(rows: &[VersionRecord]) -> AppliedState {
    let mut seen = HashSet::new();
    let mut applied = Vec::new();
    for row in rows {
        if seen.insert(row.version_id) && row.is_applied && row.version_id > 0 {
            applied.push(row.version_id);
        }
    }
    applied.sort_unstable();
    let max = applied.last().copied().unwrap_or(0);
    AppliedState { applied, max }
}

/// Compute the up batch (catalog indices, in execution order).
///
/// Missing (out-of-order) migrations fail the whole operation unless
/// explicitly allowed, in which case they are queued first, ascending,
/// followed by new migrations in `(db_max, target]`.
fn plan_up<Db: Database>(
    migrations: &[Migration<Db>],
    state: &AppliedState,
    target: i64,
    allow_missing: bool,
) -> MigrateResult<Vec<usize>> {
    let applied: HashSet<i64> = state.applied.iter().copied().collect();

    let missing: Vec<usize> = migrations
        .iter()
        .enumerate()
        .filter(|(_, m)| m.version() < state.max && !applied.contains(&m.version()))
        .map(|(idx, _)| idx)
        .collect();
    if !missing.is_empty() && !allow_missing {
        let paths = missing
            .iter()
            .map(|&idx| migrations[idx].source().path.clone())
            .collect();
        return Err(MigrateError::MissingMigrations(paths));
    }

    let mut batch: Vec<usize> = missing
        .into_iter()
        .filter(|&idx| migrations[idx].version() <= target)
        .collect();
    for (idx, migration) in migrations.iter().enumerate() {
        let version = migration.version();
        if version > state.max && version <= target && !applied.contains(&version) {
            batch.push(idx);
        }
    }
    Ok(batch)
}

/// Compute the down batch: applied versions descending while above `target`.
///
/// An applied version with no catalog entry cannot be reverted and is an
/// error.
fn plan_down<Db: Database>(
    migrations: &[Migration<Db>],
    state: &AppliedState,
    target: i64,
) -> MigrateResult<Vec<usize>> {
    let index: HashMap<i64, usize> = migrations
        .iter()
        .enumerate()
        .map(|(idx, m)| (m.version(), idx))
        .collect();

    let mut batch = Vec::new();
    for &version in state.applied.iter().rev() {
        if version <= target {
            break;
        }
        match index.get(&version) {
            Some(&idx) => batch.push(idx),
            None => return Err(MigrateError::VersionNotFound(version)),
        }
    }
    Ok(batch)
}
