//! Error types for the migration engine
//!
//! One crate-level taxonomy covering parse, catalog, ordering, state and
//! execution failures. Batch operations that fail partway return
//! [`PartialError`] so callers can learn exactly what committed.

use std::path::PathBuf;

use crate::migration::MigrationResult;
use crate::parser::ParseError;

/// Result type alias for migration operations
pub type MigrateResult<T> = Result<T, MigrateError>;

/// Error types for migration operations
#[derive(Debug, thiserror::Error)]
pub enum MigrateError {
    /// A migration file failed to parse
    #[error("failed to parse migration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    /// Two sources claim the same version
    #[error("duplicate migration version {version}: {} and {}", .first.display(), .second.display())]
    DuplicateVersion {
        version: i64,
        first: PathBuf,
        second: PathBuf,
    },

    /// A procedural migration was registered twice for the same version
    #[error("procedural migration version {0} is already registered")]
    DuplicateRegistration(i64),

    /// Procedural migration files found on disk with no matching registration
    #[error("unregistered procedural migration files: {}", format_paths(.0))]
    Unregistered(Vec<PathBuf>),

    /// The migrations directory does not exist
    #[error("migrations directory does not exist: {}", .0.display())]
    DirectoryNotFound(PathBuf),

    /// A filename could not be resolved to a version (strict mode only)
    #[error("invalid migration filename {}: {reason}", .path.display())]
    InvalidFilename { path: PathBuf, reason: String },

    /// Out-of-order migrations detected and not explicitly allowed
    #[error("found {} missing (out-of-order) migration(s) lower than the current database version: {}", .0.len(), format_paths(.0))]
    MissingMigrations(Vec<PathBuf>),

    /// No migration with the requested version exists
    #[error("no migration found for version {0}")]
    VersionNotFound(i64),

    /// The requested migration has already been applied
    #[error("migration version {0} is already applied")]
    AlreadyApplied(i64),

    /// The requested migration has never been applied
    #[error("migration version {0} is not applied")]
    NotApplied(i64),

    /// There is no pending migration left to apply or revert
    #[error("no next migration version")]
    NoNextVersion,

    /// The backend does not implement session-scoped locking
    #[error("session locking is not supported by this database backend")]
    LockingUnsupported,

    /// The session lock could not be acquired within the retry ceiling
    #[error("timed out waiting for the migration session lock")]
    LockTimeout,

    /// A batch operation failed after at least zero migrations succeeded
    #[error(transparent)]
    Partial(Box<PartialError>),

    /// A procedural migration callback failed
    #[error("procedural migration failed: {0}")]
    Procedural(anyhow::Error),

    /// Underlying database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Filesystem error while reading a migration
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl MigrateError {
    /// The results of migrations that committed before a batch failure.
    ///
    /// Empty for non-batch errors. Callers must never assume "error means
    /// nothing happened" without consulting this.
    pub fn applied(&self) -> &[MigrationResult] {
        match self {
            MigrateError::Partial(partial) => &partial.applied,
            _ => &[],
        }
    }
}

/// A batch failure that carries the partial-success list.
///
/// Returned instead of a bare error whenever an `up`/`down` family operation
/// fails after the batch was computed: `applied` holds every migration that
/// committed, `failed` identifies the one that did not.
#[derive(Debug, thiserror::Error)]
#[error(
    "migration {version} ({direction}) failed after {count} succeeded: {cause}",
    version = .failed.source.version,
    direction = .failed.direction,
    count = .applied.len(),
    cause = .cause
)]
pub struct PartialError {
    /// Results for migrations that committed before the failure
    pub applied: Vec<MigrationResult>,
    /// The migration that failed
    pub failed: MigrationResult,
    /// The underlying error
    #[source]
    pub cause: Box<MigrateError>,
}

impl From<PartialError> for MigrateError {
    fn from(err: PartialError) -> Self {
        MigrateError::Partial(Box::new(err))
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
