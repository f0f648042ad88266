//! # stepwise: versioned SQL migrations for sqlx
//!
//! A database migration engine in the spirit of annotated-SQL migration
//! tools: migrations are plain `.sql` files carrying `-- +goose` directives
//! (plus optional procedural migrations written in Rust), tracked in a
//! bookkeeping table, and applied or reverted strictly one at a time.
//!
//! The entry point is [`Migrator`], built from a [`MigratorConfig`] and a
//! dedicated connection:
//!
//! ```no_run
//! use stepwise::{Migrator, MigratorConfig};
//! use sqlx::{Connection, PgConnection};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let conn = PgConnection::connect("postgres://localhost/app").await?;
//! let migrator = Migrator::<sqlx::Postgres>::new(conn, MigratorConfig::new("migrations"))?;
//! let applied = migrator.up().await?;
//! println!("applied {} migrations", applied.len());
//! # Ok(())
//! # }
//! ```

pub mod dialect;
pub mod error;
pub mod lock;
pub mod migration;
pub mod parser;
pub mod provider;
pub mod registry;
pub mod source;
pub mod store;

// Re-export the public surface
pub use dialect::Dialect;
pub use error::{MigrateError, MigrateResult, PartialError};
pub use lock::SessionLock;
pub use migration::{
    Direction, Migration, MigrationFn, MigrationResult, Procedural, ProceduralMode,
};
pub use parser::{parse_direction, parse_migration, ParseError, ParsedSql};
pub use provider::{
    Migrator, MigratorConfig, MigrationStatus, StatusState, DEFAULT_VERSION_TABLE,
};
pub use registry::ProceduralRegistry;
pub use source::{Source, SourceKind};
pub use store::{VersionRecord, VersionStore};
