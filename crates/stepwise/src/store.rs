//! Bookkeeping-table persistence
//!
//! One implementation per supported driver behind a common contract; the
//! implementations differ only in the SQL text they borrow from their
//! [`Dialect`](crate::dialect::Dialect) and in row decoding. The engine never
//! touches driver-specific SQL directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::dialect::Dialect;
use crate::error::{MigrateError, MigrateResult};

/// One bookkeeping row.
///
/// The surrogate `id` column orders recency; the *current* state of a version
/// is whatever its most recent row says, so revert-then-reapply sequences can
/// be reconstructed from history.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VersionRecord {
    pub version_id: i64,
    pub is_applied: bool,
    pub tstamp: DateTime<Utc>,
}

/// Dialect-specific persistence for the bookkeeping table.
///
/// Implemented directly on each driver's connection type so the orchestrator
/// can stay generic over [`sqlx::Database`]. `get_version` distinguishes
/// not-found ([`MigrateError::VersionNotFound`]) from failure;
/// `list_versions` returning zero rows is a valid state distinct from "table
/// does not exist" (the latter surfaces as a database error).
#[async_trait]
pub trait VersionStore: Send {
    fn dialect(&self) -> Dialect;

    /// Create the bookkeeping table if missing, seeding the synthetic
    /// version-0 applied row.
    async fn ensure_version_table(&mut self, table: &str) -> MigrateResult<()>;

    /// Insert one `(version_id, is_applied)` row.
    async fn insert_version(
        &mut self,
        table: &str,
        version: i64,
        is_applied: bool,
    ) -> MigrateResult<()>;

    /// Delete every row for a version (revert bookkeeping).
    async fn delete_version(&mut self, table: &str, version: i64) -> MigrateResult<()>;

    /// Fetch the most recent row for a version.
    async fn get_version(&mut self, table: &str, version: i64) -> MigrateResult<VersionRecord>;

    /// Fetch all rows ordered by recency, descending.
    async fn list_versions(&mut self, table: &str) -> MigrateResult<Vec<VersionRecord>>;
}

#[cfg(feature = "postgres")]
mod postgres {
    use super::*;
    use sqlx::{PgConnection, Row};

    #[async_trait]
    impl VersionStore for PgConnection {
        fn dialect(&self) -> Dialect {
            Dialect::Postgres
        }

        async fn ensure_version_table(&mut self, table: &str) -> MigrateResult<()> {
            // Probing with a list keeps "empty table" distinct from "missing
            // table": only a failed probe triggers creation.
            if self.list_versions(table).await.is_ok() {
                return Ok(());
            }
            let queries = Dialect::Postgres.queries();
            sqlx::query(&queries.create_table(table))
                .execute(&mut *self)
                .await?;
            self.insert_version(table, 0, true).await?;
            tracing::info!(table, "created migration bookkeeping table");
            Ok(())
        }

        async fn insert_version(
            &mut self,
            table: &str,
            version: i64,
            is_applied: bool,
        ) -> MigrateResult<()> {
            let sql = Dialect::Postgres.queries().insert_version(table);
            sqlx::query(&sql)
                .bind(version)
                .bind(is_applied)
                .execute(&mut *self)
                .await?;
            Ok(())
        }

        async fn delete_version(&mut self, table: &str, version: i64) -> MigrateResult<()> {
            let sql = Dialect::Postgres.queries().delete_version(table);
            sqlx::query(&sql).bind(version).execute(&mut *self).await?;
            Ok(())
        }

        async fn get_version(
            &mut self,
            table: &str,
            version: i64,
        ) -> MigrateResult<VersionRecord> {
            let sql = Dialect::Postgres.queries().select_version(table);
            let row = sqlx::query(&sql)
                .bind(version)
                .fetch_optional(&mut *self)
                .await?
                .ok_or(MigrateError::VersionNotFound(version))?;
            Ok(VersionRecord {
                version_id: row.try_get("version_id")?,
                is_applied: row.try_get("is_applied")?,
                tstamp: row.try_get("tstamp")?,
            })
        }

        async fn list_versions(&mut self, table: &str) -> MigrateResult<Vec<VersionRecord>> {
            let sql = Dialect::Postgres.queries().list_versions(table);
            let rows = sqlx::query(&sql).fetch_all(&mut *self).await?;
            rows.into_iter()
                .map(|row| {
                    Ok(VersionRecord {
                        version_id: row.try_get("version_id")?,
                        is_applied: row.try_get("is_applied")?,
                        tstamp: row.try_get("tstamp")?,
                    })
                })
                .collect()
        }
    }
}

#[cfg(feature = "mysql")]
mod mysql {
    use super::*;
    use sqlx::{MySqlConnection, Row};

    #[async_trait]
    impl VersionStore for MySqlConnection {
        fn dialect(&self) -> Dialect {
            Dialect::Mysql
        }

        async fn ensure_version_table(&mut self, table: &str) -> MigrateResult<()> {
            if self.list_versions(table).await.is_ok() {
                return Ok(());
            }
            let queries = Dialect::Mysql.queries();
            sqlx::query(&queries.create_table(table))
                .execute(&mut *self)
                .await?;
            self.insert_version(table, 0, true).await?;
            tracing::info!(table, "created migration bookkeeping table");
            Ok(())
        }

        async fn insert_version(
            &mut self,
            table: &str,
            version: i64,
            is_applied: bool,
        ) -> MigrateResult<()> {
            let sql = Dialect::Mysql.queries().insert_version(table);
            sqlx::query(&sql)
                .bind(version)
                .bind(is_applied)
                .execute(&mut *self)
                .await?;
            Ok(())
        }

        async fn delete_version(&mut self, table: &str, version: i64) -> MigrateResult<()> {
            let sql = Dialect::Mysql.queries().delete_version(table);
            sqlx::query(&sql).bind(version).execute(&mut *self).await?;
            Ok(())
        }

        async fn get_version(
            &mut self,
            table: &str,
            version: i64,
        ) -> MigrateResult<VersionRecord> {
            let sql = Dialect::Mysql.queries().select_version(table);
            let row = sqlx::query(&sql)
                .bind(version)
                .fetch_optional(&mut *self)
                .await?
                .ok_or(MigrateError::VersionNotFound(version))?;
            Ok(VersionRecord {
                version_id: row.try_get("version_id")?,
                is_applied: row.try_get("is_applied")?,
                tstamp: row.try_get("tstamp")?,
            })
        }

        async fn list_versions(&mut self, table: &str) -> MigrateResult<Vec<VersionRecord>> {
            let sql = Dialect::Mysql.queries().list_versions(table);
            let rows = sqlx::query(&sql).fetch_all(&mut *self).await?;
            rows.into_iter()
                .map(|row| {
                    Ok(VersionRecord {
                        version_id: row.try_get("version_id")?,
                        is_applied: row.try_get("is_applied")?,
                        tstamp: row.try_get("tstamp")?,
                    })
                })
                .collect()
        }
    }
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use chrono::NaiveDateTime;
    use sqlx::{Row, SqliteConnection};

    #[async_trait]
    impl VersionStore for SqliteConnection {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        async fn ensure_version_table(&mut self, table: &str) -> MigrateResult<()> {
            if self.list_versions(table).await.is_ok() {
                return Ok(());
            }
            let queries = Dialect::Sqlite.queries();
            sqlx::query(&queries.create_table(table))
                .execute(&mut *self)
                .await?;
            self.insert_version(table, 0, true).await?;
            tracing::info!(table, "created migration bookkeeping table");
            Ok(())
        }

        async fn insert_version(
            &mut self,
            table: &str,
            version: i64,
            is_applied: bool,
        ) -> MigrateResult<()> {
            let sql = Dialect::Sqlite.queries().insert_version(table);
            sqlx::query(&sql)
                .bind(version)
                .bind(is_applied)
                .execute(&mut *self)
                .await?;
            Ok(())
        }

        async fn delete_version(&mut self, table: &str, version: i64) -> MigrateResult<()> {
            let sql = Dialect::Sqlite.queries().delete_version(table);
            sqlx::query(&sql).bind(version).execute(&mut *self).await?;
            Ok(())
        }

        async fn get_version(
            &mut self,
            table: &str,
            version: i64,
        ) -> MigrateResult<VersionRecord> {
            let sql = Dialect::Sqlite.queries().select_version(table);
            let row = sqlx::query(&sql)
                .bind(version)
                .fetch_optional(&mut *self)
                .await?
                .ok_or(MigrateError::VersionNotFound(version))?;
            // SQLite stores datetime('now') as an offset-less string.
            let tstamp: NaiveDateTime = row.try_get("tstamp")?;
            Ok(VersionRecord {
                version_id: row.try_get("version_id")?,
                is_applied: row.try_get("is_applied")?,
                tstamp: tstamp.and_utc(),
            })
        }

        async fn list_versions(&mut self, table: &str) -> MigrateResult<Vec<VersionRecord>> {
            let sql = Dialect::Sqlite.queries().list_versions(table);
            let rows = sqlx::query(&sql).fetch_all(&mut *self).await?;
            rows.into_iter()
                .map(|row| {
                    let tstamp: NaiveDateTime = row.try_get("tstamp")?;
                    Ok(VersionRecord {
                        version_id: row.try_get("version_id")?,
                        is_applied: row.try_get("is_applied")?,
                        tstamp: tstamp.and_utc(),
                    })
                })
                .collect()
        }
    }
}
