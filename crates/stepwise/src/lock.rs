//! Cross-process session lock
//!
//! A cooperative, database-backed mutual-exclusion primitive scoped to one
//! connection's lifetime, used to keep two processes from migrating the same
//! database concurrently. Postgres implements it with advisory locks; other
//! backends report [`MigrateError::LockingUnsupported`], which callers treat
//! as "locking unavailable" unless they explicitly asked for it.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use crate::error::{MigrateError, MigrateResult};

/// Engine-wide advisory lock key ("stepwise" as big-endian bytes).
pub const SESSION_LOCK_ID: i64 = 0x7374_6570_7769_7365;

/// Retry interval for both acquire and release.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_secs(2);
/// Contention is expected: keep retrying acquisition for a long time.
const LOCK_TIMEOUT: Duration = Duration::from_secs(15 * 60);
/// Release is best-effort and gives up quickly.
const UNLOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Session-scoped exclusive locking, bound to one physical connection.
#[async_trait]
pub trait SessionLock: Send {
    /// Try to take the lock once. `Ok(false)` means "busy" and is retryable.
    async fn try_lock_session(&mut self) -> MigrateResult<bool>;

    /// Release the lock once. `Ok(false)` means the lock was not held by this
    /// session.
    async fn unlock_session(&mut self) -> MigrateResult<bool>;
}

/// Acquire the session lock, retrying "busy" on a fixed interval up to a long
/// ceiling. Any error other than "busy" is fatal.
pub(crate) async fn acquire_session_lock<C: SessionLock>(conn: &mut C) -> MigrateResult<()> {
    let deadline = Instant::now() + LOCK_TIMEOUT;
    loop {
        if conn.try_lock_session().await? {
            tracing::debug!("acquired migration session lock");
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(MigrateError::LockTimeout);
        }
        tracing::debug!("migration session lock is busy, retrying");
        tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
    }
}

/// Release the session lock, best-effort with a short retry ceiling.
///
/// Failure is logged, never returned: the lock dies with the session anyway,
/// so a failed release cannot leave it permanently held.
pub(crate) async fn release_session_lock<C: SessionLock>(conn: &mut C) {
    let deadline = Instant::now() + UNLOCK_TIMEOUT;
    loop {
        match conn.unlock_session().await {
            Ok(true) => {
                tracing::debug!("released migration session lock");
                return;
            }
            Ok(false) => {
                if Instant::now() >= deadline {
                    tracing::warn!("gave up releasing migration session lock");
                    return;
                }
                tokio::time::sleep(LOCK_RETRY_INTERVAL).await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to release migration session lock");
                return;
            }
        }
    }
}

#[cfg(feature = "postgres")]
mod postgres {
    use super::*;
    use sqlx::{PgConnection, Row};

    #[async_trait]
    impl SessionLock for PgConnection {
        async fn try_lock_session(&mut self) -> MigrateResult<bool> {
            let row = sqlx::query("SELECT pg_try_advisory_lock($1)")
                .bind(SESSION_LOCK_ID)
                .fetch_one(&mut *self)
                .await?;
            Ok(row.try_get(0)?)
        }

        async fn unlock_session(&mut self) -> MigrateResult<bool> {
            let row = sqlx::query("SELECT pg_advisory_unlock($1)")
                .bind(SESSION_LOCK_ID)
                .fetch_one(&mut *self)
                .await?;
            Ok(row.try_get(0)?)
        }
    }
}

#[cfg(feature = "mysql")]
mod mysql {
    use super::*;
    use sqlx::MySqlConnection;

    #[async_trait]
    impl SessionLock for MySqlConnection {
        async fn try_lock_session(&mut self) -> MigrateResult<bool> {
            Err(MigrateError::LockingUnsupported)
        }

        async fn unlock_session(&mut self) -> MigrateResult<bool> {
            Err(MigrateError::LockingUnsupported)
        }
    }
}

#[cfg(feature = "sqlite")]
mod sqlite {
    use super::*;
    use sqlx::SqliteConnection;

    #[async_trait]
    impl SessionLock for SqliteConnection {
        async fn try_lock_session(&mut self) -> MigrateResult<bool> {
            Err(MigrateError::LockingUnsupported)
        }

        async fn unlock_session(&mut self) -> MigrateResult<bool> {
            Err(MigrateError::LockingUnsupported)
        }
    }
}
