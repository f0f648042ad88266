#![cfg(feature = "sqlite")]

//! End-to-end engine tests against file-backed SQLite databases.

use std::path::Path;

use futures_core::future::BoxFuture;
use sqlx::{Connection, Row, SqliteConnection};

use stepwise::{
    Direction, MigrateError, Migrator, MigratorConfig, Procedural, ProceduralRegistry,
    StatusState,
};

async fn connect(db: &Path) -> SqliteConnection {
    let url = format!("sqlite://{}?mode=rwc", db.display());
    SqliteConnection::connect(&url).await.unwrap()
}

async fn migrator(db: &Path, config: MigratorConfig) -> Migrator<sqlx::Sqlite> {
    let conn = connect(db).await;
    Migrator::new(conn, config).unwrap_or_else(|e| panic!("migrator: {e}"))
}

fn write_sql(dir: &Path, name: &str, body: &str) {
    std::fs::write(dir.join(name), body).unwrap();
}

fn simple_migration(table: &str) -> String {
    format!(
        "-- +goose Up\nCREATE TABLE {table} (id INTEGER PRIMARY KEY);\n\
         -- +goose Down\nDROP TABLE {table};\n"
    )
}

async fn table_exists(conn: &mut SqliteConnection, table: &str) -> bool {
    sqlx::query("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?")
        .bind(table)
        .fetch_optional(conn)
        .await
        .unwrap()
        .is_some()
}

#[tokio::test]
async fn up_status_and_down_round_out_the_lifecycle() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("migrations");
    std::fs::create_dir(&dir).unwrap();
    let db = tmp.path().join("app.db");

    write_sql(&dir, "1_users.sql", &simple_migration("users"));
    write_sql(&dir, "2_posts.sql", &simple_migration("posts"));
    write_sql(&dir, "3_tags.sql", &simple_migration("tags"));

    let m = migrator(&db, MigratorConfig::new(&dir)).await;

    let applied = m.up().await.unwrap();
    assert_eq!(applied.len(), 3);
    assert!(applied.iter().all(|r| r.direction == Direction::Up));
    assert_eq!(m.current_version().await.unwrap(), 3);

    let statuses = m.status().await.unwrap();
    assert!(statuses
        .iter()
        .all(|s| matches!(s.state, StatusState::Applied { .. })));

    // A second up has nothing to do.
    assert!(m.up().await.unwrap().is_empty());

    let mut conn = connect(&db).await;
    assert!(table_exists(&mut conn, "users").await);
    assert!(table_exists(&mut conn, "posts").await);

    let reverted = m.down_to(0).await.unwrap();
    let versions: Vec<i64> = reverted.iter().map(|r| r.source.version).collect();
    assert_eq!(versions, vec![3, 2, 1]);
    assert_eq!(m.current_version().await.unwrap(), 0);
    assert!(!table_exists(&mut conn, "users").await);

    let statuses = m.status().await.unwrap();
    assert!(statuses.iter().all(|s| s.state == StatusState::Pending));
}

#[tokio::test]
async fn up_by_one_steps_through_the_catalog() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("migrations");
    std::fs::create_dir(&dir).unwrap();
    let db = tmp.path().join("app.db");

    write_sql(&dir, "1_a.sql", &simple_migration("a"));
    write_sql(&dir, "2_b.sql", &simple_migration("b"));

    let m = migrator(&db, MigratorConfig::new(&dir)).await;

    assert_eq!(m.up_by_one().await.unwrap().source.version, 1);
    assert_eq!(m.up_by_one().await.unwrap().source.version, 2);
    assert!(matches!(
        m.up_by_one().await.unwrap_err(),
        MigrateError::NoNextVersion
    ));

    // down() reverts only the most recent.
    assert_eq!(m.down().await.unwrap().source.version, 2);
    assert_eq!(m.current_version().await.unwrap(), 1);
}

#[tokio::test]
async fn up_to_stops_at_the_target() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("migrations");
    std::fs::create_dir(&dir).unwrap();
    let db = tmp.path().join("app.db");

    for v in 1..=4 {
        write_sql(&dir, &format!("{v}_t{v}.sql"), &simple_migration(&format!("t{v}")));
    }

    let m = migrator(&db, MigratorConfig::new(&dir)).await;
    let applied = m.up_to(2).await.unwrap();
    assert_eq!(applied.len(), 2);
    assert_eq!(m.current_version().await.unwrap(), 2);
}

#[tokio::test]
async fn out_of_order_migrations_are_rejected_then_front_run_when_allowed() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("migrations");
    std::fs::create_dir(&dir).unwrap();
    let db = tmp.path().join("app.db");

    for v in [1, 2, 3, 5, 7] {
        write_sql(&dir, &format!("{v}_t{v}.sql"), &simple_migration(&format!("t{v}")));
    }
    let m = migrator(&db, MigratorConfig::new(&dir)).await;
    m.up().await.unwrap();
    assert_eq!(m.current_version().await.unwrap(), 7);

    // Merged late from another branch.
    write_sql(&dir, "4_t4.sql", &simple_migration("t4"));
    write_sql(&dir, "6_t6.sql", &simple_migration("t6"));

    let m = migrator(&db, MigratorConfig::new(&dir)).await;
    match m.up().await.unwrap_err() {
        MigrateError::MissingMigrations(paths) => {
            assert_eq!(paths.len(), 2);
            assert!(paths[0].ends_with("4_t4.sql"));
            assert!(paths[1].ends_with("6_t6.sql"));
        }
        other => panic!("unexpected error: {other}"),
    }

    let m = migrator(&db, MigratorConfig::new(&dir).allow_missing(true)).await;
    let applied = m.up().await.unwrap();
    let versions: Vec<i64> = applied.iter().map(|r| r.source.version).collect();
    assert_eq!(versions, vec![4, 6]);
    assert_eq!(m.current_version().await.unwrap(), 7);
}

#[tokio::test]
async fn a_failing_migration_reports_partial_progress_and_rolls_back() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("migrations");
    std::fs::create_dir(&dir).unwrap();
    let db = tmp.path().join("app.db");

    write_sql(&dir, "1_ok.sql", &simple_migration("ok"));
    // The first statement succeeds; the second fails. The transaction must
    // undo the first.
    write_sql(
        &dir,
        "2_broken.sql",
        "-- +goose Up\n\
         CREATE TABLE partial_probe (id INTEGER PRIMARY KEY);\n\
         INSERT INTO no_such_table VALUES (1);\n\
         -- +goose Down\n\
         DROP TABLE partial_probe;\n",
    );
    write_sql(&dir, "3_never.sql", &simple_migration("never"));

    let m = migrator(&db, MigratorConfig::new(&dir)).await;
    let err = m.up().await.unwrap_err();
    match &err {
        MigrateError::Partial(partial) => {
            assert_eq!(partial.applied.len(), 1);
            assert_eq!(partial.applied[0].source.version, 1);
            assert_eq!(partial.failed.source.version, 2);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(err.applied().len(), 1);

    let mut conn = connect(&db).await;
    assert!(table_exists(&mut conn, "ok").await);
    assert!(!table_exists(&mut conn, "partial_probe").await);
    assert!(!table_exists(&mut conn, "never").await);
    assert_eq!(m.current_version().await.unwrap(), 1);
}

#[tokio::test]
async fn a_parse_error_anywhere_aborts_before_any_write() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("migrations");
    std::fs::create_dir(&dir).unwrap();
    let db = tmp.path().join("app.db");

    write_sql(&dir, "1_ok.sql", &simple_migration("ok"));
    write_sql(&dir, "2_bad.sql", "CREATE TABLE nope (id INTEGER);\n");

    let m = migrator(&db, MigratorConfig::new(&dir)).await;
    assert!(matches!(
        m.up().await.unwrap_err(),
        MigrateError::Parse { .. }
    ));

    // Migration 1 parsed fine but must not have run.
    let mut conn = connect(&db).await;
    assert!(!table_exists(&mut conn, "ok").await);
    assert_eq!(m.current_version().await.unwrap(), 0);
}

#[tokio::test]
async fn no_transaction_migrations_still_run_and_record() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("migrations");
    std::fs::create_dir(&dir).unwrap();
    let db = tmp.path().join("app.db");

    write_sql(
        &dir,
        "1_raw.sql",
        "-- +goose NO TRANSACTION\n\
         -- +goose Up\n\
         CREATE TABLE raw_table (id INTEGER PRIMARY KEY);\n\
         -- +goose Down\n\
         DROP TABLE raw_table;\n",
    );

    let m = migrator(&db, MigratorConfig::new(&dir)).await;
    let applied = m.up().await.unwrap();
    assert_eq!(applied.len(), 1);
    assert!(!applied[0].empty);
    assert_eq!(m.current_version().await.unwrap(), 1);

    m.down().await.unwrap();
    assert_eq!(m.current_version().await.unwrap(), 0);
}

#[tokio::test]
async fn empty_migrations_are_recorded_as_applied() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("migrations");
    std::fs::create_dir(&dir).unwrap();
    let db = tmp.path().join("app.db");

    write_sql(&dir, "1_noop.sql", "-- +goose Up\n-- +goose Down\n");

    let m = migrator(&db, MigratorConfig::new(&dir)).await;
    let result = m.up_by_one().await.unwrap();
    assert!(result.empty);
    assert_eq!(m.current_version().await.unwrap(), 1);
}

fn seed_rows(conn: &mut SqliteConnection) -> BoxFuture<'_, Result<(), anyhow::Error>> {
    Box::pin(async move {
        sqlx::query("CREATE TABLE seeded (id INTEGER PRIMARY KEY, name TEXT)")
            .execute(&mut *conn)
            .await?;
        sqlx::query("INSERT INTO seeded (name) VALUES ('first')")
            .execute(&mut *conn)
            .await?;
        Ok(())
    })
}

fn unseed_rows(conn: &mut SqliteConnection) -> BoxFuture<'_, Result<(), anyhow::Error>> {
    Box::pin(async move {
        sqlx::query("DROP TABLE seeded").execute(&mut *conn).await?;
        Ok(())
    })
}

#[tokio::test]
async fn procedural_migrations_interleave_with_sql_ones() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("migrations");
    std::fs::create_dir(&dir).unwrap();
    let db = tmp.path().join("app.db");

    write_sql(&dir, "1_users.sql", &simple_migration("users"));

    let mut registry: ProceduralRegistry<sqlx::Sqlite> = ProceduralRegistry::new();
    registry
        .register(
            2,
            Procedural::transactional(Some(Box::new(seed_rows)), Some(Box::new(unseed_rows))),
        )
        .unwrap();

    let conn = connect(&db).await;
    let m = Migrator::with_registry(conn, MigratorConfig::new(&dir), registry).unwrap();

    let applied = m.up().await.unwrap();
    let versions: Vec<i64> = applied.iter().map(|r| r.source.version).collect();
    assert_eq!(versions, vec![1, 2]);

    let mut conn = connect(&db).await;
    let count: i64 = sqlx::query("SELECT count(*) AS n FROM seeded")
        .fetch_one(&mut conn)
        .await
        .unwrap()
        .try_get("n")
        .unwrap();
    assert_eq!(count, 1);

    m.down().await.unwrap();
    assert!(!table_exists(&mut conn, "seeded").await);
}

#[tokio::test]
async fn apply_version_targets_a_single_migration() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("migrations");
    std::fs::create_dir(&dir).unwrap();
    let db = tmp.path().join("app.db");

    write_sql(&dir, "1_a.sql", &simple_migration("a"));
    write_sql(&dir, "2_b.sql", &simple_migration("b"));

    let m = migrator(&db, MigratorConfig::new(&dir)).await;

    // Apply 2 without 1.
    let result = m.apply_version(2, Direction::Up).await.unwrap();
    assert_eq!(result.source.version, 2);

    assert!(matches!(
        m.apply_version(2, Direction::Up).await.unwrap_err(),
        MigrateError::AlreadyApplied(2)
    ));
    assert!(matches!(
        m.apply_version(1, Direction::Down).await.unwrap_err(),
        MigrateError::NotApplied(1)
    ));
    assert!(matches!(
        m.apply_version(99, Direction::Up).await.unwrap_err(),
        MigrateError::VersionNotFound(99)
    ));

    m.apply_version(2, Direction::Down).await.unwrap();
    assert_eq!(m.current_version().await.unwrap(), 0);
}

#[tokio::test]
async fn status_is_stable_across_calls() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("migrations");
    std::fs::create_dir(&dir).unwrap();
    let db = tmp.path().join("app.db");

    write_sql(&dir, "1_a.sql", &simple_migration("a"));
    write_sql(&dir, "2_b.sql", &simple_migration("b"));

    let m = migrator(&db, MigratorConfig::new(&dir)).await;
    m.up_by_one().await.unwrap();

    let first = m.status().await.unwrap();
    let second = m.status().await.unwrap();
    assert_eq!(first, second);
    assert!(matches!(first[0].state, StatusState::Applied { .. }));
    assert_eq!(first[1].state, StatusState::Pending);
}

#[tokio::test]
async fn session_lock_is_reported_unsupported_on_sqlite() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = tmp.path().join("migrations");
    std::fs::create_dir(&dir).unwrap();
    let db = tmp.path().join("app.db");
    write_sql(&dir, "1_a.sql", &simple_migration("a"));

    let m = migrator(&db, MigratorConfig::new(&dir).use_session_lock(true)).await;
    assert!(matches!(
        m.up().await.unwrap_err(),
        MigrateError::LockingUnsupported
    ));
}
