//! Dialect strategies for bookkeeping-table SQL
//!
//! Each supported backend differs only in SQL text and placeholder syntax;
//! the call sequence is identical. Adding a dialect means adding one
//! [`DialectQueries`] implementation and one arm in the lookup, not touching
//! the engine.

use std::fmt;
use std::str::FromStr;

/// A supported database dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum Dialect {
    Postgres,
    Mysql,
    Sqlite,
}

impl Dialect {
    /// Look up the SQL strategy for this dialect.
    pub fn queries(self) -> &'static dyn DialectQueries {
        match self {
            Dialect::Postgres => &PostgresQueries,
            Dialect::Mysql => &MysqlQueries,
            Dialect::Sqlite => &SqliteQueries,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Dialect::Postgres => "postgres",
            Dialect::Mysql => "mysql",
            Dialect::Sqlite => "sqlite",
        };
        f.write_str(name)
    }
}

impl FromStr for Dialect {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "postgres" | "postgresql" | "pg" => Ok(Dialect::Postgres),
            "mysql" | "mariadb" => Ok(Dialect::Mysql),
            "sqlite" | "sqlite3" => Ok(Dialect::Sqlite),
            other => Err(format!("unknown dialect {other:?}")),
        }
    }
}

/// SQL text for the bookkeeping-table operations of one dialect.
///
/// The table name is interpolated as-is; it comes from the engine
/// configuration, never from untrusted input.
pub trait DialectQueries: Send + Sync {
    /// `CREATE TABLE` for the bookkeeping table
    fn create_table(&self, table: &str) -> String;
    /// Insert one `(version_id, is_applied)` row; two placeholders
    fn insert_version(&self, table: &str) -> String;
    /// Delete every row for a version; one placeholder
    fn delete_version(&self, table: &str) -> String;
    /// Latest row for a version; one placeholder
    fn select_version(&self, table: &str) -> String;
    /// All rows ordered by recency, descending
    fn list_versions(&self, table: &str) -> String;
}

struct PostgresQueries;

impl DialectQueries for PostgresQueries {
    fn create_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE {table} (\n    \
                id serial NOT NULL,\n    \
                version_id bigint NOT NULL,\n    \
                is_applied boolean NOT NULL,\n    \
                tstamp timestamptz NOT NULL DEFAULT now(),\n    \
                PRIMARY KEY (id)\n\
            )"
        )
    }

    fn insert_version(&self, table: &str) -> String {
        format!("INSERT INTO {table} (version_id, is_applied) VALUES ($1, $2)")
    }

    fn delete_version(&self, table: &str) -> String {
        format!("DELETE FROM {table} WHERE version_id = $1")
    }

    fn select_version(&self, table: &str) -> String {
        format!(
            "SELECT version_id, is_applied, tstamp FROM {table} \
             WHERE version_id = $1 ORDER BY id DESC LIMIT 1"
        )
    }

    fn list_versions(&self, table: &str) -> String {
        format!("SELECT version_id, is_applied, tstamp FROM {table} ORDER BY id DESC")
    }
}

struct MysqlQueries;

impl DialectQueries for MysqlQueries {
    fn create_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE {table} (\n    \
                id serial NOT NULL,\n    \
                version_id bigint NOT NULL,\n    \
                is_applied boolean NOT NULL,\n    \
                tstamp timestamp NOT NULL DEFAULT now(),\n    \
                PRIMARY KEY (id)\n\
            )"
        )
    }

    fn insert_version(&self, table: &str) -> String {
        format!("INSERT INTO {table} (version_id, is_applied) VALUES (?, ?)")
    }

    fn delete_version(&self, table: &str) -> String {
        format!("DELETE FROM {table} WHERE version_id = ?")
    }

    fn select_version(&self, table: &str) -> String {
        format!(
            "SELECT version_id, is_applied, tstamp FROM {table} \
             WHERE version_id = ? ORDER BY id DESC LIMIT 1"
        )
    }

    fn list_versions(&self, table: &str) -> String {
        format!("SELECT version_id, is_applied, tstamp FROM {table} ORDER BY id DESC")
    }
}

struct SqliteQueries;

impl DialectQueries for SqliteQueries {
    fn create_table(&self, table: &str) -> String {
        format!(
            "CREATE TABLE {table} (\n    \
                id INTEGER PRIMARY KEY AUTOINCREMENT,\n    \
                version_id INTEGER NOT NULL,\n    \
                is_applied INTEGER NOT NULL,\n    \
                tstamp TIMESTAMP NOT NULL DEFAULT (datetime('now'))\n\
            )"
        )
    }

    fn insert_version(&self, table: &str) -> String {
        format!("INSERT INTO {table} (version_id, is_applied) VALUES (?, ?)")
    }

    fn delete_version(&self, table: &str) -> String {
        format!("DELETE FROM {table} WHERE version_id = ?")
    }

    fn select_version(&self, table: &str) -> String {
        format!(
            "SELECT version_id, is_applied, tstamp FROM {table} \
             WHERE version_id = ? ORDER BY id DESC LIMIT 1"
        )
    }

    fn list_versions(&self, table: &str) -> String {
        format!("SELECT version_id, is_applied, tstamp FROM {table} ORDER BY id DESC")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dialect_names_round_trip() {
        for dialect in [Dialect::Postgres, Dialect::Mysql, Dialect::Sqlite] {
            assert_eq!(dialect.to_string().parse::<Dialect>().unwrap(), dialect);
        }
        assert!("oracle".parse::<Dialect>().is_err());
    }

    #[test]
    fn placeholder_syntax_follows_the_dialect() {
        let pg = Dialect::Postgres.queries().insert_version("v");
        assert!(pg.contains("$1"));
        let mysql = Dialect::Mysql.queries().insert_version("v");
        assert!(mysql.contains('?'));
        assert!(!mysql.contains('$'));
    }

    #[test]
    fn table_name_is_interpolated_everywhere() {
        let q = Dialect::Sqlite.queries();
        for sql in [
            q.create_table("book"),
            q.insert_version("book"),
            q.delete_version("book"),
            q.select_version("book"),
            q.list_versions("book"),
        ] {
            assert!(sql.contains("book"), "missing table name in {sql}");
        }
    }
}
