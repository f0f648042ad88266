//! Filesystem scanning for migration files
//!
//! Scans a directory for `*.sql` and `*.rs` migration files, parses the
//! leading numeric version from each filename (`<version>_<description>.<ext>`)
//! and produces a deduplicated, version-keyed source catalog. SQL bodies are
//! not read here; parsing is deferred until a migration is about to run.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{MigrateError, MigrateResult};

/// What kind of migration a source file holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceKind {
    /// An annotated `.sql` file
    Sql,
    /// A Rust file whose migration is registered in code
    Procedural,
}

/// One discovered migration source.
///
/// Immutable once constructed. `path` is empty for procedural migrations that
/// were registered without a matching file on disk (e.g. compiled into a
/// binary whose sources are not visible to the catalog).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub kind: SourceKind,
    pub path: PathBuf,
    /// Ordering key: the integer prefix before the first `_`, always > 0
    pub version: i64,
}

/// Parse the version from a migration filename.
///
/// The version is the integer prefix before the first `_` in the base name
/// and must be positive. Version 0 is reserved for the synthetic root row.
pub fn version_from_filename(path: &Path) -> Result<i64, String> {
    let base = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| "not a valid file name".to_string())?;
    let (prefix, _) = base
        .split_once('_')
        .ok_or_else(|| "expected filename format <version>_<description>.<ext>".to_string())?;
    let version: i64 = prefix
        .parse()
        .map_err(|_| format!("version prefix {prefix:?} is not an integer"))?;
    if version < 1 {
        return Err(format!("version must be greater than zero, got {version}"));
    }
    Ok(version)
}

/// Scan a directory for migration sources.
///
/// In lenient mode (`strict = false`) files that do not look like migrations
/// are skipped, so unrelated files may live alongside migrations. Strict mode
/// turns a malformed migration-looking name into an error and is meant for
/// tooling that must guarantee no orphaned files exist. `excludes` holds base
/// filenames to skip; `*_test.rs` files are always skipped.
pub fn scan_directory(
    dir: &Path,
    excludes: &HashSet<String>,
    strict: bool,
) -> MigrateResult<Vec<Source>> {
    if !dir.is_dir() {
        return Err(MigrateError::DirectoryNotFound(dir.to_path_buf()));
    }

    let mut sources = Vec::new();
    let mut seen: HashMap<i64, PathBuf> = HashMap::new();

    let mut entries: Vec<PathBuf> = fs::read_dir(dir)
        .map_err(|e| MigrateError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| MigrateError::Io {
            path: dir.to_path_buf(),
            source: e,
        })?
        .into_iter()
        .map(|entry| entry.path())
        .collect();
    entries.sort();

    for path in entries {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let kind = match path.extension().and_then(|e| e.to_str()) {
            Some("sql") => SourceKind::Sql,
            Some("rs") if !name.ends_with("_test.rs") => SourceKind::Procedural,
            _ => continue,
        };
        if excludes.contains(name) {
            continue;
        }

        let version = match version_from_filename(&path) {
            Ok(v) => v,
            Err(reason) if strict => {
                return Err(MigrateError::InvalidFilename { path, reason });
            }
            Err(_) => continue,
        };

        if let Some(first) = seen.get(&version) {
            return Err(MigrateError::DuplicateVersion {
                version,
                first: first.clone(),
                second: path,
            });
        }
        seen.insert(version, path.clone());
        sources.push(Source {
            kind,
            path,
            version,
        });
    }

    sources.sort_by_key(|s| s.version);
    Ok(sources)
}
