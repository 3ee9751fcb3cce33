//! Snapshot files: validation, checksums and atomic replacement.

use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};

use jobwatch_core::{Error, Result};
use rusqlite::{Connection, DatabaseName, OpenFlags};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::schema::REQUIRED_COLUMNS;

pub(crate) fn db_err(e: rusqlite::Error) -> Error {
    Error::Database(e.to_string())
}

/// Validate a store file without modifying it.
///
/// Runs SQLite's own integrity check and verifies that every required
/// table and column exists. Returns the list of problems found.
pub fn validate_file(path: &Path) -> std::result::Result<(), Vec<String>> {
    if !path.exists() {
        return Err(vec![format!("{} does not exist", path.display())]);
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(|e| vec![format!("open failed: {}", e)])?;
    validate_connection(&conn)
}

/// Validate the schema and page structure of an open database.
pub fn validate_connection(conn: &Connection) -> std::result::Result<(), Vec<String>> {
    let mut errors = Vec::new();

    match integrity_rows(conn) {
        Ok(rows) => {
            if rows.len() != 1 || rows[0] != "ok" {
                errors.extend(rows.into_iter().map(|r| format!("integrity_check: {}", r)));
            }
        }
        Err(e) => {
            errors.push(format!("integrity_check failed: {}", e));
            return Err(errors);
        }
    }

    for (table, columns) in REQUIRED_COLUMNS {
        match column_names(conn, table) {
            Ok(existing) if existing.is_empty() => {
                errors.push(format!("missing table '{}'", table));
            }
            Ok(existing) => {
                for column in columns.iter() {
                    if !existing.iter().any(|c| c == column) {
                        errors.push(format!("missing column '{}.{}'", table, column));
                    }
                }
            }
            Err(e) => errors.push(format!("table_info({}) failed: {}", table, e)),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn integrity_rows(conn: &Connection) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare("PRAGMA integrity_check")?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn column_names(conn: &Connection, table: &str) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(names)
}

/// Hex-encoded SHA-256 of a file's bytes.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Sibling temporary path used while writing `path`.
pub(crate) fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `conn` to a temporary sibling of `dest`, validate it, flush it,
/// then rename it over `dest`. `dest` is never observed half-written.
pub fn write_snapshot(conn: &Connection, dest: &Path) -> Result<()> {
    let tmp = tmp_path(dest);
    if tmp.exists() {
        fs::remove_file(&tmp)?;
    }

    conn.backup(DatabaseName::Main, &tmp, None).map_err(db_err)?;

    if let Err(errors) = validate_file(&tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(Error::Integrity(format!(
            "snapshot failed validation: {}",
            errors.join("; ")
        )));
    }

    File::open(&tmp)?.sync_all()?;
    fs::rename(&tmp, dest)?;
    sync_parent(dest);
    debug!("Snapshot written to {}", dest.display());
    Ok(())
}

/// Write a small text file atomically (used for checksum sidecars).
pub(crate) fn write_text_atomic(dest: &Path, contents: &str) -> Result<()> {
    let tmp = tmp_path(dest);
    fs::write(&tmp, contents)?;
    File::open(&tmp)?.sync_all()?;
    fs::rename(&tmp, dest)?;
    sync_parent(dest);
    Ok(())
}

#[cfg(unix)]
pub(crate) fn sync_parent(path: &Path) {
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
}

#[cfg(not(unix))]
pub(crate) fn sync_parent(_path: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SCHEMA_SQL;

    fn schema_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        conn
    }

    #[test]
    fn test_snapshot_roundtrip_validates() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("jobs.sqlite");
        write_snapshot(&schema_conn(), &dest).unwrap();
        assert!(dest.exists());
        assert!(!tmp_path(&dest).exists());
        assert!(validate_file(&dest).is_ok());
    }

    #[test]
    fn test_garbage_file_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.sqlite");
        fs::write(&path, b"this is not a database at all, just some bytes").unwrap();
        assert!(validate_file(&path).is_err());
    }

    #[test]
    fn test_missing_tables_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("jobs.sqlite");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch("CREATE TABLE postings (id INTEGER PRIMARY KEY);")
            .unwrap();
        drop(conn);

        let errors = validate_file(&path).unwrap_err();
        assert!(errors.iter().any(|e| e.contains("postings.title")));
        assert!(errors.iter().any(|e| e.contains("missing table 'score_records'")));
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
