//! Timestamped, checksummed backup generations.
//!
//! Each generation is `jobs-<UTC timestamp>.sqlite` plus a
//! `jobs-<UTC timestamp>.sqlite.sha256` sidecar holding the hex digest of
//! the file. A generation without a matching sidecar is never restored.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDateTime, Utc};
use jobwatch_core::{Error, Result};
use rusqlite::{Connection, DatabaseName};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::snapshot::{db_err, sha256_file, sync_parent, tmp_path, validate_file, write_text_atomic};

const PREFIX: &str = "jobs-";
const SUFFIX: &str = ".sqlite";
const CHECKSUM_SUFFIX: &str = ".sha256";
const STAMP_FORMAT: &str = "%Y%m%dT%H%M%S%.3fZ";

/// One backup generation on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupInfo {
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// Checksum sidecar exists and matches.
    pub checksum_valid: bool,
}

/// Manages backup generations in one directory.
pub struct BackupManager {
    dir: PathBuf,
    max_backups: usize,
}

impl BackupManager {
    pub fn new(dir: impl AsRef<Path>, max_backups: usize) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir, max_backups })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot `conn` into a new generation.
    pub fn create(&self, conn: &Connection, now: DateTime<Utc>) -> Result<BackupInfo> {
        // Bump by a millisecond until the name is free.
        let mut stamp = now;
        let (name, path) = loop {
            let name = format!("{}{}{}", PREFIX, stamp.format(STAMP_FORMAT), SUFFIX);
            let path = self.dir.join(&name);
            if !path.exists() {
                break (name, path);
            }
            stamp += chrono::Duration::milliseconds(1);
        };

        let tmp = tmp_path(&path);
        if tmp.exists() {
            fs::remove_file(&tmp)?;
        }
        conn.backup(DatabaseName::Main, &tmp, None).map_err(db_err)?;
        if let Err(errors) = validate_file(&tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(Error::Integrity(format!(
                "backup failed validation: {}",
                errors.join("; ")
            )));
        }
        fs::File::open(&tmp)?.sync_all()?;
        let checksum = sha256_file(&tmp)?;

        fs::rename(&tmp, &path)?;
        sync_parent(&path);
        write_text_atomic(&checksum_path(&path), &format!("{}\n", checksum))?;

        let size_bytes = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
        info!("Backup created: {} ({} bytes)", name, size_bytes);

        Ok(BackupInfo {
            name,
            path,
            created_at: stamp,
            size_bytes,
            checksum_valid: true,
        })
    }

    /// All generations, newest first.
    pub fn list(&self) -> Result<Vec<BackupInfo>> {
        let mut backups = Vec::new();
        if !self.dir.exists() {
            return Ok(backups);
        }
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(created_at) = parse_generation_name(&name) else {
                continue;
            };
            let path = entry.path();
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let checksum_valid = checksum_matches(&path);
            backups.push(BackupInfo {
                name,
                path,
                created_at,
                size_bytes,
                checksum_valid,
            });
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.name.cmp(&a.name)));
        Ok(backups)
    }

    /// Creation time of the newest generation.
    pub fn latest_created_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.list()?.first().map(|b| b.created_at))
    }

    /// A generation is restorable when its checksum matches and the file
    /// passes structural validation.
    pub fn verify(&self, backup: &BackupInfo) -> std::result::Result<(), Vec<String>> {
        if !checksum_matches(&backup.path) {
            return Err(vec![format!("checksum mismatch or missing for {}", backup.name)]);
        }
        validate_file(&backup.path)
    }

    /// Newest generation that verifies.
    pub fn latest_valid(&self) -> Result<Option<BackupInfo>> {
        for backup in self.list()? {
            match self.verify(&backup) {
                Ok(()) => return Ok(Some(backup)),
                Err(errors) => warn!("Skipping backup {}: {}", backup.name, errors.join("; ")),
            }
        }
        Ok(None)
    }

    /// Delete the oldest generations beyond `max_backups`. Returns the
    /// number removed.
    pub fn prune(&self) -> Result<usize> {
        let backups = self.list()?;
        let mut removed = 0;
        for backup in backups.iter().skip(self.max_backups) {
            fs::remove_file(&backup.path)?;
            let sidecar = checksum_path(&backup.path);
            if sidecar.exists() {
                fs::remove_file(&sidecar)?;
            }
            debug!("Pruned backup {}", backup.name);
            removed += 1;
        }
        if removed > 0 {
            info!("Pruned {} backups (keeping {})", removed, self.max_backups);
        }
        Ok(removed)
    }
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(CHECKSUM_SUFFIX);
    path.with_file_name(name)
}

fn checksum_matches(path: &Path) -> bool {
    let Ok(expected) = fs::read_to_string(checksum_path(path)) else {
        return false;
    };
    match sha256_file(path) {
        Ok(actual) => actual == expected.trim(),
        Err(_) => false,
    }
}

fn parse_generation_name(name: &str) -> Option<DateTime<Utc>> {
    let stamp = name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?;
    NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT)
        .ok()
        .map(|dt| dt.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SCHEMA_SQL;
    use chrono::TimeZone;

    fn conn_with_marker(title: &str) -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        conn.execute(
            "INSERT INTO postings (source_type, external_id, source_id, title, location, description, url, content_hash, first_seen_at, last_seen_at)
             VALUES ('greenhouse', '1', 's', ?1, '', '', '', 'h', 0, 0)",
            [title],
        )
        .unwrap();
        conn
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_790_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_create_writes_sidecar_and_lists_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path(), 5).unwrap();
        mgr.create(&conn_with_marker("a"), at(0)).unwrap();
        mgr.create(&conn_with_marker("b"), at(60)).unwrap();

        let list = mgr.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].created_at, at(60));
        assert!(list.iter().all(|b| b.checksum_valid));
        assert!(checksum_path(&list[0].path).exists());
    }

    #[test]
    fn test_same_timestamp_does_not_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path(), 5).unwrap();
        let first = mgr.create(&conn_with_marker("a"), at(0)).unwrap();
        let second = mgr.create(&conn_with_marker("b"), at(0)).unwrap();
        assert_ne!(first.name, second.name);
        assert_eq!(mgr.list().unwrap().len(), 2);
    }

    #[test]
    fn test_prune_keeps_newest() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path(), 2).unwrap();
        for i in 0..4 {
            mgr.create(&conn_with_marker("x"), at(i * 60)).unwrap();
        }
        assert_eq!(mgr.prune().unwrap(), 2);

        let list = mgr.list().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].created_at, at(180));
        assert_eq!(list[1].created_at, at(120));
        let sidecars = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(CHECKSUM_SUFFIX)
            })
            .count();
        assert_eq!(sidecars, 2);
    }

    #[test]
    fn test_latest_valid_skips_corrupt_generation() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path(), 5).unwrap();
        let older = mgr.create(&conn_with_marker("older"), at(0)).unwrap();
        let newer = mgr.create(&conn_with_marker("newer"), at(60)).unwrap();

        // Flip bytes in the newest generation; its sidecar no longer matches.
        let mut bytes = fs::read(&newer.path).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        fs::write(&newer.path, bytes).unwrap();

        let chosen = mgr.latest_valid().unwrap().unwrap();
        assert_eq!(chosen.name, older.name);
    }

    #[test]
    fn test_generation_without_sidecar_is_not_restorable() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = BackupManager::new(dir.path(), 5).unwrap();
        let info = mgr.create(&conn_with_marker("a"), at(0)).unwrap();
        fs::remove_file(checksum_path(&info.path)).unwrap();

        assert!(mgr.verify(&mgr.list().unwrap()[0]).is_err());
        assert!(mgr.latest_valid().unwrap().is_none());
    }

    #[test]
    fn test_unrelated_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("jobs-garbage.sqlite"), "x").unwrap();
        let mgr = BackupManager::new(dir.path(), 5).unwrap();
        assert!(mgr.list().unwrap().is_empty());
    }
}
