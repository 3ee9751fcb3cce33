//! Single-run mutual exclusion through a lock file.
//!
//! The lock file is created atomically with its full content (written to a
//! private temporary file, then hard-linked into place). A crashed owner
//! leaves the file behind; the next `acquire` reclaims it when the owner is
//! dead or has exceeded the maximum run duration. An owner counts as dead
//! when its pid is gone or now belongs to a process started after the lock
//! was taken.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use jobwatch_core::{Error, Result};
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};
use tracing::{debug, info, warn};

const ACQUIRE_ATTEMPTS: usize = 3;
/// An unparseable lock younger than this may still be mid-creation.
const UNPARSEABLE_GRACE_SECS: i64 = 10;
/// Process start times are second-granular and derived from boot time.
const START_TIME_SLACK_SECS: i64 = 2;

/// Owner record stored in the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub token: String,
    pub acquired_at: DateTime<Utc>,
}

pub struct RunLock {
    path: PathBuf,
    max_run_duration: chrono::Duration,
}

impl RunLock {
    pub fn new(path: impl AsRef<Path>, max_run_duration: chrono::Duration) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            max_run_duration,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn acquire(&self) -> Result<RunLockGuard> {
        self.acquire_at(Utc::now())
    }

    /// Take the lock, reclaiming a stale one. Fails with
    /// [`Error::LockConflict`] while a live owner holds it.
    pub fn acquire_at(&self, now: DateTime<Utc>) -> Result<RunLockGuard> {
        let info = LockInfo {
            pid: std::process::id(),
            token: uuid::Uuid::new_v4().to_string(),
            acquired_at: now,
        };

        for _ in 0..ACQUIRE_ATTEMPTS {
            match self.try_create(&info) {
                Ok(()) => {
                    info!("Run lock acquired (pid {})", info.pid);
                    return Ok(RunLockGuard {
                        path: self.path.clone(),
                        info,
                        released: false,
                    });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            let raw = match fs::read_to_string(&self.path) {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };

            match serde_json::from_str::<LockInfo>(&raw) {
                Ok(holder) => {
                    if !self.is_stale(&holder, now) {
                        return Err(Error::LockConflict {
                            pid: holder.pid,
                            acquired_at: holder.acquired_at,
                        });
                    }
                    warn!(
                        "Reclaiming stale run lock (pid {}, since {})",
                        holder.pid, holder.acquired_at
                    );
                }
                Err(_) => {
                    if self.modified_within_grace(now) {
                        return Err(Error::LockConflict {
                            pid: 0,
                            acquired_at: now,
                        });
                    }
                    warn!("Reclaiming unreadable run lock at {}", self.path.display());
                }
            }
            self.reclaim(&raw, &info.token)?;
        }

        Err(Error::Storage(format!(
            "could not acquire run lock at {} after {} attempts",
            self.path.display(),
            ACQUIRE_ATTEMPTS
        )))
    }

    /// Current holder, if the lock file exists and parses.
    pub fn holder(&self) -> Result<Option<LockInfo>> {
        match fs::read_to_string(&self.path) {
            Ok(raw) => Ok(serde_json::from_str(&raw).ok()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn is_stale(&self, holder: &LockInfo, now: DateTime<Utc>) -> bool {
        if !owner_alive(holder) {
            return true;
        }
        now - holder.acquired_at > self.max_run_duration
    }

    fn try_create(&self, info: &LockInfo) -> std::io::Result<()> {
        let tmp = self.path.with_file_name(format!(
            "{}.{}.tmp",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            info.token
        ));
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(serde_json::to_string(info)?.as_bytes())?;
            file.sync_all()?;
        }
        let linked = fs::hard_link(&tmp, &self.path);
        let _ = fs::remove_file(&tmp);
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(e),
            Err(e) => {
                debug!("hard_link unavailable ({}); falling back to create_new", e);
                let mut file = fs::OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(&self.path)?;
                file.write_all(serde_json::to_string(info)?.as_bytes())?;
                file.sync_all()
            }
        }
    }

    /// Move the stale file aside, and only delete it if it is still the
    /// file that was judged stale. Another process may have reclaimed and
    /// re-created the lock in between; its file is put back only while its
    /// owner is still alive.
    ///
    /// Between the rename and the restoring link the path is briefly empty,
    /// so a third process can create the lock there. The restore then fails
    /// with `AlreadyExists` and the displaced owner keeps running without a
    /// file. Its guard will leave the newcomer's lock alone on drop.
    fn reclaim(&self, judged: &str, token: &str) -> Result<()> {
        let aside = self.path.with_file_name(format!(
            "{}.stale-{}",
            self.path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default(),
            token
        ));
        match fs::rename(&self.path, &aside) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        }

        let moved = fs::read_to_string(&aside).unwrap_or_default();
        if moved != judged {
            let live = serde_json::from_str::<LockInfo>(&moved)
                .map(|holder| owner_alive(&holder))
                .unwrap_or(false);
            if live {
                debug!("Lock changed hands during reclamation; restoring it");
                if let Err(e) = fs::hard_link(&aside, &self.path) {
                    if e.kind() == ErrorKind::AlreadyExists {
                        warn!("Run lock was re-created before it could be restored");
                    } else {
                        warn!("Failed to restore run lock: {}", e);
                    }
                }
            } else {
                debug!("Replacement lock has no live owner; discarding it");
            }
        }
        fs::remove_file(&aside)?;
        Ok(())
    }

    fn modified_within_grace(&self, now: DateTime<Utc>) -> bool {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .map(|modified| {
                let modified: DateTime<Utc> = modified.into();
                now - modified < chrono::Duration::seconds(UNPARSEABLE_GRACE_SECS)
            })
            .unwrap_or(false)
    }
}

/// Held run lock. Released on drop, including on error paths and panics.
#[derive(Debug)]
pub struct RunLockGuard {
    path: PathBuf,
    info: LockInfo,
    released: bool,
}

impl RunLockGuard {
    pub fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Release explicitly, reporting failures.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        remove_if_owned(&self.path, &self.info.token)
    }
}

impl Drop for RunLockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = remove_if_owned(&self.path, &self.info.token) {
            warn!("Failed to release run lock: {}", e);
        }
    }
}

fn remove_if_owned(path: &Path, token: &str) -> Result<()> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_str::<LockInfo>(&raw) {
        Ok(holder) if holder.token == token => {
            fs::remove_file(path)?;
            info!("Run lock released");
        }
        _ => warn!("Run lock at {} is no longer ours; leaving it", path.display()),
    }
    Ok(())
}

/// Whether the process recorded in `holder` is still the one running under
/// its pid. Without process information every owner counts as alive and
/// only the maximum run duration frees the lock.
fn owner_alive(holder: &LockInfo) -> bool {
    if !sysinfo::IS_SUPPORTED_SYSTEM {
        return true;
    }
    let pid = Pid::from_u32(holder.pid);
    let mut system = System::new_with_specifics(RefreshKind::nothing());
    system.refresh_processes_specifics(
        ProcessesToUpdate::Some(&[pid]),
        false,
        ProcessRefreshKind::nothing(),
    );
    match system.process(pid) {
        None => false,
        Some(process) => {
            let started = i64::try_from(process.start_time()).unwrap_or(i64::MAX);
            let reused = started > holder.acquired_at.timestamp() + START_TIME_SLACK_SECS;
            if reused {
                debug!(
                    "Pid {} was reused after the lock was taken at {}",
                    holder.pid, holder.acquired_at
                );
            }
            !reused
        }
    }
}
