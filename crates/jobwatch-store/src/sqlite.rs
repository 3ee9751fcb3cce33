//! SQLite-backed job store.
//!
//! The working copy lives in an in-memory connection. `persist()` writes it
//! to the durable file through a validated temporary snapshot, so the
//! durable file always holds a complete, consistent generation.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use jobwatch_core::{
    CircuitState, DataPaths, DomainHealth, Error, JobPosting, PostingKey, PostingStatus, Result,
    ScoreRecord, ScoredPosting, ScoringMethod, SourceType, StoreSettings, TokenUsage,
};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, DatabaseName, OpenFlags, OptionalExtension, Row};
use tracing::{debug, error, info, warn};

use crate::backup::{BackupInfo, BackupManager};
use crate::schema::SCHEMA_SQL;
use crate::snapshot::{db_err, validate_file, write_snapshot};
use crate::types::*;

const DEGRADED_MARKER: &str = "DEGRADED";
const HIGH_SCORE: f64 = 0.8;

const POSTING_COLUMNS: &str = "p.id, p.source_type, p.external_id, p.source_id, p.title, \
     p.location, p.salary_text, p.salary_min, p.salary_max, p.description, p.url, p.posted_at, \
     p.content_hash, p.first_seen_at, p.last_seen_at, p.status, p.alert_sent_at, p.digest_sent_at";
const POSTING_COLUMN_COUNT: usize = 18;

const SCORE_COLUMNS: &str = "s.posting_id, s.rule_score, s.ai_score, s.combined_score, \
     s.matched_reasons_json, s.scoring_method, s.content_hash, s.computed_at";

/// Deduplicated posting store with durable snapshots and backups.
pub struct JobStore {
    conn: Mutex<Connection>,
    store_file: PathBuf,
    degraded_marker: PathBuf,
    backups: BackupManager,
    report: Mutex<IntegrityReport>,
}

impl JobStore {
    /// Open the store in `paths`, running the integrity check first.
    ///
    /// A corrupt durable file is quarantined and the newest valid backup
    /// restored; with no valid backup the store starts empty and is marked
    /// degraded until [`JobStore::acknowledge_data_loss`] is called.
    pub fn open(paths: &DataPaths, settings: &StoreSettings) -> Result<Self> {
        paths.ensure_dirs()?;
        let store = Self {
            conn: Mutex::new(open_memory()?),
            store_file: paths.store_file.clone(),
            degraded_marker: paths.root.join(DEGRADED_MARKER),
            backups: BackupManager::new(&paths.backups, settings.max_backups)?,
            report: Mutex::new(IntegrityReport::new(IntegrityStatus::Healthy)),
        };
        let report = store.integrity_check()?;
        info!(
            "Job store opened at {} (integrity: {:?})",
            store.store_file.display(),
            report.status
        );
        Ok(store)
    }

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------

    /// Validate the durable file and reload the working copy from it.
    ///
    /// Unpersisted changes in the working copy are discarded.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let mut report = if !self.store_file.exists() {
            self.reset_empty()?;
            self.persist()?;
            info!("Created new store at {}", self.store_file.display());
            IntegrityReport::new(IntegrityStatus::Created)
        } else {
            match validate_file(&self.store_file) {
                Ok(()) => {
                    self.load_from(&self.store_file)?;
                    IntegrityReport::new(IntegrityStatus::Healthy)
                }
                Err(errors) => {
                    error!(
                        "Store {} failed validation: {}",
                        self.store_file.display(),
                        errors.join("; ")
                    );
                    self.recover(errors)?
                }
            }
        };

        if report.status != IntegrityStatus::Reinitialized {
            if let Some(marker) = read_marker(&self.degraded_marker) {
                warn!("Store is degraded: {}", marker);
                report.status = IntegrityStatus::Degraded;
                report.errors.push(marker);
            }
        }

        *self.report.lock() = report.clone();
        Ok(report)
    }

    fn recover(&self, errors: Vec<String>) -> Result<IntegrityReport> {
        let quarantined = self.quarantine()?;

        if let Some(backup) = self.backups.latest_valid()? {
            self.load_from(&backup.path)?;
            self.persist()?;
            warn!("Store restored from backup {}", backup.name);
            let mut report = IntegrityReport::new(IntegrityStatus::Restored);
            report.errors = errors;
            report.restored_from = Some(backup.name);
            report.quarantined = Some(quarantined);
            return Ok(report);
        }

        self.reset_empty()?;
        self.persist()?;
        let message = format!(
            "store reinitialized empty at {} after corruption; no valid backup; corrupt file kept at {}",
            Utc::now().to_rfc3339(),
            quarantined.display()
        );
        fs::write(&self.degraded_marker, &message)?;
        error!("Irrecoverable data loss: {}", message);

        let mut report = IntegrityReport::new(IntegrityStatus::Reinitialized);
        report.errors = errors;
        report.quarantined = Some(quarantined);
        Ok(report)
    }

    fn quarantine(&self) -> Result<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.3fZ");
        let mut name = self
            .store_file
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(format!(".corrupt-{}", stamp));
        let target = self.store_file.with_file_name(name);
        fs::rename(&self.store_file, &target)?;
        warn!("Quarantined corrupt store at {}", target.display());
        Ok(target)
    }

    fn load_from(&self, path: &Path) -> Result<()> {
        let mut conn = self.conn.lock();
        conn.restore(DatabaseName::Main, path, None::<fn(rusqlite::backup::Progress)>)
            .map_err(db_err)?;
        conn.execute_batch(SCHEMA_SQL).map_err(db_err)?;
        debug!("Working copy loaded from {}", path.display());
        Ok(())
    }

    fn reset_empty(&self) -> Result<()> {
        *self.conn.lock() = open_memory()?;
        Ok(())
    }

    /// Report of the most recent integrity check.
    pub fn integrity_report(&self) -> IntegrityReport {
        self.report.lock().clone()
    }

    /// True while an unacknowledged data-loss event exists.
    pub fn is_degraded(&self) -> bool {
        self.degraded_marker.exists()
    }

    /// Clear the degraded marker after an operator has reviewed the loss.
    pub fn acknowledge_data_loss(&self) -> Result<()> {
        if self.degraded_marker.exists() {
            fs::remove_file(&self.degraded_marker)?;
            info!("Data loss acknowledged; store no longer degraded");
        }
        let mut report = self.report.lock();
        if report.is_data_loss() {
            *report = IntegrityReport::new(IntegrityStatus::Healthy);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Durability
    // ------------------------------------------------------------------

    /// Atomically replace the durable file with the working copy.
    pub fn persist(&self) -> Result<()> {
        let conn = self.conn.lock();
        write_snapshot(&conn, &self.store_file)
    }

    pub fn store_path(&self) -> &Path {
        &self.store_file
    }

    /// Write a new backup generation and prune old ones.
    pub fn backup(&self, now: DateTime<Utc>) -> Result<BackupInfo> {
        let info = {
            let conn = self.conn.lock();
            self.backups.create(&conn, now)?
        };
        self.backups.prune()?;
        Ok(info)
    }

    /// Back up only if the newest generation is older than `interval`.
    pub fn backup_if_due(
        &self,
        interval: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<Option<BackupInfo>> {
        match self.backups.latest_created_at()? {
            Some(latest) if now - latest < interval => Ok(None),
            _ => self.backup(now).map(Some),
        }
    }

    pub fn prune_backups(&self) -> Result<usize> {
        self.backups.prune()
    }

    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        self.backups.list()
    }

    // ------------------------------------------------------------------
    // Postings
    // ------------------------------------------------------------------

    /// Insert or refresh one posting by identity.
    pub fn upsert(&self, posting: &JobPosting, now: DateTime<Utc>) -> Result<UpsertOutcome> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let outcome = upsert_in(&tx, posting, now)?;
        tx.commit().map_err(db_err)?;
        Ok(outcome)
    }

    /// Upsert a batch in a single transaction; all or nothing.
    pub fn upsert_batch(
        &self,
        postings: &[JobPosting],
        now: DateTime<Utc>,
    ) -> Result<Vec<UpsertOutcome>> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let mut outcomes = Vec::with_capacity(postings.len());
        for posting in postings {
            outcomes.push(upsert_in(&tx, posting, now)?);
        }
        tx.commit().map_err(db_err)?;
        Ok(outcomes)
    }

    pub fn get_posting(&self, id: i64) -> Result<Option<JobPosting>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!("SELECT {} FROM postings p WHERE p.id = ?1", POSTING_COLUMNS),
            params![id],
            |row| row_to_posting(row, 0),
        )
        .optional()
        .map_err(db_err)
    }

    pub fn find_posting(&self, key: &PostingKey) -> Result<Option<JobPosting>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM postings p WHERE p.source_type = ?1 AND p.external_id = ?2",
                POSTING_COLUMNS
            ),
            params![key.source_type.as_str(), key.external_id],
            |row| row_to_posting(row, 0),
        )
        .optional()
        .map_err(db_err)
    }

    pub fn all_postings(&self) -> Result<Vec<JobPosting>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM postings p ORDER BY p.id",
                POSTING_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map([], |row| row_to_posting(row, 0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Active postings whose current content has no score yet, e.g. left
    /// over from a run that stopped between dedup and scoring.
    pub fn pending_rescore(&self, limit: usize) -> Result<Vec<JobPosting>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {} FROM postings p
                 WHERE p.needs_rescore = 1 AND p.status = 'active'
                 ORDER BY p.first_seen_at, p.id LIMIT ?1",
                POSTING_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![limit as i64], |row| row_to_posting(row, 0))
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    /// Mark postings not seen within `window` as inactive. Rows are kept.
    pub fn expire_stale(&self, window: chrono::Duration, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = (now - window).timestamp_millis();
        let conn = self.conn.lock();
        let count = conn
            .execute(
                "UPDATE postings SET status = 'inactive'
                 WHERE status = 'active' AND last_seen_at < ?1",
                params![cutoff],
            )
            .map_err(db_err)?;
        if count > 0 {
            info!("Marked {} stale postings inactive", count);
        }
        Ok(count)
    }

    pub fn mark_alert_sent(&self, ids: &[i64], now: DateTime<Utc>) -> Result<usize> {
        self.mark_sent("alert_sent_at", ids, now)
    }

    pub fn mark_digest_sent(&self, ids: &[i64], now: DateTime<Utc>) -> Result<usize> {
        self.mark_sent("digest_sent_at", ids, now)
    }

    fn mark_sent(&self, column: &str, ids: &[i64], now: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        let mut count = 0;
        {
            let mut stmt = tx
                .prepare(&format!(
                    "UPDATE postings SET {col} = ?1 WHERE id = ?2 AND {col} IS NULL",
                    col = column
                ))
                .map_err(db_err)?;
            for id in ids {
                count += stmt
                    .execute(params![now.timestamp_millis(), id])
                    .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(count)
    }

    // ------------------------------------------------------------------
    // Scores
    // ------------------------------------------------------------------

    /// Store the score for a posting. Clears the rescore flag when the
    /// score matches the posting's current content.
    pub fn save_score(&self, record: &ScoreRecord) -> Result<()> {
        let reasons = serde_json::to_string(&record.matched_reasons)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        tx.execute(
            "INSERT INTO score_records
                (posting_id, rule_score, ai_score, combined_score, matched_reasons_json,
                 scoring_method, content_hash, computed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(posting_id) DO UPDATE SET
                rule_score = excluded.rule_score,
                ai_score = excluded.ai_score,
                combined_score = excluded.combined_score,
                matched_reasons_json = excluded.matched_reasons_json,
                scoring_method = excluded.scoring_method,
                content_hash = excluded.content_hash,
                computed_at = excluded.computed_at",
            params![
                record.posting_id,
                record.rule_score,
                record.ai_score,
                record.combined_score,
                reasons,
                record.scoring_method.as_str(),
                record.content_hash,
                record.computed_at.timestamp_millis(),
            ],
        )
        .map_err(db_err)?;
        tx.execute(
            "UPDATE postings SET needs_rescore = 0 WHERE id = ?1 AND content_hash = ?2",
            params![record.posting_id, record.content_hash],
        )
        .map_err(db_err)?;
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn get_score(&self, posting_id: i64) -> Result<Option<ScoreRecord>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {} FROM score_records s WHERE s.posting_id = ?1",
                SCORE_COLUMNS
            ),
            params![posting_id],
            |row| row_to_score(row, 0),
        )
        .optional()
        .map_err(db_err)
    }

    /// Posting joined with its score, if it has one.
    pub fn scored_posting(&self, posting_id: i64) -> Result<Option<ScoredPosting>> {
        let conn = self.conn.lock();
        conn.query_row(
            &format!(
                "SELECT {}, {} FROM postings p JOIN score_records s ON s.posting_id = p.id
                 WHERE p.id = ?1",
                POSTING_COLUMNS, SCORE_COLUMNS
            ),
            params![posting_id],
            row_to_scored,
        )
        .optional()
        .map_err(db_err)
    }

    /// Active, unsent postings scoring at least `min_score`, best first.
    ///
    /// Ties are broken by first sighting, then id, so the order is stable.
    pub fn digest_candidates(&self, min_score: f64, limit: usize) -> Result<Vec<ScoredPosting>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {}, {} FROM postings p JOIN score_records s ON s.posting_id = p.id
                 WHERE p.status = 'active'
                   AND p.alert_sent_at IS NULL
                   AND p.digest_sent_at IS NULL
                   AND s.content_hash = p.content_hash
                   AND s.combined_score >= ?1
                 ORDER BY s.combined_score DESC, p.first_seen_at ASC, p.id ASC
                 LIMIT ?2",
                POSTING_COLUMNS, SCORE_COLUMNS
            ))
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![min_score, limit as i64], row_to_scored)
            .map_err(db_err)?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err)?;
        Ok(rows)
    }

    // ------------------------------------------------------------------
    // Domain health and token usage
    // ------------------------------------------------------------------

    pub fn load_domain_health(&self) -> Result<Vec<DomainHealth>> {
        let conn = self.conn.lock();
        query_domain_health(&conn)
    }

    pub fn save_domain_health(&self, rows: &[DomainHealth]) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction().map_err(db_err)?;
        {
            let mut stmt = tx
                .prepare(
                    "INSERT INTO domain_health
                        (origin, consecutive_failures, backoff_until, circuit_state,
                         last_failure_at, last_success_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                     ON CONFLICT(origin) DO UPDATE SET
                        consecutive_failures = excluded.consecutive_failures,
                        backoff_until = excluded.backoff_until,
                        circuit_state = excluded.circuit_state,
                        last_failure_at = excluded.last_failure_at,
                        last_success_at = excluded.last_success_at",
                )
                .map_err(db_err)?;
            for row in rows {
                stmt.execute(params![
                    row.origin,
                    row.consecutive_failures,
                    row.backoff_until.map(|t| t.timestamp_millis()),
                    row.circuit_state.as_str(),
                    row.last_failure_at.map(|t| t.timestamp_millis()),
                    row.last_success_at.map(|t| t.timestamp_millis()),
                ])
                .map_err(db_err)?;
            }
        }
        tx.commit().map_err(db_err)?;
        Ok(())
    }

    pub fn token_usage(&self, date: NaiveDate) -> Result<Option<TokenUsage>> {
        let conn = self.conn.lock();
        query_token_usage(&conn, date)
    }

    pub fn save_token_usage(&self, usage: &TokenUsage) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO token_usage (usage_date, tokens_used, requests) VALUES (?1, ?2, ?3)
             ON CONFLICT(usage_date) DO UPDATE SET
                tokens_used = excluded.tokens_used,
                requests = excluded.requests",
            params![
                usage.date.to_string(),
                usage.tokens_used as i64,
                usage.requests as i64
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    pub fn stats(&self, now: DateTime<Utc>) -> Result<StoreStats> {
        let conn = self.conn.lock();
        query_stats(&conn, now)
    }
}

/// Read-only inspection of a data directory. Never repairs anything.
pub fn inspect(paths: &DataPaths, settings: &StoreSettings) -> Result<StoreInspection> {
    let store_exists = paths.store_file.exists();
    let degraded = read_marker(&paths.root.join(DEGRADED_MARKER));
    let backups = if paths.backups.exists() {
        BackupManager::new(&paths.backups, settings.max_backups)?.list()?
    } else {
        Vec::new()
    };

    let mut inspection = StoreInspection {
        store_exists,
        store_valid: false,
        errors: Vec::new(),
        degraded,
        stats: None,
        domain_health: Vec::new(),
        token_usage: None,
        backups,
    };
    if !store_exists {
        return Ok(inspection);
    }

    if let Err(errors) = validate_file(&paths.store_file) {
        inspection.errors = errors;
        return Ok(inspection);
    }
    inspection.store_valid = true;

    let conn = Connection::open_with_flags(&paths.store_file, OpenFlags::SQLITE_OPEN_READ_ONLY)
        .map_err(db_err)?;
    let now = Utc::now();
    inspection.stats = Some(query_stats(&conn, now)?);
    inspection.domain_health = query_domain_health(&conn)?;
    inspection.token_usage = query_token_usage(&conn, now.date_naive())?;
    Ok(inspection)
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory().map_err(db_err)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")
        .map_err(db_err)?;
    conn.execute_batch(SCHEMA_SQL).map_err(db_err)?;
    Ok(conn)
}

fn read_marker(path: &Path) -> Option<String> {
    if !path.exists() {
        return None;
    }
    Some(
        fs::read_to_string(path)
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|e| format!("degraded marker unreadable: {}", e)),
    )
}

fn upsert_in(conn: &Connection, posting: &JobPosting, now: DateTime<Utc>) -> Result<UpsertOutcome> {
    let now_ms = now.timestamp_millis();
    let existing: Option<(i64, String, String)> = conn
        .query_row(
            "SELECT id, content_hash, status FROM postings
             WHERE source_type = ?1 AND external_id = ?2",
            params![posting.source_type.as_str(), posting.external_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(db_err)?;

    let Some((id, hash, status)) = existing else {
        conn.execute(
            "INSERT INTO postings
                (source_type, external_id, source_id, title, location, salary_text,
                 salary_min, salary_max, description, url, posted_at, content_hash,
                 first_seen_at, last_seen_at, status, needs_rescore)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?13, 'active', 1)",
            params![
                posting.source_type.as_str(),
                posting.external_id,
                posting.source_id,
                posting.title,
                posting.location,
                posting.salary_text,
                posting.salary_min.map(|v| v as i64),
                posting.salary_max.map(|v| v as i64),
                posting.description,
                posting.url,
                posting.posted_at.map(|t| t.timestamp_millis()),
                posting.content_hash,
                now_ms,
            ],
        )
        .map_err(db_err)?;
        return Ok(UpsertOutcome {
            posting_id: conn.last_insert_rowid(),
            change: UpsertChange::Inserted,
            reactivated: false,
        });
    };

    let reactivated = PostingStatus::parse(&status) == PostingStatus::Inactive;
    if hash == posting.content_hash {
        conn.execute(
            "UPDATE postings SET last_seen_at = ?1, status = 'active', source_id = ?2
             WHERE id = ?3",
            params![now_ms, posting.source_id, id],
        )
        .map_err(db_err)?;
        return Ok(UpsertOutcome {
            posting_id: id,
            change: UpsertChange::Unchanged,
            reactivated,
        });
    }

    conn.execute(
        "UPDATE postings SET
            source_id = ?1, title = ?2, location = ?3, salary_text = ?4, salary_min = ?5,
            salary_max = ?6, description = ?7, url = ?8, posted_at = ?9, content_hash = ?10,
            last_seen_at = ?11, status = 'active', needs_rescore = 1
         WHERE id = ?12",
        params![
            posting.source_id,
            posting.title,
            posting.location,
            posting.salary_text,
            posting.salary_min.map(|v| v as i64),
            posting.salary_max.map(|v| v as i64),
            posting.description,
            posting.url,
            posting.posted_at.map(|t| t.timestamp_millis()),
            posting.content_hash,
            now_ms,
            id,
        ],
    )
    .map_err(db_err)?;
    debug!("Posting {} changed content", id);
    Ok(UpsertOutcome {
        posting_id: id,
        change: UpsertChange::Updated,
        reactivated,
    })
}

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn opt_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.and_then(DateTime::from_timestamp_millis)
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn row_to_posting(row: &Row<'_>, offset: usize) -> rusqlite::Result<JobPosting> {
    let source_type: String = row.get(offset + 1)?;
    let source_type = SourceType::parse(&source_type).ok_or_else(|| {
        conversion_error(offset + 1, format!("unknown source type '{}'", source_type))
    })?;
    let status: String = row.get(offset + 15)?;
    Ok(JobPosting {
        id: row.get(offset)?,
        source_type,
        external_id: row.get(offset + 2)?,
        source_id: row.get(offset + 3)?,
        title: row.get(offset + 4)?,
        location: row.get(offset + 5)?,
        salary_text: row.get(offset + 6)?,
        salary_min: row.get::<_, Option<i64>>(offset + 7)?.map(|v| v as u64),
        salary_max: row.get::<_, Option<i64>>(offset + 8)?.map(|v| v as u64),
        description: row.get(offset + 9)?,
        url: row.get(offset + 10)?,
        posted_at: opt_millis(row.get(offset + 11)?),
        content_hash: row.get(offset + 12)?,
        first_seen_at: millis(row.get(offset + 13)?),
        last_seen_at: millis(row.get(offset + 14)?),
        status: PostingStatus::parse(&status),
        alert_sent_at: opt_millis(row.get(offset + 16)?),
        digest_sent_at: opt_millis(row.get(offset + 17)?),
    })
}

fn row_to_score(row: &Row<'_>, offset: usize) -> rusqlite::Result<ScoreRecord> {
    let reasons: String = row.get(offset + 4)?;
    let matched_reasons: Vec<String> = serde_json::from_str(&reasons)
        .map_err(|e| conversion_error(offset + 4, format!("bad reasons json: {}", e)))?;
    let method: String = row.get(offset + 5)?;
    let scoring_method = ScoringMethod::parse(&method)
        .ok_or_else(|| conversion_error(offset + 5, format!("unknown scoring method '{}'", method)))?;
    Ok(ScoreRecord {
        posting_id: row.get(offset)?,
        rule_score: row.get(offset + 1)?,
        ai_score: row.get(offset + 2)?,
        combined_score: row.get(offset + 3)?,
        matched_reasons,
        scoring_method,
        content_hash: row.get(offset + 6)?,
        computed_at: millis(row.get(offset + 7)?),
    })
}

fn row_to_scored(row: &Row<'_>) -> rusqlite::Result<ScoredPosting> {
    Ok(ScoredPosting {
        posting: row_to_posting(row, 0)?,
        score: row_to_score(row, POSTING_COLUMN_COUNT)?,
    })
}

fn query_domain_health(conn: &Connection) -> Result<Vec<DomainHealth>> {
    let mut stmt = conn
        .prepare(
            "SELECT origin, consecutive_failures, backoff_until, circuit_state,
                    last_failure_at, last_success_at
             FROM domain_health ORDER BY origin",
        )
        .map_err(db_err)?;
    let rows = stmt
        .query_map([], |row| {
            let state: String = row.get(3)?;
            Ok(DomainHealth {
                origin: row.get(0)?,
                consecutive_failures: row.get(1)?,
                backoff_until: opt_millis(row.get(2)?),
                circuit_state: CircuitState::parse(&state),
                last_failure_at: opt_millis(row.get(4)?),
                last_success_at: opt_millis(row.get(5)?),
            })
        })
        .map_err(db_err)?
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(db_err)?;
    Ok(rows)
}

fn query_token_usage(conn: &Connection, date: NaiveDate) -> Result<Option<TokenUsage>> {
    conn.query_row(
        "SELECT tokens_used, requests FROM token_usage WHERE usage_date = ?1",
        params![date.to_string()],
        |row| {
            Ok(TokenUsage {
                date,
                tokens_used: row.get::<_, i64>(0)? as u64,
                requests: row.get::<_, i64>(1)? as u64,
            })
        },
    )
    .optional()
    .map_err(db_err)
}

fn count(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<usize> {
    conn.query_row(sql, params, |row| row.get::<_, i64>(0))
        .map(|n| n as usize)
        .map_err(db_err)
}

fn query_stats(conn: &Connection, now: DateTime<Utc>) -> Result<StoreStats> {
    let day_ago = (now - chrono::Duration::hours(24)).timestamp_millis();
    Ok(StoreStats {
        total_postings: count(conn, "SELECT COUNT(*) FROM postings", [])?,
        active_postings: count(
            conn,
            "SELECT COUNT(*) FROM postings WHERE status = 'active'",
            [],
        )?,
        inactive_postings: count(
            conn,
            "SELECT COUNT(*) FROM postings WHERE status = 'inactive'",
            [],
        )?,
        scored_postings: count(conn, "SELECT COUNT(*) FROM score_records", [])?,
        pending_rescore: count(
            conn,
            "SELECT COUNT(*) FROM postings WHERE needs_rescore = 1 AND status = 'active'",
            [],
        )?,
        new_last_24h: count(
            conn,
            "SELECT COUNT(*) FROM postings WHERE first_seen_at >= ?1",
            params![day_ago],
        )?,
        high_score_postings: count(
            conn,
            "SELECT COUNT(*) FROM score_records WHERE combined_score >= ?1",
            params![HIGH_SCORE],
        )?,
        alerts_sent: count(
            conn,
            "SELECT COUNT(*) FROM postings WHERE alert_sent_at IS NOT NULL",
            [],
        )?,
        digests_sent: count(
            conn,
            "SELECT COUNT(*) FROM postings WHERE digest_sent_at IS NOT NULL",
            [],
        )?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hours: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, 0, 0).unwrap() + chrono::Duration::hours(hours)
    }

    fn setup() -> (tempfile::TempDir, DataPaths, JobStore) {
        let dir = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(dir.path()).unwrap();
        let store = JobStore::open(&paths, &StoreSettings::default()).unwrap();
        (dir, paths, store)
    }

    fn posting(external_id: &str, title: &str, hash: &str) -> JobPosting {
        JobPosting {
            id: 0,
            source_type: SourceType::Greenhouse,
            external_id: external_id.to_string(),
            source_id: "acme".to_string(),
            title: title.to_string(),
            location: "Remote".to_string(),
            salary_text: Some("$160,000".to_string()),
            salary_min: Some(160_000),
            salary_max: Some(160_000),
            description: "Build things".to_string(),
            url: format!("https://boards.example.com/jobs/{}", external_id),
            posted_at: None,
            content_hash: hash.to_string(),
            first_seen_at: at(0),
            last_seen_at: at(0),
            status: PostingStatus::Active,
            alert_sent_at: None,
            digest_sent_at: None,
        }
    }

    fn score(posting_id: i64, combined: f64, hash: &str) -> ScoreRecord {
        ScoreRecord {
            posting_id,
            rule_score: combined,
            ai_score: None,
            combined_score: combined,
            matched_reasons: vec!["Title matched 'engineer'".to_string()],
            scoring_method: ScoringMethod::RulesOnly,
            content_hash: hash.to_string(),
            computed_at: at(0),
        }
    }

    #[test]
    fn test_open_creates_store() {
        let (_dir, paths, store) = setup();
        assert_eq!(store.integrity_report().status, IntegrityStatus::Created);
        assert!(paths.store_file.exists());
        assert!(!store.is_degraded());
    }

    #[test]
    fn test_ingest_is_idempotent() {
        let (_dir, _paths, store) = setup();
        let batch = vec![posting("1", "Engineer", "h1"), posting("2", "Designer", "h2")];

        let first = store.upsert_batch(&batch, at(0)).unwrap();
        assert!(first.iter().all(|o| o.change == UpsertChange::Inserted));

        let second = store.upsert_batch(&batch, at(1)).unwrap();
        assert!(second.iter().all(|o| o.change == UpsertChange::Unchanged));
        assert_eq!(first[0].posting_id, second[0].posting_id);

        let stored = store.all_postings().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].first_seen_at, at(0));
        assert_eq!(stored[0].last_seen_at, at(1));
    }

    #[test]
    fn test_changed_content_needs_rescore() {
        let (_dir, _paths, store) = setup();
        let id = store.upsert(&posting("1", "Engineer", "h1"), at(0)).unwrap().posting_id;
        store.save_score(&score(id, 0.9, "h1")).unwrap();
        assert!(store.pending_rescore(10).unwrap().is_empty());

        let outcome = store
            .upsert(&posting("1", "Senior Engineer", "h2"), at(2))
            .unwrap();
        assert_eq!(outcome.change, UpsertChange::Updated);
        assert!(outcome.is_new_or_changed());

        let pending = store.pending_rescore(10).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].title, "Senior Engineer");
        assert_eq!(pending[0].first_seen_at, at(0));

        // A stale score does not clear the flag.
        store.save_score(&score(id, 0.9, "h1")).unwrap();
        assert_eq!(store.pending_rescore(10).unwrap().len(), 1);
        store.save_score(&score(id, 0.7, "h2")).unwrap();
        assert!(store.pending_rescore(10).unwrap().is_empty());
    }

    #[test]
    fn test_expire_stale_and_reactivate() {
        let (_dir, _paths, store) = setup();
        store.upsert(&posting("1", "Engineer", "h1"), at(0)).unwrap();
        store.upsert(&posting("2", "Engineer", "h2"), at(70)).unwrap();

        let expired = store.expire_stale(chrono::Duration::hours(72), at(73)).unwrap();
        assert_eq!(expired, 1);
        let postings = store.all_postings().unwrap();
        assert_eq!(postings.len(), 2);
        assert_eq!(postings[0].status, PostingStatus::Inactive);
        assert_eq!(postings[1].status, PostingStatus::Active);

        let outcome = store.upsert(&posting("1", "Engineer", "h1"), at(80)).unwrap();
        assert!(outcome.reactivated);
        assert_eq!(outcome.change, UpsertChange::Unchanged);
        assert_eq!(
            store.get_posting(outcome.posting_id).unwrap().unwrap().status,
            PostingStatus::Active
        );
    }

    #[test]
    fn test_digest_candidates_ordering_and_bookkeeping() {
        let (_dir, _paths, store) = setup();
        let a = store.upsert(&posting("a", "A", "ha"), at(0)).unwrap().posting_id;
        let b = store.upsert(&posting("b", "B", "hb"), at(1)).unwrap().posting_id;
        let c = store.upsert(&posting("c", "C", "hc"), at(2)).unwrap().posting_id;
        let d = store.upsert(&posting("d", "D", "hd"), at(3)).unwrap().posting_id;
        store.save_score(&score(a, 0.6, "ha")).unwrap();
        store.save_score(&score(b, 0.8, "hb")).unwrap();
        store.save_score(&score(c, 0.6, "hc")).unwrap();
        store.save_score(&score(d, 0.3, "hd")).unwrap();

        let ids: Vec<i64> = store
            .digest_candidates(0.5, 10)
            .unwrap()
            .into_iter()
            .map(|s| s.posting.id)
            .collect();
        assert_eq!(ids, vec![b, a, c]);

        store.mark_alert_sent(&[b], at(4)).unwrap();
        store.mark_digest_sent(&[a], at(4)).unwrap();
        let ids: Vec<i64> = store
            .digest_candidates(0.5, 10)
            .unwrap()
            .into_iter()
            .map(|s| s.posting.id)
            .collect();
        assert_eq!(ids, vec![c]);

        // Marking twice keeps the first timestamp.
        assert_eq!(store.mark_alert_sent(&[b], at(9)).unwrap(), 0);
        assert_eq!(
            store.get_posting(b).unwrap().unwrap().alert_sent_at,
            Some(at(4))
        );
    }

    #[test]
    fn test_persist_and_reopen() {
        let (_dir, paths, store) = setup();
        let id = store.upsert(&posting("1", "Engineer", "h1"), at(0)).unwrap().posting_id;
        store.save_score(&score(id, 0.9, "h1")).unwrap();
        store
            .save_domain_health(&[DomainHealth {
                origin: "https://boards.example.com".to_string(),
                consecutive_failures: 3,
                backoff_until: Some(at(1)),
                circuit_state: CircuitState::Open,
                last_failure_at: Some(at(0)),
                last_success_at: None,
            }])
            .unwrap();
        let usage = TokenUsage {
            date: at(0).date_naive(),
            tokens_used: 1200,
            requests: 3,
        };
        store.save_token_usage(&usage).unwrap();
        store.persist().unwrap();
        drop(store);

        let reopened = JobStore::open(&paths, &StoreSettings::default()).unwrap();
        assert_eq!(reopened.integrity_report().status, IntegrityStatus::Healthy);
        let scored = reopened.scored_posting(id).unwrap().unwrap();
        assert_eq!(scored.posting.title, "Engineer");
        assert_eq!(scored.score.combined_score, 0.9);
        let health = reopened.load_domain_health().unwrap();
        assert_eq!(health[0].consecutive_failures, 3);
        assert_eq!(health[0].circuit_state, CircuitState::Open);
        assert_eq!(reopened.token_usage(usage.date).unwrap(), Some(usage));
    }

    #[test]
    fn test_unpersisted_changes_are_not_durable() {
        let (_dir, paths, store) = setup();
        store.upsert(&posting("1", "Engineer", "h1"), at(0)).unwrap();
        drop(store);

        let reopened = JobStore::open(&paths, &StoreSettings::default()).unwrap();
        assert!(reopened.all_postings().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_store_restores_latest_backup() {
        let (_dir, paths, store) = setup();
        store.upsert(&posting("1", "Engineer", "h1"), at(0)).unwrap();
        store.persist().unwrap();
        store.backup(at(0)).unwrap();
        store.upsert(&posting("2", "Designer", "h2"), at(1)).unwrap();
        store.persist().unwrap();
        drop(store);

        fs::write(&paths.store_file, b"garbage bytes where a database used to be").unwrap();

        let reopened = JobStore::open(&paths, &StoreSettings::default()).unwrap();
        let report = reopened.integrity_report();
        assert_eq!(report.status, IntegrityStatus::Restored);
        assert!(report.restored_from.is_some());
        assert!(report.quarantined.as_ref().unwrap().exists());
        assert!(!reopened.is_degraded());

        let postings = reopened.all_postings().unwrap();
        assert_eq!(postings.len(), 1);
        assert_eq!(postings[0].external_id, "1");
        assert!(validate_file(&paths.store_file).is_ok());
    }

    #[test]
    fn test_corrupt_latest_backup_falls_back_to_older() {
        let (_dir, paths, store) = setup();
        store.upsert(&posting("1", "Engineer", "h1"), at(0)).unwrap();
        store.backup(at(0)).unwrap();
        store.upsert(&posting("2", "Designer", "h2"), at(1)).unwrap();
        let newest = store.backup(at(1)).unwrap();
        drop(store);

        fs::write(&newest.path, b"not a database").unwrap();
        fs::write(&paths.store_file, b"not a database either").unwrap();

        let reopened = JobStore::open(&paths, &StoreSettings::default()).unwrap();
        assert_eq!(
            reopened.integrity_report().status,
            IntegrityStatus::Restored
        );
        assert_eq!(reopened.all_postings().unwrap().len(), 1);
    }

    #[test]
    fn test_no_valid_backup_reinitializes_and_degrades() {
        let (_dir, paths, store) = setup();
        store.upsert(&posting("1", "Engineer", "h1"), at(0)).unwrap();
        store.persist().unwrap();
        drop(store);

        fs::write(&paths.store_file, b"truncated").unwrap();

        let reopened = JobStore::open(&paths, &StoreSettings::default()).unwrap();
        let report = reopened.integrity_report();
        assert_eq!(report.status, IntegrityStatus::Reinitialized);
        assert!(report.is_data_loss());
        assert!(reopened.is_degraded());
        assert!(reopened.all_postings().unwrap().is_empty());
        drop(reopened);

        // Stays degraded across restarts until acknowledged.
        let again = JobStore::open(&paths, &StoreSettings::default()).unwrap();
        assert_eq!(again.integrity_report().status, IntegrityStatus::Degraded);
        again.acknowledge_data_loss().unwrap();
        assert!(!again.is_degraded());
        assert!(!again.integrity_report().is_data_loss());
    }

    #[test]
    fn test_backup_if_due() {
        let (_dir, _paths, store) = setup();
        let interval = chrono::Duration::hours(24);
        assert!(store.backup_if_due(interval, at(0)).unwrap().is_some());
        assert!(store.backup_if_due(interval, at(10)).unwrap().is_none());
        assert!(store.backup_if_due(interval, at(25)).unwrap().is_some());
        assert_eq!(store.list_backups().unwrap().len(), 2);
    }

    #[test]
    fn test_stats_and_inspect() {
        let (_dir, paths, store) = setup();
        let now = Utc::now();
        let id = store.upsert(&posting("1", "Engineer", "h1"), now).unwrap().posting_id;
        store.upsert(&posting("2", "Designer", "h2"), now).unwrap();
        store.save_score(&score(id, 0.85, "h1")).unwrap();

        let stats = store.stats(now).unwrap();
        assert_eq!(stats.total_postings, 2);
        assert_eq!(stats.active_postings, 2);
        assert_eq!(stats.new_last_24h, 2);
        assert_eq!(stats.high_score_postings, 1);
        assert_eq!(stats.pending_rescore, 1);

        store.persist().unwrap();
        let inspection = inspect(&paths, &StoreSettings::default()).unwrap();
        assert!(inspection.store_valid);
        assert_eq!(inspection.stats.unwrap().total_postings, 2);
        assert!(inspection.degraded.is_none());
    }

    #[test]
    fn test_inspect_reports_corruption_without_repair() {
        let (_dir, paths, store) = setup();
        drop(store);
        fs::write(&paths.store_file, b"garbage").unwrap();

        let inspection = inspect(&paths, &StoreSettings::default()).unwrap();
        assert!(inspection.store_exists);
        assert!(!inspection.store_valid);
        assert!(!inspection.errors.is_empty());
        assert_eq!(fs::read(&paths.store_file).unwrap(), b"garbage");
    }
}
