//! Store-level result and report types.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use jobwatch_core::{DomainHealth, TokenUsage};
use serde::{Deserialize, Serialize};

use crate::backup::BackupInfo;

/// What an upsert did to the stored posting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertChange {
    /// First sighting of this identity.
    Inserted,
    /// Known identity whose content hash changed.
    Updated,
    /// Known identity, same content; only `last_seen_at` moved.
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertOutcome {
    pub posting_id: i64,
    pub change: UpsertChange,
    /// The posting was inactive and has been seen again.
    pub reactivated: bool,
}

impl UpsertOutcome {
    /// New or changed postings are the only ones that need scoring.
    pub fn is_new_or_changed(&self) -> bool {
        !matches!(self.change, UpsertChange::Unchanged)
    }
}

/// Result of the startup integrity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegrityStatus {
    /// No durable store existed; an empty one was created.
    Created,
    Healthy,
    /// The durable store was corrupt and a backup generation was restored.
    Restored,
    /// No valid backup existed; the store was reinitialized empty.
    Reinitialized,
    /// A previous reinitialization has not been acknowledged.
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub status: IntegrityStatus,
    pub checked_at: DateTime<Utc>,
    /// Validation errors found in the durable file.
    #[serde(default)]
    pub errors: Vec<String>,
    /// Backup generation the store was restored from.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restored_from: Option<String>,
    /// Where the corrupt durable file was moved to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quarantined: Option<PathBuf>,
}

impl IntegrityReport {
    pub fn new(status: IntegrityStatus) -> Self {
        Self {
            status,
            checked_at: Utc::now(),
            errors: Vec::new(),
            restored_from: None,
            quarantined: None,
        }
    }

    /// Data loss happened and nobody has acknowledged it yet.
    pub fn is_data_loss(&self) -> bool {
        matches!(
            self.status,
            IntegrityStatus::Reinitialized | IntegrityStatus::Degraded
        )
    }
}

/// Store statistics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_postings: usize,
    pub active_postings: usize,
    pub inactive_postings: usize,
    pub scored_postings: usize,
    pub pending_rescore: usize,
    /// First seen within the last 24 hours.
    pub new_last_24h: usize,
    /// Combined score of at least 0.8.
    pub high_score_postings: usize,
    pub alerts_sent: usize,
    pub digests_sent: usize,
}

/// Read-only view of a data directory, used by the health check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreInspection {
    pub store_exists: bool,
    /// Durable file passed validation.
    pub store_valid: bool,
    #[serde(default)]
    pub errors: Vec<String>,
    /// Contents of the degraded marker, if present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<StoreStats>,
    #[serde(default)]
    pub domain_health: Vec<DomainHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default)]
    pub backups: Vec<BackupInfo>,
}
