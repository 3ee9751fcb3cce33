//! Runtime types.

use chrono::{DateTime, Utc};
use jobwatch_core::TokenUsage;
use jobwatch_store::{IntegrityReport, StoreInspection};
use serde::Serialize;

use crate::lock::LockInfo;

/// Mode entry point of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// One ingestion cycle: fetch, dedup, score, persist, alert.
    Poll,
    /// Deliver pending digest-eligible postings.
    Digest,
    /// Expire stale postings, back up and prune.
    Cleanup,
    /// Read-only report of store integrity, domain health and budget.
    Health,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Poll => "poll",
            Self::Digest => "digest",
            Self::Cleanup => "cleanup",
            Self::Health => "health",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "poll" => Some(Self::Poll),
            "digest" => Some(Self::Digest),
            "cleanup" => Some(Self::Cleanup),
            "health" => Some(Self::Health),
            _ => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Orchestrator states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    LockAcquired,
    Fetch,
    Dedup,
    Score,
    Persist,
    NotifyDispatch,
    LockReleased,
    Done,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    PartialFailure,
    Fatal,
}

impl RunStatus {
    /// Process exit code for this status.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Fatal => 1,
            Self::PartialFailure => 2,
        }
    }
}

/// What happened to one source during a poll.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub fetched: usize,
    pub invalid: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub reactivated: usize,
    pub scored: usize,
    /// Scored postings at or above the immediate-alert threshold.
    pub immediate_eligible: usize,
    /// Scored postings in the digest band.
    pub digest_eligible: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SourceReport {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            ..Default::default()
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct NotifySummary {
    pub immediate_sent: usize,
    pub digest_sent: usize,
    pub failed: usize,
}

/// Read-only health snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub store: StoreInspection,
    pub token_usage: TokenUsage,
    pub daily_token_cap: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lock_holder: Option<LockInfo>,
}

/// Structured result of one mode invocation.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub mode: Mode,
    pub status: RunStatus,
    pub final_state: RunState,
    pub transitions: Vec<RunState>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SourceReport>,
    /// Postings scored this run, including leftovers from earlier runs.
    pub scored: usize,
    pub expired: usize,
    pub notifications: NotifySummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub integrity: Option<IntegrityReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
