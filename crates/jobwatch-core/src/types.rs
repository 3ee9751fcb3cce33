//! Shared posting, score and domain health types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::SourceType;

/// Dedup key: a posting is the same posting when both parts match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PostingKey {
    pub source_type: SourceType,
    pub external_id: String,
}

impl std::fmt::Display for PostingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.source_type, self.external_id)
    }
}

/// A posting as produced by a board adapter, before normalization.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DraftPosting {
    pub external_id: String,
    pub title: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub salary_text: Option<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostingStatus {
    Active,
    Inactive,
}

impl PostingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "inactive" => Self::Inactive,
            _ => Self::Active,
        }
    }
}

/// A normalized, stored job posting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPosting {
    /// Row id; 0 until the store assigns one.
    pub id: i64,
    pub source_type: SourceType,
    pub external_id: String,
    /// Configured source that last produced this posting.
    pub source_id: String,
    pub title: String,
    pub location: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_min: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub salary_max: Option<u64>,
    pub description: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub posted_at: Option<DateTime<Utc>>,
    pub content_hash: String,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub status: PostingStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alert_sent_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest_sent_at: Option<DateTime<Utc>>,
}

impl JobPosting {
    pub fn key(&self) -> PostingKey {
        PostingKey {
            source_type: self.source_type,
            external_id: self.external_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringMethod {
    RulesOnly,
    Hybrid,
    /// AI scoring was requested but unavailable (budget, error, no backend).
    RulesOnlyFallback,
}

impl ScoringMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RulesOnly => "rules_only",
            Self::Hybrid => "hybrid",
            Self::RulesOnlyFallback => "rules_only_fallback",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "rules_only" => Some(Self::RulesOnly),
            "hybrid" => Some(Self::Hybrid),
            "rules_only_fallback" => Some(Self::RulesOnlyFallback),
            _ => None,
        }
    }
}

/// Score of one posting at one content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreRecord {
    pub posting_id: i64,
    pub rule_score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ai_score: Option<f64>,
    /// Always within [0, 1].
    pub combined_score: f64,
    pub matched_reasons: Vec<String>,
    pub scoring_method: ScoringMethod,
    /// Content hash the score was computed against.
    pub content_hash: String,
    pub computed_at: DateTime<Utc>,
}

/// A posting together with its current score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredPosting {
    pub posting: JobPosting,
    pub score: ScoreRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "open" => Self::Open,
            "half_open" => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Failure and backoff state of one network origin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainHealth {
    pub origin: String,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_until: Option<DateTime<Utc>>,
    pub circuit_state: CircuitState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
}

impl DomainHealth {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            consecutive_failures: 0,
            backoff_until: None,
            circuit_state: CircuitState::Closed,
            last_failure_at: None,
            last_success_at: None,
        }
    }
}

/// Persisted daily token usage for the AI scorer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub date: chrono::NaiveDate,
    pub tokens_used: u64,
    pub requests: u64,
}
