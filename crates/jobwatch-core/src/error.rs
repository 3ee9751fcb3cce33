//! Error types for Jobwatch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classification of a failed fetch, as reported by a board adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Timeout,
    HttpError,
    ParseError,
}

impl std::fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "timeout"),
            Self::HttpError => write!(f, "http_error"),
            Self::ParseError => write!(f, "parse_error"),
        }
    }
}

/// A failed network fetch or a malformed source response.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    /// HTTP status when the server answered.
    pub status: Option<u16>,
    pub message: String,
}

impl FetchError {
    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::Timeout,
            status: None,
            message: message.into(),
        }
    }

    pub fn http(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::HttpError,
            status,
            message: message.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self {
            kind: FetchErrorKind::ParseError,
            status: None,
            message: message.into(),
        }
    }

    /// Transient failures are worth an immediate retry: timeouts, 5xx, and
    /// connection-level errors that never produced a status.
    pub fn is_retryable(&self) -> bool {
        match self.kind {
            FetchErrorKind::Timeout => true,
            FetchErrorKind::HttpError => match self.status {
                None => true,
                Some(status) => (500..600).contains(&status),
            },
            FetchErrorKind::ParseError => false,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Circuit open for {origin}, retry after {retry_after}")]
    CircuitOpen {
        origin: String,
        retry_after: DateTime<Utc>,
    },

    #[error("Token budget exceeded: {0}")]
    BudgetExceeded(String),

    #[error("Another run is active (pid {pid}, since {acquired_at})")]
    LockConflict {
        pid: u32,
        acquired_at: DateTime<Utc>,
    },

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Notification error: {0}")]
    Notify(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scoring error: {0}")]
    Scoring(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Errors that stay local to the source being processed: the run logs
    /// them, skips the source and moves on. Lock conflicts and integrity
    /// failures abort the whole run.
    pub fn is_source_local(&self) -> bool {
        !matches!(self, Self::LockConflict { .. } | Self::Integrity(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
