//! Token budget: daily token cap plus a trailing-minute request limit.
//!
//! Denials are immediate. Callers never wait for budget; they fall back
//! to rule-only scoring instead.

use std::collections::VecDeque;

use chrono::{DateTime, NaiveDate, Utc};
use jobwatch_core::{AiSettings, Error, TokenUsage};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, info};

const WINDOW_SECS: i64 = 60;

/// Why a reservation was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BudgetDenial {
    #[error("daily token cap reached ({used} used + {requested} requested > {cap})")]
    DailyCap { used: u64, requested: u64, cap: u64 },

    #[error("rate limit of {limit} requests per minute reached")]
    RateLimit { limit: u32 },
}

impl From<BudgetDenial> for Error {
    fn from(denial: BudgetDenial) -> Self {
        Error::BudgetExceeded(denial.to_string())
    }
}

/// A granted reservation. Pass it back to [`TokenBudget::commit`] with the
/// actual usage once the call returns, or with the estimate when the actual
/// usage is unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub estimated_tokens: u64,
    pub date: NaiveDate,
}

struct BudgetState {
    date: NaiveDate,
    tokens_used: u64,
    requests: u64,
    recent: VecDeque<DateTime<Utc>>,
}

impl BudgetState {
    fn roll_over(&mut self, now: DateTime<Utc>) {
        let today = now.date_naive();
        if today != self.date {
            info!(
                "Token budget reset for {} ({} tokens used on {})",
                today, self.tokens_used, self.date
            );
            self.date = today;
            self.tokens_used = 0;
            self.requests = 0;
        }
    }

    fn trim_window(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::seconds(WINDOW_SECS);
        while self.recent.front().is_some_and(|t| *t <= cutoff) {
            self.recent.pop_front();
        }
    }
}

/// Budget for the external AI scorer. Dates are UTC.
pub struct TokenBudget {
    daily_cap: u64,
    requests_per_minute: u32,
    state: Mutex<BudgetState>,
}

impl TokenBudget {
    pub fn new(daily_cap: u64, requests_per_minute: u32) -> Self {
        Self {
            daily_cap,
            requests_per_minute,
            state: Mutex::new(BudgetState {
                date: Utc::now().date_naive(),
                tokens_used: 0,
                requests: 0,
                recent: VecDeque::new(),
            }),
        }
    }

    pub fn from_settings(settings: &AiSettings) -> Self {
        Self::new(settings.daily_token_cap, settings.requests_per_minute)
    }

    /// Seed usage persisted by an earlier run. Usage from another date is
    /// discarded at the next rollover check.
    pub fn restore(&self, usage: &TokenUsage) {
        let mut state = self.state.lock();
        state.date = usage.date;
        state.tokens_used = usage.tokens_used;
        state.requests = usage.requests;
        debug!(
            "Token budget restored: {} tokens, {} requests on {}",
            usage.tokens_used, usage.requests, usage.date
        );
    }

    pub fn daily_cap(&self) -> u64 {
        self.daily_cap
    }

    pub fn reserve(&self, estimated_tokens: u64) -> Result<Reservation, BudgetDenial> {
        self.reserve_at(estimated_tokens, Utc::now())
    }

    /// Grant or deny a call costing about `estimated_tokens` at `now`.
    pub fn reserve_at(
        &self,
        estimated_tokens: u64,
        now: DateTime<Utc>,
    ) -> Result<Reservation, BudgetDenial> {
        let mut state = self.state.lock();
        state.roll_over(now);
        state.trim_window(now);

        if state.tokens_used.saturating_add(estimated_tokens) > self.daily_cap {
            return Err(BudgetDenial::DailyCap {
                used: state.tokens_used,
                requested: estimated_tokens,
                cap: self.daily_cap,
            });
        }
        if state.recent.len() >= self.requests_per_minute as usize {
            return Err(BudgetDenial::RateLimit {
                limit: self.requests_per_minute,
            });
        }

        state.recent.push_back(now);
        state.requests += 1;
        Ok(Reservation {
            estimated_tokens,
            date: state.date,
        })
    }

    pub fn commit(&self, reservation: Reservation, actual_tokens: u64) {
        self.commit_at(reservation, actual_tokens, Utc::now())
    }

    /// Record the usage of a finished call.
    pub fn commit_at(&self, reservation: Reservation, actual_tokens: u64, now: DateTime<Utc>) {
        let mut state = self.state.lock();
        state.roll_over(now);
        if reservation.date != state.date {
            debug!("Reservation from {} committed after rollover", reservation.date);
        }
        state.tokens_used = state.tokens_used.saturating_add(actual_tokens);
    }

    pub fn snapshot(&self) -> TokenUsage {
        self.snapshot_at(Utc::now())
    }

    /// Usage for the current UTC date, for persistence and health reports.
    pub fn snapshot_at(&self, now: DateTime<Utc>) -> TokenUsage {
        let mut state = self.state.lock();
        state.roll_over(now);
        TokenUsage {
            date: state.date,
            tokens_used: state.tokens_used,
            requests: state.requests,
        }
    }

    pub fn remaining_at(&self, now: DateTime<Utc>) -> u64 {
        let mut state = self.state.lock();
        state.roll_over(now);
        self.daily_cap.saturating_sub(state.tokens_used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, h, m, s).unwrap()
    }

    #[test]
    fn test_daily_cap_denies() {
        let budget = TokenBudget::new(1000, 100);
        let r = budget.reserve_at(600, at(9, 0, 0)).unwrap();
        budget.commit_at(r, 700, at(9, 0, 1));

        assert_eq!(budget.remaining_at(at(9, 0, 2)), 300);
        assert!(budget.reserve_at(300, at(9, 0, 2)).is_ok());
        let denial = budget.reserve_at(301, at(9, 0, 3)).unwrap_err();
        assert_eq!(
            denial,
            BudgetDenial::DailyCap {
                used: 700,
                requested: 301,
                cap: 1000
            }
        );
    }

    #[test]
    fn test_denial_maps_to_budget_exceeded() {
        let err = Error::from(BudgetDenial::RateLimit { limit: 20 });
        assert!(matches!(err, Error::BudgetExceeded(_)));
        assert!(err.is_source_local());
        assert_eq!(
            err.to_string(),
            "Token budget exceeded: rate limit of 20 requests per minute reached"
        );
    }

    #[test]
    fn test_rate_limit_uses_trailing_window() {
        let budget = TokenBudget::new(1_000_000, 2);
        budget.reserve_at(10, at(9, 0, 0)).unwrap();
        budget.reserve_at(10, at(9, 0, 30)).unwrap();
        assert_eq!(
            budget.reserve_at(10, at(9, 0, 59)).unwrap_err(),
            BudgetDenial::RateLimit { limit: 2 }
        );
        // The first request leaves the window after 60 seconds.
        assert!(budget.reserve_at(10, at(9, 1, 0)).is_ok());
    }

    #[test]
    fn test_resets_on_utc_rollover() {
        let budget = TokenBudget::new(100, 10);
        let r = budget.reserve_at(100, at(23, 59, 0)).unwrap();
        budget.commit_at(r, 100, at(23, 59, 1));
        assert!(budget.reserve_at(1, at(23, 59, 2)).is_err());

        let tomorrow = at(23, 59, 0) + chrono::Duration::minutes(5);
        assert!(budget.reserve_at(50, tomorrow).is_ok());
        let usage = budget.snapshot_at(tomorrow);
        assert_eq!(usage.tokens_used, 0);
        assert_eq!(usage.requests, 1);
        assert_eq!(usage.date, tomorrow.date_naive());
    }

    #[test]
    fn test_restore_persisted_usage() {
        let budget = TokenBudget::new(1000, 10);
        budget.restore(&TokenUsage {
            date: at(8, 0, 0).date_naive(),
            tokens_used: 990,
            requests: 12,
        });
        assert!(budget.reserve_at(20, at(9, 0, 0)).is_err());
        assert_eq!(budget.snapshot_at(at(9, 0, 0)).requests, 12);

        // Stale usage from yesterday is dropped.
        let stale = TokenBudget::new(1000, 10);
        stale.restore(&TokenUsage {
            date: at(8, 0, 0).date_naive().pred_opt().unwrap(),
            tokens_used: 1000,
            requests: 3,
        });
        assert!(stale.reserve_at(500, at(9, 0, 0)).is_ok());
    }
}
