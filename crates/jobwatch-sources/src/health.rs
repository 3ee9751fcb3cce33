//! Per-origin domain health: circuit breaker with exponential backoff,
//! bounded immediate retries and request pacing.
//!
//! ```text
//!   closed ──(failures > threshold)──▶ open ──(backoff elapsed)──▶ half_open
//!     ▲                                  ▲                            │
//!     └────────────(trial ok)────────────┼────────(trial failed)──────┘
//! ```

use std::collections::HashMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use jobwatch_core::{CircuitState, DomainHealth, Error, FetchError, ResilienceSettings, Result};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::pacing::RequestPacer;

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Circuit closed; normal call.
    Proceed,
    /// Backoff elapsed on an open circuit; this is the single trial call.
    Trial,
}

struct DomainEntry {
    health: DomainHealth,
    trial_in_flight: bool,
}

/// Owns DomainHealth for every origin seen in a run.
///
/// The map lock is only held for bookkeeping, never across an await, and
/// callers serialize calls to one origin so each origin's state is updated
/// by one task at a time.
pub struct DomainHealthTracker {
    settings: ResilienceSettings,
    domains: Mutex<HashMap<String, DomainEntry>>,
    pacer: RequestPacer,
}

impl DomainHealthTracker {
    pub fn new(settings: ResilienceSettings) -> Self {
        Self {
            pacer: RequestPacer::new(&settings),
            settings,
            domains: Mutex::new(HashMap::new()),
        }
    }

    /// Restore tracker state persisted by a previous run. An unresolved
    /// `half_open` trial is treated as `open`.
    pub fn from_persisted(settings: ResilienceSettings, rows: Vec<DomainHealth>) -> Self {
        let tracker = Self::new(settings);
        {
            let mut domains = tracker.domains.lock();
            for mut health in rows {
                if health.circuit_state == CircuitState::HalfOpen {
                    health.circuit_state = CircuitState::Open;
                }
                domains.insert(
                    health.origin.clone(),
                    DomainEntry {
                        health,
                        trial_in_flight: false,
                    },
                );
            }
        }
        tracker
    }

    pub fn settings(&self) -> &ResilienceSettings {
        &self.settings
    }

    /// Decide whether a call to `origin` may touch the network at `now`.
    pub fn admit(&self, origin: &str, now: DateTime<Utc>) -> Result<Admission> {
        let mut domains = self.domains.lock();
        let entry = domains
            .entry(origin.to_string())
            .or_insert_with(|| DomainEntry {
                health: DomainHealth::new(origin),
                trial_in_flight: false,
            });

        match entry.health.circuit_state {
            CircuitState::Closed => Ok(Admission::Proceed),
            CircuitState::Open => match entry.health.backoff_until {
                Some(until) if now < until => Err(Error::CircuitOpen {
                    origin: origin.to_string(),
                    retry_after: until,
                }),
                _ => {
                    entry.health.circuit_state = CircuitState::HalfOpen;
                    entry.trial_in_flight = true;
                    info!("Circuit half-open for {}; allowing one trial call", origin);
                    Ok(Admission::Trial)
                }
            },
            CircuitState::HalfOpen => {
                if entry.trial_in_flight {
                    Err(Error::CircuitOpen {
                        origin: origin.to_string(),
                        retry_after: entry.health.backoff_until.unwrap_or(now),
                    })
                } else {
                    entry.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    /// Record a successful call: failures reset, circuit closed.
    pub fn record_success(&self, origin: &str, now: DateTime<Utc>) {
        let mut domains = self.domains.lock();
        let entry = domains
            .entry(origin.to_string())
            .or_insert_with(|| DomainEntry {
                health: DomainHealth::new(origin),
                trial_in_flight: false,
            });
        if entry.health.circuit_state != CircuitState::Closed {
            info!(
                "Circuit closed for {} after {} failures",
                origin, entry.health.consecutive_failures
            );
        }
        entry.health.consecutive_failures = 0;
        entry.health.circuit_state = CircuitState::Closed;
        entry.health.backoff_until = None;
        entry.health.last_success_at = Some(now);
        entry.trial_in_flight = false;
    }

    /// Record one failed call and recompute the backoff from the
    /// incremented failure count.
    pub fn record_failure(&self, origin: &str, now: DateTime<Utc>) -> DomainHealth {
        let mut domains = self.domains.lock();
        let entry = domains
            .entry(origin.to_string())
            .or_insert_with(|| DomainEntry {
                health: DomainHealth::new(origin),
                trial_in_flight: false,
            });

        let health = &mut entry.health;
        health.consecutive_failures = health.consecutive_failures.saturating_add(1);
        let backoff = self.backoff(health.consecutive_failures);
        health.backoff_until = Some(now + backoff);
        health.last_failure_at = Some(now);

        match health.circuit_state {
            CircuitState::HalfOpen => {
                health.circuit_state = CircuitState::Open;
                warn!(
                    "Trial call to {} failed; circuit re-opened for {}s ({} failures)",
                    origin,
                    backoff.num_seconds(),
                    health.consecutive_failures
                );
            }
            CircuitState::Closed if health.consecutive_failures > self.settings.failure_threshold => {
                health.circuit_state = CircuitState::Open;
                warn!(
                    "Circuit opened for {} for {}s ({} consecutive failures)",
                    origin,
                    backoff.num_seconds(),
                    health.consecutive_failures
                );
            }
            _ => debug!(
                "Failure {} recorded for {}",
                health.consecutive_failures, origin
            ),
        }
        entry.trial_in_flight = false;
        entry.health.clone()
    }

    /// `base_delay * 2^min(failures, cap) + jitter`.
    pub fn backoff(&self, failures: u32) -> chrono::Duration {
        let exponent = failures.min(self.settings.backoff_exponent_cap);
        let base_ms = self.settings.base_delay().as_millis() as i64;
        let jitter_ms = if self.settings.jitter_max_ms == 0 {
            0
        } else {
            rand::rng().random_range(0..=self.settings.jitter_max_ms) as i64
        };
        chrono::Duration::milliseconds(
            base_ms.saturating_mul(1i64 << exponent.min(30)) + jitter_ms,
        )
    }

    pub fn get(&self, origin: &str) -> Option<DomainHealth> {
        self.domains.lock().get(origin).map(|e| e.health.clone())
    }

    /// All tracked origins, ordered by origin.
    pub fn snapshot(&self) -> Vec<DomainHealth> {
        let mut rows: Vec<DomainHealth> =
            self.domains.lock().values().map(|e| e.health.clone()).collect();
        rows.sort_by(|a, b| a.origin.cmp(&b.origin));
        rows
    }

    /// Run `op` against `origin` under the circuit breaker.
    ///
    /// Each attempt is bounded by the fetch timeout. Transient failures are
    /// retried immediately up to `max_immediate_retries` times before one
    /// failure is recorded; other failures are recorded at once. A trial
    /// call on a half-open circuit gets a single attempt. Every attempt,
    /// retries included, waits for the origin's pacer first.
    pub async fn call<T, F, Fut>(&self, origin: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, FetchError>>,
    {
        let admission = self.admit(origin, Utc::now())?;
        let max_retries = match admission {
            Admission::Proceed => self.settings.max_immediate_retries,
            Admission::Trial => 0,
        };
        let timeout = self.settings.fetch_timeout();

        let mut attempt: u32 = 0;
        loop {
            let failures = self.get(origin).map(|h| h.consecutive_failures).unwrap_or(0);
            self.pacer.wait(origin, failures).await;

            let result = match tokio::time::timeout(timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(FetchError::timeout(format!(
                    "no response from {} within {}s",
                    origin,
                    timeout.as_secs_f64()
                ))),
            };

            match result {
                Ok(value) => {
                    self.record_success(origin, Utc::now());
                    return Ok(value);
                }
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    let delay = self.settings.retry_base_delay() * 2u32.saturating_pow(attempt);
                    debug!(
                        "Transient failure from {} ({}); retry {} in {:?}",
                        origin,
                        e,
                        attempt + 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    let health = self.record_failure(origin, Utc::now());
                    warn!(
                        "Call to {} failed after {} attempts: {} (state {})",
                        origin,
                        attempt + 1,
                        e,
                        health.circuit_state.as_str()
                    );
                    return Err(Error::Fetch(e));
                }
            }
        }
    }
}

/// Network origin (`scheme://host[:port]`) of a source URL.
pub fn origin_of(url: &str) -> Result<String> {
    let parsed =
        url::Url::parse(url).map_err(|e| Error::Config(format!("Invalid URL '{}': {}", url, e)))?;
    let origin = parsed.origin();
    if !origin.is_tuple() {
        return Err(Error::Config(format!("URL '{}' has no network origin", url)));
    }
    Ok(origin.ascii_serialization())
}
