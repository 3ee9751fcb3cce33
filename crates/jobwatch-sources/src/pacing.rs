//! Per-origin request pacing.
//!
//! Each origin gets a requests-per-minute quota and a minimum spacing
//! between requests, both enforced with `governor`. While an origin is
//! failing, the spacing is stretched by 20% per consecutive failure up to
//! double.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::{Quota, RateLimiter};
use jobwatch_core::{RateLimitSettings, ResilienceSettings};
use parking_lot::Mutex;
use tracing::{debug, info};

type DirectRateLimiter = RateLimiter<
    governor::state::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

struct OriginPacer {
    per_minute: Option<DirectRateLimiter>,
    spacing: Option<DirectRateLimiter>,
    min_delay: Duration,
}

impl OriginPacer {
    fn new(limit: &RateLimitSettings) -> Self {
        Self {
            per_minute: NonZeroU32::new(limit.requests_per_minute)
                .map(|rpm| RateLimiter::direct(Quota::per_minute(rpm))),
            spacing: Quota::with_period(limit.min_delay()).map(RateLimiter::direct),
            min_delay: limit.min_delay(),
        }
    }

    /// Extra wait on top of the spacing quota for a failing origin.
    fn failure_penalty(&self, consecutive_failures: u32) -> Duration {
        self.min_delay * consecutive_failures.min(5) / 5
    }
}

pub struct RequestPacer {
    defaults: RateLimitSettings,
    overrides: HashMap<String, RateLimitSettings>,
    origins: Mutex<HashMap<String, Arc<OriginPacer>>>,
}

impl RequestPacer {
    pub fn new(settings: &ResilienceSettings) -> Self {
        Self {
            defaults: settings.rate_limit.clone(),
            overrides: settings.rate_limit_overrides.clone(),
            origins: Mutex::new(HashMap::new()),
        }
    }

    /// Wait until a request to `origin` is allowed. Returns how long the
    /// caller was held back.
    pub async fn wait(&self, origin: &str, consecutive_failures: u32) -> Duration {
        let pacer = self.pacer_for(origin);
        let started = tokio::time::Instant::now();

        if let Some(limiter) = &pacer.per_minute {
            limiter.until_ready().await;
        }
        if let Some(limiter) = &pacer.spacing {
            limiter.until_ready().await;
        }
        let penalty = pacer.failure_penalty(consecutive_failures);
        if !penalty.is_zero() {
            tokio::time::sleep(penalty).await;
        }

        let waited = started.elapsed();
        if waited >= Duration::from_millis(1) {
            debug!("Paced request to {} by {:?}", origin, waited);
        }
        waited
    }

    fn pacer_for(&self, origin: &str) -> Arc<OriginPacer> {
        let mut origins = self.origins.lock();
        if let Some(pacer) = origins.get(origin) {
            return pacer.clone();
        }
        let limit = self.limit_for(origin);
        if limit != &self.defaults {
            info!(
                "Rate limiting {} to {} req/min, {}ms apart",
                origin, limit.requests_per_minute, limit.min_delay_ms
            );
        }
        let pacer = Arc::new(OriginPacer::new(limit));
        origins.insert(origin.to_string(), pacer.clone());
        pacer
    }

    fn limit_for(&self, origin: &str) -> &RateLimitSettings {
        url::Url::parse(origin)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
            .and_then(|host| self.overrides.get(&host))
            .unwrap_or(&self.defaults)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spaced(min_delay_ms: u64) -> ResilienceSettings {
        ResilienceSettings {
            rate_limit: RateLimitSettings {
                requests_per_minute: 0,
                min_delay_ms,
            },
            rate_limit_overrides: HashMap::new(),
            ..ResilienceSettings::default()
        }
    }

    #[tokio::test]
    async fn test_spacing_applies_per_origin() {
        let pacer = RequestPacer::new(&spaced(200));
        let started = std::time::Instant::now();
        for _ in 0..3 {
            pacer.wait("https://boards.example.com", 0).await;
        }
        assert!(started.elapsed() >= Duration::from_millis(395));

        let other = std::time::Instant::now();
        pacer.wait("https://other.example.com", 0).await;
        assert!(other.elapsed() < Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_failures_stretch_spacing() {
        let pacer = RequestPacer::new(&spaced(40));
        let waited = pacer.wait("https://boards.example.com", 10).await;
        assert!(waited >= Duration::from_millis(40));

        let limit = RateLimitSettings {
            requests_per_minute: 0,
            min_delay_ms: 1000,
        };
        let origin = OriginPacer::new(&limit);
        assert_eq!(origin.failure_penalty(0), Duration::ZERO);
        assert_eq!(origin.failure_penalty(2), Duration::from_millis(400));
        assert_eq!(origin.failure_penalty(9), Duration::from_millis(1000));
    }

    #[test]
    fn test_override_matches_origin_host() {
        let pacer = RequestPacer::new(&ResilienceSettings::default());
        assert_eq!(pacer.limit_for("https://jobs.lever.co").requests_per_minute, 15);
        assert_eq!(
            pacer.limit_for("https://acme.example.com:8443"),
            &RateLimitSettings::default()
        );
    }

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let settings = ResilienceSettings {
            rate_limit: RateLimitSettings::unlimited(),
            ..spaced(0)
        };
        let pacer = RequestPacer::new(&settings);
        let started = std::time::Instant::now();
        for _ in 0..20 {
            pacer.wait("https://boards.example.com", 3).await;
        }
        assert!(started.elapsed() < Duration::from_millis(200));
    }
}
