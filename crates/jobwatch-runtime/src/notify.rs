//! Notifier contract and dispatch with a single retry.

use std::collections::HashSet;

use async_trait::async_trait;
use jobwatch_core::{Error, ScoredPosting};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Immediate,
    Digest,
}

/// Delivery result for one posting on one channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryOutcome {
    pub posting_id: i64,
    pub channel: Channel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DeliveryOutcome {
    pub fn delivered(posting_id: i64, channel: Channel) -> Self {
        Self {
            posting_id,
            channel,
            error: None,
        }
    }

    pub fn failed(posting_id: i64, channel: Channel, error: impl Into<String>) -> Self {
        Self {
            posting_id,
            channel,
            error: Some(error.into()),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.error.is_none()
    }

    /// The failure as a notification error, if delivery failed.
    pub fn to_error(&self) -> Option<Error> {
        self.error.as_ref().map(|e| {
            Error::Notify(format!(
                "posting {} ({:?}): {}",
                self.posting_id, self.channel, e
            ))
        })
    }
}

/// Delivery channel for scored postings. Implementations report per-item
/// outcomes instead of failing the whole batch.
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;

    async fn deliver(
        &self,
        immediate: &[ScoredPosting],
        digest: &[ScoredPosting],
    ) -> Vec<DeliveryOutcome>;
}

/// Notifier that writes every item to the log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(
        &self,
        immediate: &[ScoredPosting],
        digest: &[ScoredPosting],
    ) -> Vec<DeliveryOutcome> {
        let mut outcomes = Vec::with_capacity(immediate.len() + digest.len());
        for item in immediate {
            info!(
                "ALERT {:.2} [{}] {} | {} | {}",
                item.score.combined_score,
                item.score.scoring_method.as_str(),
                item.posting.title,
                item.posting.location,
                item.posting.url
            );
            outcomes.push(DeliveryOutcome::delivered(item.posting.id, Channel::Immediate));
        }
        if !digest.is_empty() {
            info!("DIGEST {} postings", digest.len());
        }
        for (rank, item) in digest.iter().enumerate() {
            info!(
                "  {}. {:.2} {} | {} | {}",
                rank + 1,
                item.score.combined_score,
                item.posting.title,
                item.posting.location,
                item.posting.url
            );
            outcomes.push(DeliveryOutcome::delivered(item.posting.id, Channel::Digest));
        }
        outcomes
    }
}

/// Posting ids delivered per channel, plus what still failed after retry.
#[derive(Debug, Clone, Default)]
pub struct DispatchResult {
    pub immediate: Vec<i64>,
    pub digest: Vec<i64>,
    pub failed: Vec<DeliveryOutcome>,
}

/// Deliver both lists, retrying failed items once. Items the notifier did
/// not report on count as failed.
pub async fn dispatch(
    notifier: &dyn Notifier,
    immediate: &[ScoredPosting],
    digest: &[ScoredPosting],
) -> DispatchResult {
    let mut result = DispatchResult::default();
    if immediate.is_empty() && digest.is_empty() {
        return result;
    }

    let first = notifier.deliver(immediate, digest).await;
    let (retry_immediate, retry_digest) = collect(&mut result, immediate, digest, first);
    if retry_immediate.is_empty() && retry_digest.is_empty() {
        return result;
    }

    warn!(
        "Notifier '{}' failed {} items; retrying once",
        notifier.name(),
        retry_immediate.len() + retry_digest.len()
    );
    let second = notifier.deliver(&retry_immediate, &retry_digest).await;
    let reported_error = |id: i64, channel: Channel| {
        second
            .iter()
            .find(|o| o.posting_id == id && o.channel == channel)
            .and_then(|o| o.error.clone())
            .unwrap_or_else(|| "no delivery outcome reported".to_string())
    };
    let (still_immediate, still_digest) =
        collect(&mut result, &retry_immediate, &retry_digest, second.clone());

    let still = still_immediate
        .iter()
        .map(|item| (item, Channel::Immediate))
        .chain(still_digest.iter().map(|item| (item, Channel::Digest)));
    for (item, channel) in still {
        let failed = DeliveryOutcome::failed(
            item.posting.id,
            channel,
            reported_error(item.posting.id, channel),
        );
        if let Some(e) = failed.to_error() {
            warn!("{}", e);
        }
        result.failed.push(failed);
    }
    result
}

/// Record delivered ids and return the items that need another attempt.
fn collect(
    result: &mut DispatchResult,
    immediate: &[ScoredPosting],
    digest: &[ScoredPosting],
    outcomes: Vec<DeliveryOutcome>,
) -> (Vec<ScoredPosting>, Vec<ScoredPosting>) {
    let delivered: HashSet<(i64, Channel)> = outcomes
        .iter()
        .filter(|o| o.is_delivered())
        .map(|o| (o.posting_id, o.channel))
        .collect();

    let pending = |items: &[ScoredPosting], channel: Channel, ok: &mut Vec<i64>| {
        items
            .iter()
            .filter(|item| {
                if delivered.contains(&(item.posting.id, channel)) {
                    ok.push(item.posting.id);
                    false
                } else {
                    true
                }
            })
            .cloned()
            .collect::<Vec<_>>()
    };
    let retry_immediate = pending(immediate, Channel::Immediate, &mut result.immediate);
    let retry_digest = pending(digest, Channel::Digest, &mut result.digest);
    (retry_immediate, retry_digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobwatch_core::{JobPosting, PostingStatus, ScoreRecord, ScoringMethod, SourceType};
    use parking_lot::Mutex;

    fn scored(id: i64) -> ScoredPosting {
        let now = Utc::now();
        ScoredPosting {
            posting: JobPosting {
                id,
                source_type: SourceType::Greenhouse,
                external_id: id.to_string(),
                source_id: "acme".into(),
                title: "Security Engineer".into(),
                location: "Remote".into(),
                salary_text: None,
                salary_min: None,
                salary_max: None,
                description: String::new(),
                url: String::new(),
                posted_at: None,
                content_hash: "h".into(),
                first_seen_at: now,
                last_seen_at: now,
                status: PostingStatus::Active,
                alert_sent_at: None,
                digest_sent_at: None,
            },
            score: ScoreRecord {
                posting_id: id,
                rule_score: 0.9,
                ai_score: None,
                combined_score: 0.9,
                matched_reasons: vec![],
                scoring_method: ScoringMethod::RulesOnly,
                content_hash: "h".into(),
                computed_at: now,
            },
        }
    }

    /// Fails the given ids a set number of times.
    struct FlakyNotifier {
        failures_left: Mutex<Vec<(i64, usize)>>,
        calls: Mutex<usize>,
    }

    #[async_trait]
    impl Notifier for FlakyNotifier {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn deliver(
            &self,
            immediate: &[ScoredPosting],
            digest: &[ScoredPosting],
        ) -> Vec<DeliveryOutcome> {
            *self.calls.lock() += 1;
            let mut failures = self.failures_left.lock();
            let mut outcome = |id: i64, channel: Channel| {
                match failures.iter_mut().find(|(fid, left)| *fid == id && *left > 0) {
                    Some((_, left)) => {
                        *left -= 1;
                        DeliveryOutcome::failed(id, channel, "webhook returned 500")
                    }
                    None => DeliveryOutcome::delivered(id, channel),
                }
            };
            let mut out: Vec<DeliveryOutcome> = immediate
                .iter()
                .map(|i| outcome(i.posting.id, Channel::Immediate))
                .collect();
            out.extend(digest.iter().map(|i| outcome(i.posting.id, Channel::Digest)));
            out
        }
    }

    #[tokio::test]
    async fn test_retry_once_recovers_transient_failure() {
        let notifier = FlakyNotifier {
            failures_left: Mutex::new(vec![(2, 1)]),
            calls: Mutex::new(0),
        };
        let result = dispatch(&notifier, &[scored(1), scored(2)], &[scored(3)]).await;
        assert_eq!(result.immediate, vec![1, 2]);
        assert_eq!(result.digest, vec![3]);
        assert!(result.failed.is_empty());
        assert_eq!(*notifier.calls.lock(), 2);
    }

    #[tokio::test]
    async fn test_persistent_failure_reported_not_raised() {
        let notifier = FlakyNotifier {
            failures_left: Mutex::new(vec![(2, 5)]),
            calls: Mutex::new(0),
        };
        let result = dispatch(&notifier, &[scored(1), scored(2)], &[]).await;
        assert_eq!(result.immediate, vec![1]);
        assert_eq!(result.failed.len(), 1);
        assert_eq!(result.failed[0].posting_id, 2);
        assert_eq!(result.failed[0].channel, Channel::Immediate);
        assert_eq!(*notifier.calls.lock(), 2);

        let err = result.failed[0].to_error().unwrap();
        assert!(matches!(err, Error::Notify(_)));
        assert_eq!(
            err.to_string(),
            "Notification error: posting 2 (Immediate): webhook returned 500"
        );
        assert!(DeliveryOutcome::delivered(1, Channel::Digest).to_error().is_none());
    }

    #[tokio::test]
    async fn test_log_notifier_delivers_everything() {
        let result = dispatch(&LogNotifier, &[scored(1)], &[scored(2), scored(3)]).await;
        assert_eq!(result.immediate, vec![1]);
        assert_eq!(result.digest, vec![2, 3]);
    }
}
