//! Hybrid scorer: rule score, optionally blended with a budgeted AI score.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobwatch_core::{Error, JobPosting, Preferences, ScoreRecord, ScoringMethod};
use tracing::{debug, info, warn};

use crate::ai::AiScorer;
use crate::budget::TokenBudget;
use crate::rules::{round4, score_rules, RuleResult};

/// Combines the rule scorer with the injected AI scorer.
///
/// Scoring never fails: disabled AI, a denied budget, an AI error or a
/// timeout all degrade to the rule score. A failed or timed-out call is
/// charged its estimated tokens, since the provider may have billed it.
pub struct HybridScorer {
    ai: Arc<dyn AiScorer>,
    budget: Arc<TokenBudget>,
    timeout: Duration,
}

impl HybridScorer {
    pub fn new(ai: Arc<dyn AiScorer>, budget: Arc<TokenBudget>, timeout: Duration) -> Self {
        Self { ai, budget, timeout }
    }

    pub fn budget(&self) -> &Arc<TokenBudget> {
        &self.budget
    }

    pub async fn score(&self, posting: &JobPosting, prefs: &Preferences) -> ScoreRecord {
        self.score_at(posting, prefs, Utc::now()).await
    }

    pub async fn score_at(
        &self,
        posting: &JobPosting,
        prefs: &Preferences,
        now: DateTime<Utc>,
    ) -> ScoreRecord {
        let rules = score_rules(posting, prefs);

        // Disqualified postings never cost tokens.
        if !prefs.ai_enabled || rules.disqualified {
            return rule_record(posting, rules, ScoringMethod::RulesOnly, None, now);
        }

        if !self.ai.is_available() {
            debug!("AI scorer '{}' unavailable", self.ai.name());
            return rule_record(
                posting,
                rules,
                ScoringMethod::RulesOnlyFallback,
                Some("AI skipped: scorer unavailable".to_string()),
                now,
            );
        }

        let estimate = self.ai.estimate_tokens(posting);
        let reservation = match self.budget.reserve_at(estimate, now) {
            Ok(r) => r,
            Err(denial) => {
                info!("AI scoring skipped for posting {}: {}", posting.id, Error::from(denial));
                return rule_record(
                    posting,
                    rules,
                    ScoringMethod::RulesOnlyFallback,
                    Some(format!("AI skipped: {}", denial)),
                    now,
                );
            }
        };

        let verdict = match tokio::time::timeout(self.timeout, self.ai.score(posting, prefs)).await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                warn!("AI scoring failed for posting {}: {}", posting.id, e);
                self.budget.commit_at(reservation, reservation.estimated_tokens, now);
                return rule_record(
                    posting,
                    rules,
                    ScoringMethod::RulesOnlyFallback,
                    Some("AI skipped: scoring call failed".to_string()),
                    now,
                );
            }
            Err(_) => {
                warn!(
                    "AI scoring timed out for posting {} after {:?}",
                    posting.id, self.timeout
                );
                self.budget.commit_at(reservation, reservation.estimated_tokens, now);
                return rule_record(
                    posting,
                    rules,
                    ScoringMethod::RulesOnlyFallback,
                    Some("AI skipped: scoring call timed out".to_string()),
                    now,
                );
            }
        };
        self.budget.commit_at(reservation, verdict.tokens_used, now);

        let ai_score = verdict.score.clamp(0.0, 1.0);
        let weight = prefs.llm_weight.clamp(0.0, 1.0);
        let combined = round4((rules.score * (1.0 - weight) + ai_score * weight).clamp(0.0, 1.0));

        let mut reasons: Vec<String> = rules
            .reasons
            .into_iter()
            .map(|r| format!("Rules: {}", r))
            .collect();
        reasons.extend(verdict.reasons.into_iter().map(|r| format!("AI: {}", r)));
        if let Some(summary) = verdict.summary {
            reasons.push(format!("Summary: {}", summary));
        }

        ScoreRecord {
            posting_id: posting.id,
            rule_score: rules.score,
            ai_score: Some(ai_score),
            combined_score: combined,
            matched_reasons: reasons,
            scoring_method: ScoringMethod::Hybrid,
            content_hash: posting.content_hash.clone(),
            computed_at: now,
        }
    }
}

fn rule_record(
    posting: &JobPosting,
    rules: RuleResult,
    method: ScoringMethod,
    note: Option<String>,
    now: DateTime<Utc>,
) -> ScoreRecord {
    let mut reasons = rules.reasons;
    reasons.extend(note);
    ScoreRecord {
        posting_id: posting.id,
        rule_score: rules.score,
        ai_score: None,
        combined_score: rules.score,
        matched_reasons: reasons,
        scoring_method: method,
        content_hash: posting.content_hash.clone(),
        computed_at: now,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{AiVerdict, DisabledAiScorer};
    use async_trait::async_trait;
    use jobwatch_core::{Error, PostingStatus, Result, SourceType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    enum Behavior {
        Score(f64),
        Fail,
        Hang,
    }

    struct MockAi {
        behavior: Behavior,
        calls: AtomicUsize,
    }

    impl MockAi {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                behavior,
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl AiScorer for MockAi {
        fn name(&self) -> &str {
            "mock"
        }

        fn is_available(&self) -> bool {
            true
        }

        fn estimate_tokens(&self, _posting: &JobPosting) -> u64 {
            100
        }

        async fn score(&self, _posting: &JobPosting, _prefs: &Preferences) -> Result<AiVerdict> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Score(score) => Ok(AiVerdict {
                    score,
                    reasons: vec!["Relevant experience".into()],
                    summary: Some("Solid match".into()),
                    tokens_used: 80,
                }),
                Behavior::Fail => Err(Error::Scoring("boom".into())),
                Behavior::Hang => {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Err(Error::Scoring("unreachable".into()))
                }
            }
        }
    }

    fn posting() -> JobPosting {
        let now = Utc::now();
        JobPosting {
            id: 7,
            source_type: SourceType::Greenhouse,
            external_id: "7".into(),
            source_id: "acme".into(),
            title: "Security Engineer".into(),
            location: "Remote".into(),
            salary_text: Some("$160,000".into()),
            salary_min: Some(160_000),
            salary_max: Some(160_000),
            description: "Detection and response".into(),
            url: String::new(),
            posted_at: None,
            content_hash: "abc".into(),
            first_seen_at: now,
            last_seen_at: now,
            status: PostingStatus::Active,
            alert_sent_at: None,
            digest_sent_at: None,
        }
    }

    fn prefs(ai_enabled: bool) -> Preferences {
        let mut prefs = Preferences::with_allowlist(["Security Engineer"]);
        prefs.salary_floor_usd = Some(150_000);
        prefs.ai_enabled = ai_enabled;
        prefs
    }

    fn scorer(ai: Arc<dyn AiScorer>, cap: u64) -> HybridScorer {
        HybridScorer::new(
            ai,
            Arc::new(TokenBudget::new(cap, 60)),
            Duration::from_millis(200),
        )
    }

    #[tokio::test]
    async fn test_ai_disabled_is_rules_only() {
        let ai = MockAi::new(Behavior::Score(0.1));
        let record = scorer(ai.clone(), 10_000).score(&posting(), &prefs(false)).await;
        assert_eq!(record.scoring_method, ScoringMethod::RulesOnly);
        assert_eq!(record.combined_score, record.rule_score);
        assert!(record.combined_score >= 0.9);
        assert_eq!(ai.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_hybrid_combination() {
        let ai = MockAi::new(Behavior::Score(0.5));
        let hybrid = scorer(ai.clone(), 10_000);
        let record = hybrid.score(&posting(), &prefs(true)).await;

        assert_eq!(record.scoring_method, ScoringMethod::Hybrid);
        assert_eq!(record.ai_score, Some(0.5));
        assert_eq!(record.combined_score, 0.7); // 0.9 * 0.5 + 0.5 * 0.5
        assert_eq!(record.matched_reasons[0], "Rules: Title matched 'Security Engineer'");
        assert!(record.matched_reasons.contains(&"AI: Relevant experience".to_string()));
        assert!(record.matched_reasons.contains(&"Summary: Solid match".to_string()));
        assert_eq!(hybrid.budget().snapshot().tokens_used, 80);
    }

    #[tokio::test]
    async fn test_exhausted_budget_falls_back_to_rules() {
        let ai = MockAi::new(Behavior::Score(0.1));
        let hybrid = scorer(ai.clone(), 10_000);
        let now = Utc::now();
        let r = hybrid.budget().reserve_at(10, now).unwrap();
        hybrid.budget().commit_at(r, 10_000, now);

        let record = hybrid.score_at(&posting(), &prefs(true), now).await;
        assert_eq!(record.scoring_method, ScoringMethod::RulesOnlyFallback);
        assert_eq!(record.combined_score, record.rule_score);
        assert!(record.combined_score >= 0.9);
        assert!(record.ai_score.is_none());
        assert_eq!(ai.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ai_error_and_timeout_fall_back() {
        for behavior in [Behavior::Fail, Behavior::Hang] {
            let record = scorer(MockAi::new(behavior), 10_000)
                .score(&posting(), &prefs(true))
                .await;
            assert_eq!(record.scoring_method, ScoringMethod::RulesOnlyFallback);
            assert_eq!(record.combined_score, record.rule_score);
        }
    }

    #[tokio::test]
    async fn test_failed_calls_are_charged_their_estimate() {
        let hung = scorer(MockAi::new(Behavior::Hang), 10_000);
        hung.score(&posting(), &prefs(true)).await;
        let usage = hung.budget().snapshot();
        assert_eq!(usage.tokens_used, 100);
        assert_eq!(usage.requests, 1);

        let failed = scorer(MockAi::new(Behavior::Fail), 150);
        failed.score(&posting(), &prefs(true)).await;
        assert_eq!(failed.budget().snapshot().tokens_used, 100);

        // The charged estimate counts against the cap.
        let record = failed.score(&posting(), &prefs(true)).await;
        assert_eq!(record.scoring_method, ScoringMethod::RulesOnlyFallback);
        assert!(record
            .matched_reasons
            .iter()
            .any(|r| r.starts_with("AI skipped: daily token cap reached")));
    }

    #[tokio::test]
    async fn test_unavailable_scorer_falls_back() {
        let record = scorer(Arc::new(DisabledAiScorer), 10_000)
            .score(&posting(), &prefs(true))
            .await;
        assert_eq!(record.scoring_method, ScoringMethod::RulesOnlyFallback);
    }

    #[tokio::test]
    async fn test_disqualified_posting_skips_ai() {
        let ai = MockAi::new(Behavior::Score(1.0));
        let mut p = posting();
        p.title = "Sales Manager".into();
        let record = scorer(ai.clone(), 10_000).score(&p, &prefs(true)).await;
        assert_eq!(record.scoring_method, ScoringMethod::RulesOnly);
        assert_eq!(record.combined_score, 0.0);
        assert_eq!(ai.calls.load(Ordering::SeqCst), 0);
    }
}
