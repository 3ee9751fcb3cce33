//! Orchestrator: runs one mode under the run lock and drives the
//! fetch → dedup → score → persist → notify state machine.

use std::sync::Arc;

use chrono::Utc;
use futures::future::join_all;
use jobwatch_core::{
    CircuitState, DraftPosting, Error, JobwatchConfig, Result, SourceDescriptor, TokenUsage,
};
use jobwatch_scoring::{eligibility, AiScorer, Eligibility, HybridScorer, TokenBudget};
use jobwatch_sources::{normalize_drafts, origin_of, AdapterRegistry, DomainHealthTracker};
use jobwatch_store::{inspect, IntegrityStatus, JobStore, UpsertChange};
use tracing::{debug, error, info, warn};

use crate::lock::{RunLock, RunLockGuard};
use crate::notify::{dispatch, Notifier};
use crate::types::*;

/// Leftover postings scored at the start of a poll.
const PENDING_RESCORE_LIMIT: usize = 500;
const IMMEDIATE_LIMIT: usize = 100;
const DIGEST_LIMIT: usize = 50;

/// Mutable bookkeeping for one run.
struct RunContext {
    outcome: RunOutcome,
    partial: bool,
    fatal: bool,
}

impl RunContext {
    fn new(mode: Mode) -> Self {
        let now = Utc::now();
        info!("Starting {} run", mode);
        Self {
            outcome: RunOutcome {
                mode,
                status: RunStatus::Success,
                final_state: RunState::Init,
                transitions: vec![RunState::Init],
                started_at: now,
                finished_at: now,
                sources: Vec::new(),
                scored: 0,
                expired: 0,
                notifications: NotifySummary::default(),
                backup: None,
                integrity: None,
                health: None,
                error: None,
            },
            partial: false,
            fatal: false,
        }
    }

    fn enter(&mut self, state: RunState) {
        let from = self.outcome.final_state;
        match state {
            RunState::Fetch | RunState::Dedup | RunState::Score | RunState::Persist => {
                debug!("{} run: {:?} -> {:?}", self.outcome.mode, from, state)
            }
            _ => info!("{} run: {:?} -> {:?}", self.outcome.mode, from, state),
        }
        self.outcome.final_state = state;
        self.outcome.transitions.push(state);
    }

    fn mark_partial(&mut self, reason: String) {
        warn!("{}", reason);
        self.partial = true;
        self.outcome.error.get_or_insert(reason);
    }

    fn finish(mut self) -> RunOutcome {
        self.outcome.status = if self.fatal {
            RunStatus::Fatal
        } else if self.partial || self.outcome.sources.iter().any(|s| s.failed()) {
            RunStatus::PartialFailure
        } else {
            RunStatus::Success
        };
        self.enter(RunState::Done);
        self.outcome.finished_at = Utc::now();
        info!(
            "{} run finished: {:?} ({} sources, {} scored, {} alerts)",
            self.outcome.mode,
            self.outcome.status,
            self.outcome.sources.len(),
            self.outcome.scored,
            self.outcome.notifications.immediate_sent
        );
        self.outcome
    }

    fn abort(mut self, err: Error) -> RunOutcome {
        match &err {
            Error::LockConflict { .. } => warn!("{} run aborted: {}", self.outcome.mode, err),
            _ => error!("{} run aborted: {}", self.outcome.mode, err),
        }
        self.outcome.status = RunStatus::Fatal;
        self.outcome.error = Some(err.to_string());
        self.enter(RunState::Aborted);
        self.outcome.finished_at = Utc::now();
        self.outcome
    }
}

/// Runs modes against one data directory.
pub struct Orchestrator {
    config: JobwatchConfig,
    registry: AdapterRegistry,
    ai: Arc<dyn AiScorer>,
    notifier: Arc<dyn Notifier>,
}

impl Orchestrator {
    pub fn new(
        config: JobwatchConfig,
        registry: AdapterRegistry,
        ai: Arc<dyn AiScorer>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            registry,
            ai,
            notifier,
        }
    }

    pub fn config(&self) -> &JobwatchConfig {
        &self.config
    }

    fn run_lock(&self) -> RunLock {
        RunLock::new(
            &self.config.data_paths.lock_file,
            self.config.run.max_run_duration(),
        )
    }

    /// Run `mode` to completion. Never panics on pipeline errors; the
    /// outcome carries the status.
    pub async fn run(&self, mode: Mode) -> RunOutcome {
        if mode == Mode::Health {
            return self.health();
        }

        let mut run = RunContext::new(mode);
        let guard = match self.run_lock().acquire() {
            Ok(guard) => guard,
            Err(e) => return run.abort(e),
        };
        run.enter(RunState::LockAcquired);

        let result = match mode {
            Mode::Poll => self.poll_locked(&mut run).await,
            Mode::Digest => self.digest_locked(&mut run).await,
            Mode::Cleanup => self.cleanup_locked(&mut run),
            Mode::Health => Ok(()),
        };

        release(guard, &mut run);
        match result {
            Ok(()) => run.finish(),
            Err(e) => run.abort(e),
        }
    }

    pub async fn poll(&self) -> RunOutcome {
        self.run(Mode::Poll).await
    }

    pub async fn digest(&self) -> RunOutcome {
        self.run(Mode::Digest).await
    }

    pub async fn cleanup(&self) -> RunOutcome {
        self.run(Mode::Cleanup).await
    }

    /// Clear the degraded marker once an operator has reviewed a data-loss
    /// event. Takes the run lock so no run is active meanwhile.
    pub fn acknowledge_data_loss(&self) -> Result<()> {
        let guard = self.run_lock().acquire()?;
        let store = JobStore::open(&self.config.data_paths, &self.config.store)?;
        store.acknowledge_data_loss()?;
        guard.release()
    }

    // ---------------------------------------------------------------
    // Store access
    // ---------------------------------------------------------------

    fn open_store(&self, run: &mut RunContext) -> Result<JobStore> {
        let store = JobStore::open(&self.config.data_paths, &self.config.store)?;
        let report = store.integrity_report();
        if report.status == IntegrityStatus::Restored {
            warn!(
                "Store was corrupt and has been restored from {}",
                report.restored_from.as_deref().unwrap_or("a backup")
            );
        }
        let data_loss = report.is_data_loss() || store.is_degraded();
        run.outcome.integrity = Some(report);
        if data_loss {
            return Err(Error::Integrity(
                "store lost its data and no valid backup existed; \
                 review and acknowledge the data loss before running again"
                    .into(),
            ));
        }
        Ok(store)
    }

    // ---------------------------------------------------------------
    // poll
    // ---------------------------------------------------------------

    async fn poll_locked(&self, run: &mut RunContext) -> Result<()> {
        let store = self.open_store(run)?;
        let prefs = &self.config.preferences;

        let tracker = DomainHealthTracker::from_persisted(
            self.config.resilience.clone(),
            store.load_domain_health()?,
        );
        let budget = Arc::new(TokenBudget::from_settings(&self.config.ai));
        if let Some(usage) = store.token_usage(Utc::now().date_naive())? {
            budget.restore(&usage);
        }
        let scorer = HybridScorer::new(self.ai.clone(), budget.clone(), self.config.ai.timeout());

        let pending = store.pending_rescore(PENDING_RESCORE_LIMIT)?;
        if !pending.is_empty() {
            info!("Scoring {} postings left over from an earlier run", pending.len());
            run.enter(RunState::Score);
            for posting in &pending {
                let record = scorer.score(posting, prefs).await;
                store.save_score(&record)?;
                run.outcome.scored += 1;
            }
            run.enter(RunState::Persist);
            store.persist()?;
        }

        let sources = self.config.sources_for_run();
        run.enter(RunState::Fetch);
        let fetched = self.fetch_all(&tracker, &sources).await;

        for (source, fetched) in sources.iter().zip(fetched) {
            let mut report = SourceReport::new(&source.id);
            report.origin = origin_of(&source.url).ok();
            let result = match fetched {
                Ok(drafts) => {
                    self.ingest_source(run, &store, &scorer, source, drafts, &mut report)
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                report.error = Some(e.to_string());
                if !e.is_source_local() {
                    error!("Source '{}' hit a run-level failure: {}", source.id, e);
                    run.outcome.sources.push(report);
                    return Err(e);
                }
                warn!("Source '{}' skipped: {}", source.id, e);
            }
            run.outcome.sources.push(report);
        }

        run.enter(RunState::Persist);
        store.save_domain_health(&tracker.snapshot())?;
        store.save_token_usage(&budget.snapshot())?;
        store.persist()?;
        match store.backup_if_due(self.config.store.backup_interval(), Utc::now()) {
            Ok(Some(backup)) => run.outcome.backup = Some(backup.name),
            Ok(None) => {}
            Err(e) => warn!("Periodic backup failed: {}", e),
        }

        run.enter(RunState::NotifyDispatch);
        let immediate = store.digest_candidates(prefs.immediate_alert_threshold, IMMEDIATE_LIMIT)?;
        let delivered = dispatch(self.notifier.as_ref(), &immediate, &[]).await;
        run.outcome.notifications.immediate_sent = delivered.immediate.len();
        run.outcome.notifications.failed = delivered.failed.len();
        if !delivered.immediate.is_empty() {
            store.mark_alert_sent(&delivered.immediate, Utc::now())?;
            store.persist()?;
        }
        Ok(())
    }

    /// Fetch every source. Sources sharing an origin are fetched one after
    /// another; distinct origins run concurrently. Results follow `sources`
    /// order.
    async fn fetch_all(
        &self,
        tracker: &DomainHealthTracker,
        sources: &[SourceDescriptor],
    ) -> Vec<Result<Vec<DraftPosting>>> {
        let mut results: Vec<Option<Result<Vec<DraftPosting>>>> =
            (0..sources.len()).map(|_| None).collect();
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (i, source) in sources.iter().enumerate() {
            match origin_of(&source.url) {
                Ok(origin) => match groups.iter_mut().find(|(o, _)| *o == origin) {
                    Some((_, indices)) => indices.push(i),
                    None => groups.push((origin, vec![i])),
                },
                Err(e) => results[i] = Some(Err(e)),
            }
        }
        debug!(
            "Fetching {} sources across {} origins",
            sources.len(),
            groups.len()
        );

        let tasks = groups.iter().map(|(origin, indices)| async move {
            let mut out = Vec::with_capacity(indices.len());
            for &i in indices {
                out.push((i, self.fetch_source(tracker, origin, &sources[i]).await));
            }
            out
        });
        for (i, result) in join_all(tasks).await.into_iter().flatten() {
            results[i] = Some(result);
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(Error::Internal("source was not fetched".into()))))
            .collect()
    }

    async fn fetch_source(
        &self,
        tracker: &DomainHealthTracker,
        origin: &str,
        source: &SourceDescriptor,
    ) -> Result<Vec<DraftPosting>> {
        let adapter = self.registry.resolve(source)?;
        debug!(
            "Fetching source '{}' ({}) from {}",
            source.id, source.source_type, origin
        );
        tracker.call(origin, || adapter.fetch(source)).await
    }

    async fn ingest_source(
        &self,
        run: &mut RunContext,
        store: &JobStore,
        scorer: &HybridScorer,
        source: &SourceDescriptor,
        drafts: Vec<DraftPosting>,
        report: &mut SourceReport,
    ) -> Result<()> {
        let now = Utc::now();
        report.fetched = drafts.len();

        run.enter(RunState::Dedup);
        let batch = normalize_drafts(source, drafts, now);
        report.invalid = batch.invalid;
        let outcomes = store.upsert_batch(&batch.postings, now)?;

        let mut to_score = Vec::new();
        for outcome in &outcomes {
            match outcome.change {
                UpsertChange::Inserted => report.inserted += 1,
                UpsertChange::Updated => report.updated += 1,
                UpsertChange::Unchanged => report.unchanged += 1,
            }
            if outcome.reactivated {
                report.reactivated += 1;
            }
            if outcome.is_new_or_changed() {
                to_score.push(outcome.posting_id);
            }
        }

        run.enter(RunState::Score);
        for id in to_score {
            let Some(posting) = store.get_posting(id)? else {
                continue;
            };
            let record = scorer.score(&posting, &self.config.preferences).await;
            let route = eligibility(record.combined_score, &self.config.preferences);
            match route {
                Eligibility::Immediate => report.immediate_eligible += 1,
                Eligibility::Digest => report.digest_eligible += 1,
                Eligibility::None => {}
            }
            debug!(
                "Posting {} '{}' scored {:.4} ({}, {:?})",
                posting.id,
                posting.title,
                record.combined_score,
                record.scoring_method.as_str(),
                route
            );
            store.save_score(&record)?;
            report.scored += 1;
        }
        run.outcome.scored += report.scored;

        run.enter(RunState::Persist);
        store.persist()?;
        info!(
            "Source '{}': {} fetched, {} new, {} changed, {} unchanged, {} invalid",
            source.id, report.fetched, report.inserted, report.updated, report.unchanged, report.invalid
        );
        Ok(())
    }

    // ---------------------------------------------------------------
    // digest / cleanup
    // ---------------------------------------------------------------

    async fn digest_locked(&self, run: &mut RunContext) -> Result<()> {
        let store = self.open_store(run)?;
        run.enter(RunState::NotifyDispatch);

        let candidates =
            store.digest_candidates(self.config.preferences.digest_threshold, DIGEST_LIMIT)?;
        if candidates.is_empty() {
            info!("No postings pending for the digest");
            return Ok(());
        }

        let delivered = dispatch(self.notifier.as_ref(), &[], &candidates).await;
        run.outcome.notifications.digest_sent = delivered.digest.len();
        run.outcome.notifications.failed = delivered.failed.len();
        if !delivered.digest.is_empty() {
            store.mark_digest_sent(&delivered.digest, Utc::now())?;
            store.persist()?;
        }
        Ok(())
    }

    fn cleanup_locked(&self, run: &mut RunContext) -> Result<()> {
        let store = self.open_store(run)?;
        let now = Utc::now();

        run.enter(RunState::Persist);
        run.outcome.expired = store.expire_stale(self.config.store.staleness_window(), now)?;
        store.persist()?;

        match store.backup(now) {
            Ok(backup) => run.outcome.backup = Some(backup.name),
            Err(e) => run.mark_partial(format!("Backup failed: {}", e)),
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // health
    // ---------------------------------------------------------------

    /// Read-only report. Takes no lock and repairs nothing.
    pub fn health(&self) -> RunOutcome {
        let mut run = RunContext::new(Mode::Health);
        let inspection = match inspect(&self.config.data_paths, &self.config.store) {
            Ok(inspection) => inspection,
            Err(e) => return run.abort(e),
        };
        let lock_holder = self.run_lock().holder().unwrap_or_else(|e| {
            warn!("Could not read run lock: {}", e);
            None
        });

        if let Some(marker) = &inspection.degraded {
            run.fatal = true;
            run.outcome.error = Some(format!("store degraded: {}", marker));
        } else if inspection.store_exists && !inspection.store_valid {
            run.fatal = true;
            run.outcome.error = Some(format!(
                "store failed validation: {}",
                inspection.errors.join("; ")
            ));
        } else {
            let tripped: Vec<&str> = inspection
                .domain_health
                .iter()
                .filter(|h| h.circuit_state != CircuitState::Closed)
                .map(|h| h.origin.as_str())
                .collect();
            if !tripped.is_empty() {
                run.mark_partial(format!("circuits not closed: {}", tripped.join(", ")));
            }
        }

        let token_usage = inspection.token_usage.clone().unwrap_or(TokenUsage {
            date: Utc::now().date_naive(),
            tokens_used: 0,
            requests: 0,
        });
        run.outcome.health = Some(HealthReport {
            store: inspection,
            token_usage,
            daily_token_cap: self.config.ai.daily_token_cap,
            lock_holder,
        });
        run.finish()
    }
}

fn release(guard: RunLockGuard, run: &mut RunContext) {
    if let Err(e) = guard.release() {
        warn!("Failed to release run lock: {}", e);
    }
    run.enter(RunState::LockReleased);
}
