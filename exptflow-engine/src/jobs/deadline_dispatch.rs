//! Deadline Dispatch Background Task
//!
//! Turns due timers into schedule events. Each tick:
//!
//! 1. Scans the deadline store for members due now, up to `batch_size`
//! 2. Claims each member with a TTL lease, skipping members held elsewhere
//! 3. Parses the member into (space, experiment, run); malformed members
//!    are removed for good
//! 4. Loads the run log and the experiment, publishes a schedule event and
//!    removes the member only once the publish succeeded
//!
//! Several processes may poll the same store. The claim is the only
//! coordination between them: a member whose claimant dies is picked up by
//! another instance after the claim lapses, so every due member is
//! published at least once.
//!
//! ```ignore
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! let dispatcher = Arc::new(DeadlineDispatcher::new(deps, DispatcherConfig::from_env()));
//! let handle = tokio::spawn(deadline_dispatch_task(dispatcher, shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! let metrics = handle.await?;
//! ```

use crate::config::DispatcherConfig;
use chrono::Utc;
use dashmap::DashMap;
use exptflow_core::services::EventPublisher;
use exptflow_core::{
    DeadlineKey, Experiment, ExptId, ExptflowError, ExptflowResult, RunLog, ScheduleEvent, Session,
    SpaceId, StorageError,
};
use exptflow_storage::{DeadlineStore, ExptStorage};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

// ============================================================================
// METRICS
// ============================================================================

/// Counters for dispatcher activity since startup.
#[derive(Debug, Default)]
pub struct DispatcherMetrics {
    pub ticks: AtomicU64,
    pub scanned: AtomicU64,
    pub claimed: AtomicU64,
    pub published: AtomicU64,
    /// Members dropped because their key could not be parsed.
    pub removed_malformed: AtomicU64,
    /// Members dropped because their run log no longer exists.
    pub removed_missing: AtomicU64,
    pub publish_failures: AtomicU64,
    pub lookup_failures: AtomicU64,
    /// Scan or claim calls that errored.
    pub claim_failures: AtomicU64,
}

impl DispatcherMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> DispatcherSnapshot {
        DispatcherSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            scanned: self.scanned.load(Ordering::Relaxed),
            claimed: self.claimed.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            removed_malformed: self.removed_malformed.load(Ordering::Relaxed),
            removed_missing: self.removed_missing.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            lookup_failures: self.lookup_failures.load(Ordering::Relaxed),
            claim_failures: self.claim_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatcherSnapshot {
    pub ticks: u64,
    pub scanned: u64,
    pub claimed: u64,
    pub published: u64,
    pub removed_malformed: u64,
    pub removed_missing: u64,
    pub publish_failures: u64,
    pub lookup_failures: u64,
    pub claim_failures: u64,
}

// ============================================================================
// DISPATCHER
// ============================================================================

/// What happened to one due member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberOutcome {
    Published,
    /// Claimed by another instance.
    Skipped,
    /// Dropped permanently.
    Removed,
    /// Left in the store for a later tick.
    Retained,
}

/// Per-tick tally returned by [`DeadlineDispatcher::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub scanned: usize,
    pub published: usize,
    pub skipped: usize,
    pub removed: usize,
    pub retained: usize,
}

impl TickReport {
    fn record(&mut self, outcome: MemberOutcome) {
        match outcome {
            MemberOutcome::Published => self.published += 1,
            MemberOutcome::Skipped => self.skipped += 1,
            MemberOutcome::Removed => self.removed += 1,
            MemberOutcome::Retained => self.retained += 1,
        }
    }
}

#[derive(Clone)]
pub struct DispatcherDeps {
    pub storage: Arc<dyn ExptStorage>,
    pub deadlines: Arc<dyn DeadlineStore>,
    pub publisher: Arc<dyn EventPublisher>,
}

pub struct DeadlineDispatcher {
    instance_id: Uuid,
    deps: DispatcherDeps,
    config: DispatcherConfig,
    metrics: Arc<DispatcherMetrics>,
    /// Experiment details loaded during the current tick. Cleared at the
    /// start of every tick.
    expt_cache: DashMap<(SpaceId, ExptId), Arc<Experiment>>,
}

impl DeadlineDispatcher {
    pub fn new(deps: DispatcherDeps, config: DispatcherConfig) -> Self {
        Self {
            instance_id: Uuid::now_v7(),
            deps,
            config,
            metrics: Arc::new(DispatcherMetrics::new()),
            expt_cache: DashMap::new(),
        }
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn metrics(&self) -> Arc<DispatcherMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Run one scan-claim-publish pass.
    pub async fn tick(&self) -> TickReport {
        self.metrics.ticks.fetch_add(1, Ordering::Relaxed);
        self.expt_cache.clear();

        let mut report = TickReport::default();
        let due = match self
            .deps
            .deadlines
            .scan_due(Utc::now(), self.config.batch_size)
            .await
        {
            Ok(due) => due,
            Err(e) => {
                self.metrics.claim_failures.fetch_add(1, Ordering::Relaxed);
                tracing::error!(instance = %self.instance_id, error = %e, "Deadline scan failed");
                return report;
            }
        };
        report.scanned = due.len();
        self.metrics
            .scanned
            .fetch_add(due.len() as u64, Ordering::Relaxed);

        for member in &due {
            let outcome = self.dispatch_member(member).await;
            report.record(outcome);
        }

        if report.scanned > 0 {
            tracing::debug!(
                instance = %self.instance_id,
                scanned = report.scanned,
                published = report.published,
                skipped = report.skipped,
                removed = report.removed,
                retained = report.retained,
                "Deadline dispatch tick completed"
            );
        } else {
            tracing::trace!(instance = %self.instance_id, "Deadline dispatch tick found nothing due");
        }
        report
    }

    async fn dispatch_member(&self, member: &str) -> MemberOutcome {
        match self
            .deps
            .deadlines
            .try_claim(member, self.config.claim_ttl)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(instance = %self.instance_id, member = member, "Member claimed elsewhere");
                return MemberOutcome::Skipped;
            }
            Err(e) => {
                self.metrics.claim_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(instance = %self.instance_id, member = member, error = %e, "Claim failed");
                return MemberOutcome::Skipped;
            }
        }
        self.metrics.claimed.fetch_add(1, Ordering::Relaxed);

        let key: DeadlineKey = match member.parse() {
            Ok(key) => key,
            Err(e) => {
                let err = ExptflowError::MalformedDeadlineKey {
                    member: member.to_string(),
                };
                tracing::warn!(member = member, error = %err, cause = %e, "Dropping malformed deadline member");
                self.remove(member).await;
                self.metrics.removed_malformed.fetch_add(1, Ordering::Relaxed);
                return MemberOutcome::Removed;
            }
        };

        let run_log = match self
            .deps
            .storage
            .run_log_get(key.space_id, key.expt_id, key.run_id)
            .await
        {
            Ok(Some(log)) => log,
            Ok(None) => {
                tracing::warn!(member = member, "Run log not found, dropping deadline member");
                self.remove(member).await;
                self.metrics.removed_missing.fetch_add(1, Ordering::Relaxed);
                return MemberOutcome::Removed;
            }
            Err(e) => {
                self.metrics.lookup_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(member = member, error = %e, "Run log lookup failed");
                return MemberOutcome::Retained;
            }
        };

        let expt = match self.experiment(key.space_id, key.expt_id).await {
            Ok(expt) => expt,
            Err(e) => {
                self.metrics.lookup_failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(member = member, error = %e, "Experiment lookup failed");
                return MemberOutcome::Retained;
            }
        };

        let event = schedule_event_for(&key, &run_log, &expt);
        if let Err(e) = self
            .deps
            .publisher
            .publish_schedule_event(&event, self.config.publish_delay)
            .await
        {
            self.metrics.publish_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(member = member, error = %e, "Schedule event publish failed");
            return MemberOutcome::Retained;
        }

        self.remove(member).await;
        self.metrics.published.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            instance = %self.instance_id,
            space_id = key.space_id,
            expt_id = key.expt_id,
            run_id = key.run_id,
            mode = %run_log.mode,
            "Deadline dispatched"
        );
        MemberOutcome::Published
    }

    async fn experiment(&self, space_id: SpaceId, expt_id: ExptId) -> ExptflowResult<Arc<Experiment>> {
        if let Some(cached) = self.expt_cache.get(&(space_id, expt_id)) {
            return Ok(Arc::clone(cached.value()));
        }
        let expt = self
            .deps
            .storage
            .experiment_get(space_id, expt_id)
            .await?
            .ok_or_else(|| StorageError::not_found("experiment", expt_id))?;
        let expt = Arc::new(expt);
        self.expt_cache.insert((space_id, expt_id), Arc::clone(&expt));
        Ok(expt)
    }

    /// Remove a member. A failed removal only means the member is seen
    /// again once its claim lapses.
    async fn remove(&self, member: &str) {
        if let Err(e) = self.deps.deadlines.remove(member).await {
            tracing::warn!(member = member, error = %e, "Failed to remove deadline member");
        }
    }
}

fn schedule_event_for(key: &DeadlineKey, run_log: &RunLog, expt: &Experiment) -> ScheduleEvent {
    ScheduleEvent::new(
        key.space_id,
        key.expt_id,
        key.run_id,
        run_log.mode,
        expt.expt_type,
        Session::new(run_log.created_by.clone()),
    )
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Run the dispatcher until the shutdown signal flips to `true`.
///
/// A tick in progress finishes before the task exits. Returns the metrics
/// collected over the task's lifetime.
pub async fn deadline_dispatch_task(
    dispatcher: Arc<DeadlineDispatcher>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<DispatcherMetrics> {
    let mut ticker = interval(dispatcher.config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        instance = %dispatcher.instance_id,
        interval_secs = dispatcher.config.interval.as_secs_f64(),
        batch_size = dispatcher.config.batch_size,
        "Deadline dispatcher started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!(instance = %dispatcher.instance_id, "Deadline dispatcher shutting down");
                    break;
                }
            }

            _ = ticker.tick() => {
                dispatcher.tick().await;
            }
        }
    }

    let snapshot = dispatcher.metrics.snapshot();
    tracing::info!(
        instance = %dispatcher.instance_id,
        ticks = snapshot.ticks,
        published = snapshot.published,
        removed_malformed = snapshot.removed_malformed,
        removed_missing = snapshot.removed_missing,
        publish_failures = snapshot.publish_failures,
        "Deadline dispatcher stopped"
    );

    dispatcher.metrics()
}
