//! Experiment lifecycle manager.
//!
//! Owns every mutation of experiment and run-log rows. Runs of one
//! experiment are serialized by the run lease taken in [`ExptManager::log_run`]
//! and released in [`ExptManager::complete_run`]. Completion and drain
//! triggers are collapsed to a single side effect per caller token through
//! the idempotency store.
//!
//! Operations are split by concern:
//!
//! - `check`: pre-run validator chain
//! - `execution`: run, retry, append, drain and run-log bookkeeping
//! - `completion`: run and experiment finalization, termination cascade
//! - `stats`: run-level recount over paginated turn results
//! - `notify`: status notification cards

mod check;
mod completion;
mod execution;
mod notify;
mod stats;

pub use check::RunCheck;
pub use completion::final_expt_status;

use crate::config::ManagerConfig;
use crate::telemetry::ExptMetrics;
use exptflow_core::services::{
    AuditService, BenefitService, EvalTargetService, EventPublisher, NotifyAdapter, QuotaService,
    ResultService, UserProvider,
};
use exptflow_core::{Experiment, ExptId, ExptStatus, ExptflowResult, SpaceId, StorageError};
use exptflow_storage::{ExptStorage, IdempotencyStore, LeaseStore};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// DEPENDENCIES
// ============================================================================

/// Stores and services the manager drives.
#[derive(Clone)]
pub struct ManagerDeps {
    pub storage: Arc<dyn ExptStorage>,
    pub leases: Arc<dyn LeaseStore>,
    pub idempotency: Arc<dyn IdempotencyStore>,
    pub publisher: Arc<dyn EventPublisher>,
    pub quota: Arc<dyn QuotaService>,
    pub benefit: Arc<dyn BenefitService>,
    pub audit: Arc<dyn AuditService>,
    pub target: Arc<dyn EvalTargetService>,
    pub results: Arc<dyn ResultService>,
    pub users: Arc<dyn UserProvider>,
    pub notifier: Arc<dyn NotifyAdapter>,
}

// ============================================================================
// COMPLETION OPTIONS
// ============================================================================

/// Options for [`ExptManager::complete_run`] and [`ExptManager::complete_expt`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompleteOptions {
    /// Final status to apply instead of the computed one.
    pub status: Option<ExptStatus>,
    pub status_message: Option<String>,
    /// Caller token. Repeated calls with the same token act once.
    pub token: Option<String>,
    /// Wait before reading anything, letting in-flight writes land.
    pub pre_delay: Option<Duration>,
    pub no_aggr_calculate: bool,
    pub no_complete_item_turn: bool,
}

impl CompleteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: ExptStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.status_message = Some(message.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_pre_delay(mut self, delay: Duration) -> Self {
        self.pre_delay = Some(delay);
        self
    }

    pub fn skip_aggr_calculate(mut self) -> Self {
        self.no_aggr_calculate = true;
        self
    }

    pub fn skip_item_turn_completion(mut self) -> Self {
        self.no_complete_item_turn = true;
        self
    }

    /// Idempotency key for this token under `prefix`, if a token was given.
    fn token_key(&self, prefix: &str) -> Option<String> {
        self.token
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|t| format!("{prefix}{t}"))
    }

    async fn wait_pre_delay(&self) {
        if let Some(delay) = self.pre_delay.filter(|d| !d.is_zero()) {
            tokio::time::sleep(delay).await;
        }
    }
}

// ============================================================================
// MANAGER
// ============================================================================

pub struct ExptManager {
    deps: ManagerDeps,
    config: ManagerConfig,
    metrics: ExptMetrics,
}

impl ExptManager {
    pub fn new(deps: ManagerDeps, config: ManagerConfig, metrics: ExptMetrics) -> Self {
        Self {
            deps,
            config,
            metrics,
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Load an experiment, failing with `NotFound` if it is gone.
    async fn load_experiment(&self, space_id: SpaceId, expt_id: ExptId) -> ExptflowResult<Experiment> {
        self.deps
            .storage
            .experiment_get(space_id, expt_id)
            .await?
            .ok_or_else(|| StorageError::not_found("experiment", expt_id).into())
    }

    /// Whether an idempotency marker is already set. A failing lookup is
    /// logged and treated as unseen.
    async fn seen(&self, key: &str) -> bool {
        match self.deps.idempotency.exists(key).await {
            Ok(seen) => seen,
            Err(e) => {
                tracing::warn!(key = key, error = %e, "Idempotency lookup failed");
                false
            }
        }
    }

    async fn mark_seen(&self, key: &str, ttl: Duration) {
        if let Err(e) = self.deps.idempotency.set(key, ttl).await {
            tracing::warn!(key = key, error = %e, "Failed to set idempotency marker");
        }
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}
