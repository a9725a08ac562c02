//! Async repository trait for experiment, run and result rows.
//!
//! Every create path uses create-if-absent semantics keyed by natural
//! identity, so redelivered events never duplicate rows.

use ::async_trait::async_trait;
use exptflow_core::{
    Experiment, ExperimentPatch, ExptId, ExptStats, ExptStatus, ExptflowResult, ItemId,
    ItemResult, ItemRunLog, Page, RunId, RunLog, RunState, SpaceId, StatsDelta, TurnId,
    TurnResult,
};

/// One page of a list call plus the total row count of the whole listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResult<T> {
    pub rows: Vec<T>,
    pub total: i64,
}

/// Async storage trait for the lifecycle manager and turn executors.
#[async_trait]
pub trait ExptStorage: Send + Sync {
    // ========================================================================
    // EXPERIMENT OPERATIONS
    // ========================================================================

    async fn experiment_insert(&self, expt: &Experiment) -> ExptflowResult<()>;

    async fn experiment_get(&self, space_id: SpaceId, expt_id: ExptId)
        -> ExptflowResult<Option<Experiment>>;

    /// Apply a partial update. Fails with `NotFound` if the row is gone.
    async fn experiment_update(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        patch: &ExperimentPatch,
    ) -> ExptflowResult<()>;

    // ========================================================================
    // RUN LOG OPERATIONS
    // ========================================================================

    async fn run_log_get(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
    ) -> ExptflowResult<Option<RunLog>>;

    /// Create the run log unless one already exists. Returns whether it was created.
    async fn run_log_create(&self, log: &RunLog) -> ExptflowResult<bool>;

    async fn run_log_save(&self, log: &RunLog) -> ExptflowResult<()>;

    /// Set the status of an existing run log. A finished run log is left untouched.
    async fn run_log_update_status(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
        status: ExptStatus,
    ) -> ExptflowResult<()>;

    // ========================================================================
    // ITEM OPERATIONS
    // ========================================================================

    async fn item_ids(&self, space_id: SpaceId, expt_id: ExptId) -> ExptflowResult<Vec<ItemId>>;

    /// Highest item index of the experiment, or `None` if it has no items.
    async fn item_max_idx(&self, space_id: SpaceId, expt_id: ExptId)
        -> ExptflowResult<Option<i64>>;

    async fn item_results_create_nx(&self, rows: &[ItemResult]) -> ExptflowResult<usize>;

    async fn item_run_logs_create_nx(&self, rows: &[ItemRunLog]) -> ExptflowResult<usize>;

    async fn item_results_list(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        page: Page,
    ) -> ExptflowResult<PageResult<ItemResult>>;

    /// Set an item's status unless it is already terminal. Returns whether it changed.
    async fn item_result_set_status(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        item_id: ItemId,
        status: RunState,
    ) -> ExptflowResult<bool>;

    /// Mark still-incomplete items as `Terminal`. Returns the number changed.
    async fn item_results_terminate(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        item_ids: &[ItemId],
    ) -> ExptflowResult<usize>;

    // ========================================================================
    // TURN OPERATIONS
    // ========================================================================

    async fn turn_results_create_nx(&self, rows: &[TurnResult]) -> ExptflowResult<usize>;

    /// Page through turn results ordered by (item_id, turn_id).
    async fn turn_results_list(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        page: Page,
    ) -> ExptflowResult<PageResult<TurnResult>>;

    /// Set a turn's status unless it is already terminal. Returns whether it changed.
    async fn turn_result_set_status(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        item_id: ItemId,
        turn_id: TurnId,
        status: RunState,
    ) -> ExptflowResult<bool>;

    /// Mark still-incomplete turns as `Terminal`. Returns the number changed.
    async fn turn_results_terminate(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        turns: &[(ItemId, TurnId)],
    ) -> ExptflowResult<usize>;

    // ========================================================================
    // STATS OPERATIONS
    // ========================================================================

    async fn stats_get(&self, space_id: SpaceId, expt_id: ExptId)
        -> ExptflowResult<Option<ExptStats>>;

    /// Overwrite the stats row with recomputed counts.
    async fn stats_save(&self, stats: &ExptStats) -> ExptflowResult<()>;

    async fn stats_apply_delta(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        delta: StatsDelta,
    ) -> ExptflowResult<()>;

    // ========================================================================
    // ID GENERATION
    // ========================================================================

    async fn gen_ids(&self, count: usize) -> ExptflowResult<Vec<i64>>;
}
