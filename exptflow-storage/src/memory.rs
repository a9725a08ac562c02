//! In-memory `ExptStorage` for tests and local development.

use crate::repo::{ExptStorage, PageResult};
use ::async_trait::async_trait;
use chrono::Utc;
use exptflow_core::{
    Experiment, ExperimentPatch, ExptId, ExptStats, ExptStatus, ExptflowResult, ItemId,
    ItemResult, ItemRunLog, Page, RunId, RunLog, RunState, SpaceId, StatsDelta, StorageError,
    TurnId, TurnResult,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

type ExptKey = (SpaceId, ExptId);

/// Mock storage backed by maps behind async locks.
///
/// Result maps are ordered so paginated listings are stable.
#[derive(Debug, Clone)]
pub struct MockStorage {
    experiments: Arc<RwLock<HashMap<ExptKey, Experiment>>>,
    run_logs: Arc<RwLock<HashMap<(SpaceId, ExptId, RunId), RunLog>>>,
    items: Arc<RwLock<BTreeMap<(SpaceId, ExptId, ItemId), ItemResult>>>,
    item_run_logs: Arc<RwLock<BTreeMap<(SpaceId, ExptId, RunId, ItemId), ItemRunLog>>>,
    turns: Arc<RwLock<BTreeMap<(SpaceId, ExptId, ItemId, TurnId), TurnResult>>>,
    stats: Arc<RwLock<HashMap<ExptKey, ExptStats>>>,
    next_id: Arc<AtomicI64>,
    unavailable: Arc<AtomicBool>,
}

impl Default for MockStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MockStorage {
    pub fn new() -> Self {
        Self {
            experiments: Arc::new(RwLock::new(HashMap::new())),
            run_logs: Arc::new(RwLock::new(HashMap::new())),
            items: Arc::new(RwLock::new(BTreeMap::new())),
            item_run_logs: Arc::new(RwLock::new(BTreeMap::new())),
            turns: Arc::new(RwLock::new(BTreeMap::new())),
            stats: Arc::new(RwLock::new(HashMap::new())),
            next_id: Arc::new(AtomicI64::new(10_000)),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Make every call fail with `StorageError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn clear(&self) {
        self.experiments.write().await.clear();
        self.run_logs.write().await.clear();
        self.items.write().await.clear();
        self.item_run_logs.write().await.clear();
        self.turns.write().await.clear();
        self.stats.write().await.clear();
    }

    pub async fn item_count(&self, space_id: SpaceId, expt_id: ExptId) -> usize {
        self.items
            .read()
            .await
            .keys()
            .filter(|(s, e, _)| *s == space_id && *e == expt_id)
            .count()
    }

    pub async fn turn_count(&self, space_id: SpaceId, expt_id: ExptId) -> usize {
        self.turns
            .read()
            .await
            .keys()
            .filter(|(s, e, _, _)| *s == space_id && *e == expt_id)
            .count()
    }

    pub async fn item_run_log_count(&self, space_id: SpaceId, expt_id: ExptId) -> usize {
        self.item_run_logs
            .read()
            .await
            .keys()
            .filter(|(s, e, _, _)| *s == space_id && *e == expt_id)
            .count()
    }

    pub async fn item_get(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        item_id: ItemId,
    ) -> Option<ItemResult> {
        self.items.read().await.get(&(space_id, expt_id, item_id)).cloned()
    }

    pub async fn turn_get(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        item_id: ItemId,
        turn_id: TurnId,
    ) -> Option<TurnResult> {
        self.turns
            .read()
            .await
            .get(&(space_id, expt_id, item_id, turn_id))
            .cloned()
    }

    fn check_available(&self) -> ExptflowResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: "mock storage marked unavailable".to_string(),
            }
            .into());
        }
        Ok(())
    }
}

fn page_of<T: Clone>(rows: Vec<T>, page: Page) -> PageResult<T> {
    let total = rows.len() as i64;
    let rows = rows.into_iter().skip(page.offset).take(page.limit).collect();
    PageResult { rows, total }
}

#[async_trait]
impl ExptStorage for MockStorage {
    // ========================================================================
    // EXPERIMENT OPERATIONS
    // ========================================================================

    async fn experiment_insert(&self, expt: &Experiment) -> ExptflowResult<()> {
        self.check_available()?;
        let mut experiments = self.experiments.write().await;
        let key = (expt.space_id, expt.id);
        if experiments.contains_key(&key) {
            return Err(StorageError::Conflict {
                entity: "experiment",
                id: expt.id.to_string(),
                reason: "already exists".to_string(),
            }
            .into());
        }
        experiments.insert(key, expt.clone());
        Ok(())
    }

    async fn experiment_get(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
    ) -> ExptflowResult<Option<Experiment>> {
        self.check_available()?;
        Ok(self.experiments.read().await.get(&(space_id, expt_id)).cloned())
    }

    async fn experiment_update(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        patch: &ExperimentPatch,
    ) -> ExptflowResult<()> {
        self.check_available()?;
        let mut experiments = self.experiments.write().await;
        let expt = experiments
            .get_mut(&(space_id, expt_id))
            .ok_or_else(|| StorageError::not_found("experiment", expt_id))?;

        if let Some(status) = patch.status {
            expt.status = status;
        }
        if let Some(message) = &patch.status_message {
            expt.status_message = Some(message.clone());
        }
        if let Some(run_id) = patch.latest_run_id {
            expt.latest_run_id = run_id;
        }
        if let Some(credit_free) = patch.credit_free {
            expt.credit_free = credit_free;
        }
        if let Some(start_at) = patch.start_at {
            expt.start_at = Some(start_at);
        }
        if let Some(end_at) = patch.end_at {
            expt.end_at = Some(end_at);
        }
        Ok(())
    }

    // ========================================================================
    // RUN LOG OPERATIONS
    // ========================================================================

    async fn run_log_get(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
    ) -> ExptflowResult<Option<RunLog>> {
        self.check_available()?;
        Ok(self
            .run_logs
            .read()
            .await
            .get(&(space_id, expt_id, run_id))
            .cloned())
    }

    async fn run_log_create(&self, log: &RunLog) -> ExptflowResult<bool> {
        self.check_available()?;
        let mut run_logs = self.run_logs.write().await;
        let key = (log.space_id, log.expt_id, log.id);
        if run_logs.contains_key(&key) {
            return Ok(false);
        }
        run_logs.insert(key, log.clone());
        Ok(true)
    }

    async fn run_log_save(&self, log: &RunLog) -> ExptflowResult<()> {
        self.check_available()?;
        let mut saved = log.clone();
        saved.updated_at = Some(Utc::now());
        self.run_logs
            .write()
            .await
            .insert((log.space_id, log.expt_id, log.id), saved);
        Ok(())
    }

    async fn run_log_update_status(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
        status: ExptStatus,
    ) -> ExptflowResult<()> {
        self.check_available()?;
        let mut run_logs = self.run_logs.write().await;
        let log = run_logs
            .get_mut(&(space_id, expt_id, run_id))
            .ok_or_else(|| StorageError::not_found("run_log", run_id))?;
        if log.status.can_transition_to(status) {
            log.status = status;
            log.updated_at = Some(Utc::now());
        }
        Ok(())
    }

    // ========================================================================
    // ITEM OPERATIONS
    // ========================================================================

    async fn item_ids(&self, space_id: SpaceId, expt_id: ExptId) -> ExptflowResult<Vec<ItemId>> {
        self.check_available()?;
        Ok(self
            .items
            .read()
            .await
            .keys()
            .filter(|(s, e, _)| *s == space_id && *e == expt_id)
            .map(|(_, _, item_id)| *item_id)
            .collect())
    }

    async fn item_max_idx(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
    ) -> ExptflowResult<Option<i64>> {
        self.check_available()?;
        Ok(self
            .items
            .read()
            .await
            .values()
            .filter(|item| item.space_id == space_id && item.expt_id == expt_id)
            .map(|item| item.item_idx)
            .max())
    }

    async fn item_results_create_nx(&self, rows: &[ItemResult]) -> ExptflowResult<usize> {
        self.check_available()?;
        let mut items = self.items.write().await;
        let mut created = 0;
        for row in rows {
            let key = (row.space_id, row.expt_id, row.item_id);
            if !items.contains_key(&key) {
                items.insert(key, row.clone());
                created += 1;
            }
        }
        Ok(created)
    }

    async fn item_run_logs_create_nx(&self, rows: &[ItemRunLog]) -> ExptflowResult<usize> {
        self.check_available()?;
        let mut logs = self.item_run_logs.write().await;
        let mut created = 0;
        for row in rows {
            let key = (row.space_id, row.expt_id, row.run_id, row.item_id);
            if !logs.contains_key(&key) {
                logs.insert(key, row.clone());
                created += 1;
            }
        }
        Ok(created)
    }

    async fn item_results_list(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        page: Page,
    ) -> ExptflowResult<PageResult<ItemResult>> {
        self.check_available()?;
        let rows: Vec<ItemResult> = self
            .items
            .read()
            .await
            .values()
            .filter(|item| item.space_id == space_id && item.expt_id == expt_id)
            .cloned()
            .collect();
        Ok(page_of(rows, page))
    }

    async fn item_result_set_status(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        item_id: ItemId,
        status: RunState,
    ) -> ExptflowResult<bool> {
        self.check_available()?;
        let mut items = self.items.write().await;
        let item = items
            .get_mut(&(space_id, expt_id, item_id))
            .ok_or_else(|| StorageError::not_found("item_result", item_id))?;
        if item.status.is_terminal() {
            return Ok(false);
        }
        item.status = status;
        Ok(true)
    }

    async fn item_results_terminate(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        item_ids: &[ItemId],
    ) -> ExptflowResult<usize> {
        self.check_available()?;
        let mut items = self.items.write().await;
        let mut changed = 0;
        for item_id in item_ids {
            if let Some(item) = items.get_mut(&(space_id, expt_id, *item_id)) {
                if !item.status.is_terminal() {
                    item.status = RunState::Terminal;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    // ========================================================================
    // TURN OPERATIONS
    // ========================================================================

    async fn turn_results_create_nx(&self, rows: &[TurnResult]) -> ExptflowResult<usize> {
        self.check_available()?;
        let mut turns = self.turns.write().await;
        let mut created = 0;
        for row in rows {
            let key = (row.space_id, row.expt_id, row.item_id, row.turn_id);
            if !turns.contains_key(&key) {
                turns.insert(key, row.clone());
                created += 1;
            }
        }
        Ok(created)
    }

    async fn turn_results_list(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        page: Page,
    ) -> ExptflowResult<PageResult<TurnResult>> {
        self.check_available()?;
        let rows: Vec<TurnResult> = self
            .turns
            .read()
            .await
            .values()
            .filter(|turn| turn.space_id == space_id && turn.expt_id == expt_id)
            .cloned()
            .collect();
        Ok(page_of(rows, page))
    }

    async fn turn_result_set_status(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        item_id: ItemId,
        turn_id: TurnId,
        status: RunState,
    ) -> ExptflowResult<bool> {
        self.check_available()?;
        let mut turns = self.turns.write().await;
        let turn = turns
            .get_mut(&(space_id, expt_id, item_id, turn_id))
            .ok_or_else(|| StorageError::not_found("turn_result", turn_id))?;
        if turn.status.is_terminal() {
            return Ok(false);
        }
        turn.status = status;
        Ok(true)
    }

    async fn turn_results_terminate(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        turns: &[(ItemId, TurnId)],
    ) -> ExptflowResult<usize> {
        self.check_available()?;
        let mut rows = self.turns.write().await;
        let mut changed = 0;
        for (item_id, turn_id) in turns {
            if let Some(turn) = rows.get_mut(&(space_id, expt_id, *item_id, *turn_id)) {
                if !turn.status.is_terminal() {
                    turn.status = RunState::Terminal;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    // ========================================================================
    // STATS OPERATIONS
    // ========================================================================

    async fn stats_get(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
    ) -> ExptflowResult<Option<ExptStats>> {
        self.check_available()?;
        Ok(self.stats.read().await.get(&(space_id, expt_id)).cloned())
    }

    async fn stats_save(&self, stats: &ExptStats) -> ExptflowResult<()> {
        self.check_available()?;
        let mut saved = stats.clone();
        saved.updated_at = Some(Utc::now());
        self.stats
            .write()
            .await
            .insert((stats.space_id, stats.expt_id), saved);
        Ok(())
    }

    async fn stats_apply_delta(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        delta: StatsDelta,
    ) -> ExptflowResult<()> {
        self.check_available()?;
        let mut stats = self.stats.write().await;
        let row = stats.entry((space_id, expt_id)).or_insert_with(|| ExptStats {
            expt_id,
            space_id,
            ..Default::default()
        });
        row.counts.pending += delta.pending;
        row.counts.processing += delta.processing;
        row.counts.success += delta.success;
        row.counts.fail += delta.fail;
        row.counts.terminated += delta.terminated;
        row.updated_at = Some(Utc::now());
        Ok(())
    }

    // ========================================================================
    // ID GENERATION
    // ========================================================================

    async fn gen_ids(&self, count: usize) -> ExptflowResult<Vec<i64>> {
        self.check_available()?;
        let start = self.next_id.fetch_add(count as i64, Ordering::SeqCst);
        Ok((start..start + count as i64).collect())
    }
}

// ============================================================================
// TESTS
// ============================================================================
