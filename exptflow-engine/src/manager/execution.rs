//! Run scheduling, appends, drain and run-log bookkeeping.

use super::{pause, ExptManager};
use crate::constants::FINISH_EXPT_KEY_PREFIX;
use chrono::Utc;
use exptflow_core::{
    run_lease_key, ExperimentPatch, ExptId, ExptRunMode, ExptStatus, ExptflowError,
    ExptflowResult, ItemInput, ItemResult, ItemRunLog, RunId, RunLog, RunState, ScheduleEvent,
    Session, SpaceId, StatsDelta, StorageError, TurnResult,
};
use std::collections::{HashMap, HashSet};

impl ExptManager {
    // ========================================================================
    // SCHEDULING
    // ========================================================================

    /// Start a run: reserve a quota slot and publish the schedule event.
    pub async fn run(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
        session: &Session,
        ext: HashMap<String, String>,
    ) -> ExptflowResult<()> {
        self.schedule(space_id, expt_id, run_id, ExptRunMode::Submit, session, ext)
            .await
    }

    /// Rerun every unsuccessful turn of the experiment.
    pub async fn retry_unsuccess(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
        session: &Session,
        ext: HashMap<String, String>,
    ) -> ExptflowResult<()> {
        self.schedule(space_id, expt_id, run_id, ExptRunMode::FailRetry, session, ext)
            .await
    }

    async fn schedule(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
        mode: ExptRunMode,
        session: &Session,
        ext: HashMap<String, String>,
    ) -> ExptflowResult<()> {
        self.deps
            .quota
            .reserve_run(space_id, expt_id, run_id, session)
            .await?;

        let expt = self.load_experiment(space_id, expt_id).await?;
        let event = ScheduleEvent::new(space_id, expt_id, run_id, mode, expt.expt_type, session.clone())
            .with_ext(ext);
        self.deps
            .publisher
            .publish_schedule_event(&event, self.config.schedule_delay)
            .await?;

        if mode == ExptRunMode::Submit {
            self.notify_best_effort(&expt, ExptStatus::Pending).await;
        }

        tracing::info!(
            space_id = space_id,
            expt_id = expt_id,
            run_id = run_id,
            mode = %mode,
            "Experiment run scheduled"
        );
        Ok(())
    }

    /// Move a picked-up experiment into execution.
    ///
    /// A Pending or Processing experiment past its max-alive time is sent
    /// into Draining. Otherwise a Pending experiment becomes Processing.
    /// Returns the status after the call.
    pub async fn begin_schedule(&self, space_id: SpaceId, expt_id: ExptId) -> ExptflowResult<ExptStatus> {
        let expt = self.load_experiment(space_id, expt_id).await?;
        let now = Utc::now();
        let overdue = match (expt.start_at, expt.max_alive_secs) {
            (Some(start), Some(max_alive)) if max_alive > 0 => (now - start).num_seconds() > max_alive,
            _ => false,
        };

        let next = match expt.status {
            ExptStatus::Pending | ExptStatus::Unknown | ExptStatus::Processing if overdue => {
                ExptStatus::Draining
            }
            ExptStatus::Pending | ExptStatus::Unknown => ExptStatus::Processing,
            other => return Ok(other),
        };

        let patch = ExperimentPatch {
            status: Some(next),
            start_at: expt.start_at.is_none().then_some(now),
            ..Default::default()
        };
        self.deps
            .storage
            .experiment_update(space_id, expt_id, &patch)
            .await?;
        tracing::info!(
            space_id = space_id,
            expt_id = expt_id,
            from = %expt.status,
            to = %next,
            "Experiment schedule started"
        );
        Ok(next)
    }

    // ========================================================================
    // APPEND & DRAIN
    // ========================================================================

    /// Append items to a running experiment. Items that already exist are
    /// ignored; when none are new the call does nothing.
    pub async fn invoke(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
        items: Vec<ItemInput>,
        session: &Session,
    ) -> ExptflowResult<()> {
        if items.is_empty() {
            return Ok(());
        }

        let existing: HashSet<i64> = self
            .deps
            .storage
            .item_ids(space_id, expt_id)
            .await?
            .into_iter()
            .collect();
        let mut seen = HashSet::new();
        let new_items: Vec<ItemInput> = items
            .into_iter()
            .filter(|item| !existing.contains(&item.item_id) && seen.insert(item.item_id))
            .collect();
        if new_items.is_empty() {
            tracing::info!(
                space_id = space_id,
                expt_id = expt_id,
                "Invoke found no new items"
            );
            return Ok(());
        }

        let first_idx = match self.deps.storage.item_max_idx(space_id, expt_id).await {
            Ok(Some(max)) => max + 1,
            Ok(None) => 0,
            Err(e) => {
                tracing::error!(
                    space_id = space_id,
                    expt_id = expt_id,
                    error = %e,
                    "Failed to read max item index"
                );
                0
            }
        };

        let turn_count: usize = new_items.iter().map(|item| item.turns.len().max(1)).sum();
        let ids = self.deps.storage.gen_ids(turn_count).await?;
        let mut ids = ids.into_iter();

        let mut item_rows = Vec::with_capacity(new_items.len());
        let mut item_run_logs = Vec::with_capacity(new_items.len());
        let mut turn_rows = Vec::with_capacity(turn_count);
        for (offset, item) in new_items.iter().enumerate() {
            item_rows.push(ItemResult {
                space_id,
                expt_id,
                item_id: item.item_id,
                item_idx: first_idx + offset as i64,
                status: RunState::Queueing,
            });
            item_run_logs.push(ItemRunLog {
                space_id,
                expt_id,
                run_id,
                item_id: item.item_id,
                status: RunState::Queueing,
            });

            // Single-turn items carry no explicit turn and use turn id 0.
            let turn_ids: Vec<i64> = if item.turns.is_empty() {
                vec![0]
            } else {
                item.turns.iter().map(|t| t.turn_id).collect()
            };
            for (turn_idx, turn_id) in turn_ids.into_iter().enumerate() {
                let id = ids.next().ok_or_else(|| StorageError::Unavailable {
                    reason: "id generator returned too few ids".to_string(),
                })?;
                turn_rows.push(TurnResult {
                    id,
                    space_id,
                    expt_id,
                    item_id: item.item_id,
                    turn_id,
                    turn_idx: turn_idx as i64,
                    status: RunState::Queueing,
                });
            }
        }

        self.deps.storage.turn_results_create_nx(&turn_rows).await?;
        self.deps.storage.item_results_create_nx(&item_rows).await?;
        self.deps
            .storage
            .item_run_logs_create_nx(&item_run_logs)
            .await?;

        pause(self.config.invoke_settle_delay).await;

        self.deps
            .storage
            .stats_apply_delta(
                space_id,
                expt_id,
                StatsDelta {
                    pending: item_rows.len() as i64,
                    ..Default::default()
                },
            )
            .await?;

        let expt = self.load_experiment(space_id, expt_id).await?;
        let event = ScheduleEvent::new(
            space_id,
            expt_id,
            run_id,
            ExptRunMode::Append,
            expt.expt_type,
            session.clone(),
        );
        self.deps
            .publisher
            .publish_schedule_event(&event, self.config.schedule_delay)
            .await?;

        tracing::info!(
            space_id = space_id,
            expt_id = expt_id,
            run_id = run_id,
            items = item_rows.len(),
            turns = turn_rows.len(),
            "Items appended"
        );
        Ok(())
    }

    /// Stop accepting appends and flush the remaining work.
    pub async fn finish(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
        session: &Session,
    ) -> ExptflowResult<()> {
        let key = format!("{FINISH_EXPT_KEY_PREFIX}{expt_id}");
        if self.seen(&key).await {
            tracing::info!(expt_id = expt_id, "Finish already requested");
            return Ok(());
        }

        let expt = self.load_experiment(space_id, expt_id).await?;
        if expt.status.is_finished() {
            tracing::info!(
                expt_id = expt_id,
                status = %expt.status,
                "Finish on finished experiment ignored"
            );
            return Ok(());
        }

        self.deps
            .storage
            .experiment_update(
                space_id,
                expt_id,
                &ExperimentPatch {
                    status: Some(ExptStatus::Draining),
                    ..Default::default()
                },
            )
            .await?;

        let event = ScheduleEvent::new(
            space_id,
            expt_id,
            run_id,
            ExptRunMode::Append,
            expt.expt_type,
            session.clone(),
        );
        self.deps
            .publisher
            .publish_schedule_event(&event, self.config.schedule_delay)
            .await?;

        self.mark_seen(&key, self.config.finish_token_ttl).await;
        tracing::info!(
            space_id = space_id,
            expt_id = expt_id,
            run_id = run_id,
            "Experiment draining"
        );
        Ok(())
    }

    // ========================================================================
    // RUN LOG
    // ========================================================================

    /// Take the run lease and create the run log.
    ///
    /// Fails with `LeaseContention` while another run of the experiment
    /// holds the lease.
    pub async fn log_run(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
        mode: ExptRunMode,
        session: &Session,
    ) -> ExptflowResult<()> {
        let lease_key = run_lease_key(expt_id);
        let acquired = self
            .deps
            .leases
            .acquire(&lease_key, self.config.zombie_interval)
            .await?;
        if !acquired {
            return Err(ExptflowError::LeaseContention { expt_id });
        }

        if let Err(e) = self.create_run_log(space_id, expt_id, run_id, mode, session).await {
            if let Err(release_err) = self.deps.leases.release(&lease_key).await {
                tracing::warn!(
                    expt_id = expt_id,
                    error = %release_err,
                    "Failed to release run lease after run log error"
                );
            }
            return Err(e);
        }

        self.metrics.record_run(mode);
        tracing::info!(
            space_id = space_id,
            expt_id = expt_id,
            run_id = run_id,
            mode = %mode,
            "Run logged"
        );
        Ok(())
    }

    async fn create_run_log(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
        mode: ExptRunMode,
        session: &Session,
    ) -> ExptflowResult<()> {
        let log = RunLog {
            id: run_id,
            expt_id,
            space_id,
            mode,
            status: ExptStatus::Pending,
            created_by: session.user_id.clone(),
            created_at: Utc::now(),
            ..Default::default()
        };
        if !self.deps.storage.run_log_create(&log).await? {
            tracing::debug!(expt_id = expt_id, run_id = run_id, "Run log already exists");
        }
        self.deps
            .storage
            .experiment_update(
                space_id,
                expt_id,
                &ExperimentPatch {
                    latest_run_id: Some(run_id),
                    ..Default::default()
                },
            )
            .await
    }

    pub async fn get_run_log(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
    ) -> ExptflowResult<RunLog> {
        self.deps
            .storage
            .run_log_get(space_id, expt_id, run_id)
            .await?
            .ok_or_else(|| StorageError::not_found("run_log", run_id).into())
    }

    /// Refresh the run log counts without finalizing it.
    pub async fn pend_run(&self, space_id: SpaceId, expt_id: ExptId, run_id: RunId) -> ExptflowResult<()> {
        let mut log = self.get_run_log(space_id, expt_id, run_id).await?;
        log.counts = self.calculate_run_log_stats(space_id, expt_id).await?;
        if !log.status.is_finished() {
            log.status = ExptStatus::Pending;
        }
        log.updated_at = Some(Utc::now());
        self.deps.storage.run_log_save(&log).await?;
        tracing::debug!(
            expt_id = expt_id,
            run_id = run_id,
            pending = log.counts.pending,
            success = log.counts.success,
            fail = log.counts.fail,
            "Run stats snapshot saved"
        );
        Ok(())
    }

    /// Refresh the experiment stats row without finalizing the experiment.
    pub async fn pend_expt(&self, space_id: SpaceId, expt_id: ExptId) -> ExptflowResult<()> {
        self.refresh_expt_stats(space_id, expt_id).await?;
        Ok(())
    }

    /// Mark the run and the experiment as terminating.
    pub async fn set_expt_terminating(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
    ) -> ExptflowResult<()> {
        let expt = self.load_experiment(space_id, expt_id).await?;
        if expt.status.is_finished() {
            tracing::info!(
                expt_id = expt_id,
                status = %expt.status,
                "Terminating on finished experiment ignored"
            );
            return Ok(());
        }

        self.deps
            .storage
            .run_log_update_status(space_id, expt_id, run_id, ExptStatus::Terminating)
            .await?;
        self.deps
            .storage
            .experiment_update(
                space_id,
                expt_id,
                &ExperimentPatch {
                    status: Some(ExptStatus::Terminating),
                    ..Default::default()
                },
            )
            .await?;
        tracing::info!(
            space_id = space_id,
            expt_id = expt_id,
            run_id = run_id,
            "Experiment terminating"
        );
        Ok(())
    }
}
