//! Run and experiment finalization.
//!
//! Both completions recount from persisted results instead of trusting the
//! counters accumulated while the run executed.

use super::{pause, CompleteOptions, ExptManager};
use crate::constants::{COMPLETE_EXPT_KEY_PREFIX, COMPLETE_RUN_KEY_PREFIX};
use chrono::Utc;
use exptflow_core::{
    run_lease_key, AggrCalculateEvent, Experiment, ExperimentPatch, ExptId, ExptStats, ExptStatus,
    ExptflowResult, ItemId, RunId, SpaceId, StatusCounts, TurnId,
};
use std::collections::BTreeSet;

/// Final experiment status.
///
/// A finished override wins. Otherwise any unsuccessful or unfinished item
/// makes the experiment Failed.
pub fn final_expt_status(override_status: Option<ExptStatus>, counts: &StatusCounts) -> ExptStatus {
    match override_status {
        Some(status) if status.is_finished() => status,
        _ if counts.has_unsuccessful() => ExptStatus::Failed,
        _ => ExptStatus::Success,
    }
}

/// Run status from a recount: queued or failed turns fail the run.
fn run_status(counts: &StatusCounts) -> ExptStatus {
    if counts.pending > 0 || counts.fail > 0 {
        ExptStatus::Failed
    } else {
        ExptStatus::Success
    }
}

impl ExptManager {
    // ========================================================================
    // RUN
    // ========================================================================

    /// Finalize a run: recount, release the run lease and save the run log.
    pub async fn complete_run(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
        opts: CompleteOptions,
    ) -> ExptflowResult<()> {
        opts.wait_pre_delay().await;

        let token_key = opts.token_key(COMPLETE_RUN_KEY_PREFIX);
        if let Some(key) = &token_key {
            if self.seen(key).await {
                tracing::info!(expt_id = expt_id, run_id = run_id, key = %key, "Duplicate run completion");
                return Ok(());
            }
        }

        let mut log = self.get_run_log(space_id, expt_id, run_id).await?;
        let counts = self.calculate_run_log_stats(space_id, expt_id).await?;

        self.deps.leases.release(&run_lease_key(expt_id)).await?;

        let next = opts.status.unwrap_or_else(|| run_status(&counts));
        log.counts = counts;
        if log.status.can_transition_to(next) {
            log.status = next;
        } else {
            tracing::debug!(
                expt_id = expt_id,
                run_id = run_id,
                current = %log.status,
                requested = %next,
                "Run log already finished, keeping status"
            );
        }
        if let Some(message) = opts.status_message.as_ref().filter(|m| !m.is_empty()) {
            log.status_message = Some(message.clone());
        }
        log.updated_at = Some(Utc::now());
        self.deps.storage.run_log_save(&log).await?;

        if let Some(key) = &token_key {
            self.mark_seen(key, self.config.complete_token_ttl).await;
        }

        tracing::info!(
            space_id = space_id,
            expt_id = expt_id,
            run_id = run_id,
            status = %log.status,
            success = log.counts.success,
            fail = log.counts.fail,
            pending = log.counts.pending,
            "Run completed"
        );
        Ok(())
    }

    // ========================================================================
    // EXPERIMENT
    // ========================================================================

    /// Finalize an experiment.
    ///
    /// A missing or already finished experiment is a no-op.
    pub async fn complete_expt(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        opts: CompleteOptions,
    ) -> ExptflowResult<()> {
        opts.wait_pre_delay().await;

        let token_key = opts.token_key(COMPLETE_EXPT_KEY_PREFIX);
        if let Some(key) = &token_key {
            if self.seen(key).await {
                tracing::info!(expt_id = expt_id, key = %key, "Duplicate experiment completion");
                return Ok(());
            }
        }

        let Some(expt) = self.deps.storage.experiment_get(space_id, expt_id).await? else {
            tracing::info!(space_id = space_id, expt_id = expt_id, "Completing deleted experiment, ignored");
            return Ok(());
        };
        if expt.status.is_finished() {
            tracing::info!(
                expt_id = expt_id,
                status = %expt.status,
                "Experiment already finished"
            );
            return Ok(());
        }

        let counts = self.refresh_expt_stats(space_id, expt_id).await?;
        let status = final_expt_status(opts.status, &counts);

        if !opts.no_complete_item_turn && status == ExptStatus::Terminated {
            self.terminate_incomplete(&expt).await?;
        }

        let now = Utc::now();
        self.deps
            .storage
            .experiment_update(
                space_id,
                expt_id,
                &ExperimentPatch {
                    status: Some(status),
                    status_message: opts.status_message.clone().filter(|m| !m.is_empty()),
                    end_at: Some(now),
                    ..Default::default()
                },
            )
            .await?;

        self.deps
            .quota
            .release_run(space_id, expt_id, expt.latest_run_id)
            .await?;

        if let Some(key) = &token_key {
            self.mark_seen(key, self.config.complete_token_ttl).await;
        }

        if !opts.no_aggr_calculate {
            let event = AggrCalculateEvent {
                space_id,
                expt_id,
                created_at: now.timestamp(),
            };
            if let Err(e) = self
                .deps
                .publisher
                .publish_aggr_calculate_event(&event, self.config.aggr_event_delay)
                .await
            {
                tracing::warn!(expt_id = expt_id, error = %e, "Failed to publish aggregation event");
            }
        }

        let finished = Experiment {
            status,
            end_at: Some(now),
            ..expt
        };
        self.notify_best_effort(&finished, status).await;

        let elapsed = finished.start_at.and_then(|start| (now - start).to_std().ok());
        self.metrics
            .record_expt_result(finished.expt_type, status, elapsed);

        tracing::info!(
            space_id = space_id,
            expt_id = expt_id,
            status = %status,
            success = counts.success,
            fail = counts.fail,
            pending = counts.pending,
            processing = counts.processing,
            terminated = counts.terminated,
            "Experiment completed"
        );
        Ok(())
    }

    /// Terminate the experiment with a message.
    pub async fn kill(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        message: impl Into<String>,
    ) -> ExptflowResult<()> {
        self.complete_expt(
            space_id,
            expt_id,
            CompleteOptions::new()
                .with_status(ExptStatus::Terminated)
                .with_message(message),
        )
        .await
    }

    /// Recompute the experiment stats row from persisted results.
    pub(super) async fn refresh_expt_stats(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
    ) -> ExptflowResult<StatusCounts> {
        let counts = self.deps.results.calculate_stats(space_id, expt_id).await?;
        self.deps
            .storage
            .stats_save(&ExptStats {
                expt_id,
                space_id,
                counts,
                updated_at: Some(Utc::now()),
            })
            .await?;
        Ok(counts)
    }

    // ========================================================================
    // TERMINATION CASCADE
    // ========================================================================

    /// Mark every still-incomplete turn and item of `expt` as Terminal.
    ///
    /// Chunks that fail are logged and skipped. The filter index of the
    /// touched items is refreshed at the end.
    async fn terminate_incomplete(&self, expt: &Experiment) -> ExptflowResult<()> {
        let turns = self
            .deps
            .results
            .incomplete_turns(expt.space_id, expt.id)
            .await?;
        if turns.is_empty() {
            return Ok(());
        }

        let chunk_size = self.config.terminate_chunk_size.max(1);
        let mut touched: BTreeSet<ItemId> = BTreeSet::new();
        let mut terminated_turns = 0usize;

        for chunk in turns.chunks(chunk_size) {
            let keys: Vec<(ItemId, TurnId)> = chunk.iter().map(|t| (t.item_id, t.turn_id)).collect();
            let item_ids: Vec<ItemId> = keys
                .iter()
                .map(|(item_id, _)| *item_id)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();

            match self
                .deps
                .storage
                .turn_results_terminate(expt.space_id, expt.id, &keys)
                .await
            {
                Ok(n) => terminated_turns += n,
                Err(e) => {
                    tracing::warn!(expt_id = expt.id, error = %e, "Failed to terminate turn chunk");
                    continue;
                }
            }
            if let Err(e) = self
                .deps
                .storage
                .item_results_terminate(expt.space_id, expt.id, &item_ids)
                .await
            {
                tracing::warn!(expt_id = expt.id, error = %e, "Failed to terminate item chunk");
            }
            touched.extend(item_ids);
            pause(self.config.terminate_chunk_pause).await;
        }

        let touched: Vec<ItemId> = touched.into_iter().collect();
        if let Err(e) = self
            .deps
            .results
            .upsert_turn_result_filter(expt.space_id, expt.id, &touched)
            .await
        {
            tracing::warn!(expt_id = expt.id, error = %e, "Failed to refresh turn result filter");
        }

        tracing::info!(
            expt_id = expt.id,
            turns = terminated_turns,
            items = touched.len(),
            "Incomplete results terminated"
        );
        Ok(())
    }
}
