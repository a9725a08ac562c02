//! Run-level recount over persisted turn results.

use super::{pause, ExptManager};
use exptflow_core::{ExptId, ExptflowResult, Page, SpaceId, StatusCounts};

impl ExptManager {
    /// Tally every turn result of the experiment, page by page.
    ///
    /// Counts are rebuilt from storage on every call. If the page ceiling
    /// stops the scan early, the unscanned remainder is counted as pending.
    pub(super) async fn calculate_run_log_stats(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
    ) -> ExptflowResult<StatusCounts> {
        let page_size = self.config.stats_page_size.max(1);
        let mut counts = StatusCounts::default();
        let mut scanned: i64 = 0;
        let mut total: i64 = 0;
        let mut exhausted = false;

        for page_no in 0..self.config.stats_max_pages {
            let page = self
                .deps
                .storage
                .turn_results_list(space_id, expt_id, Page::new(page_no * page_size, page_size))
                .await?;
            total = page.total;
            scanned += page.rows.len() as i64;
            for turn in &page.rows {
                counts.record(turn.status);
            }

            if scanned >= total || page.rows.is_empty() {
                exhausted = true;
                break;
            }
            pause(self.config.stats_page_pause).await;
        }

        if !exhausted && scanned < total {
            tracing::error!(
                space_id = space_id,
                expt_id = expt_id,
                scanned = scanned,
                total = total,
                max_pages = self.config.stats_max_pages,
                "Turn result scan hit the page ceiling, counting the rest as pending"
            );
            counts.pending += total - scanned;
        }

        tracing::debug!(
            expt_id = expt_id,
            scanned = scanned,
            total = total,
            "Run stats recalculated"
        );
        Ok(counts)
    }
}
