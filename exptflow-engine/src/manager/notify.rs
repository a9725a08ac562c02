//! Status notification cards sent to the experiment creator.

use super::ExptManager;
use crate::constants::{NOTIFY_EMPTY_PARAM, NOTIFY_TIME_FORMAT};
use exptflow_core::services::NotifyCard;
use exptflow_core::{Experiment, ExptStatus, ExptflowResult, NotifyError, Timestamp};
use std::collections::HashMap;

fn title_for(status: ExptStatus) -> Option<&'static str> {
    match status {
        ExptStatus::Success => Some("Experiment succeeded"),
        ExptStatus::Failed => Some("Experiment failed"),
        ExptStatus::Terminated | ExptStatus::SystemTerminated => Some("Experiment terminated"),
        ExptStatus::Pending => Some("Experiment starting"),
        _ => None,
    }
}

fn format_time(ts: Option<Timestamp>) -> String {
    ts.map(|t| t.format(NOTIFY_TIME_FORMAT).to_string())
        .unwrap_or_else(|| NOTIFY_EMPTY_PARAM.to_string())
}

/// Build the card for `status`. Statuses without a template are rejected.
pub(crate) fn build_card(expt: &Experiment, status: ExptStatus) -> Result<NotifyCard, NotifyError> {
    let title = title_for(status).ok_or_else(|| NotifyError::UnsupportedStatus {
        status: status.to_string(),
    })?;
    let params = HashMap::from([
        ("expt_name".to_string(), expt.name.clone()),
        ("space_id".to_string(), expt.space_id.to_string()),
        ("expt_id".to_string(), expt.id.to_string()),
        ("start_time".to_string(), format_time(expt.start_at)),
        ("end_time".to_string(), format_time(expt.end_at)),
    ]);
    Ok(NotifyCard {
        title: title.to_string(),
        params,
    })
}

impl ExptManager {
    /// Send the status card for `expt` to its creator.
    ///
    /// Skipped unless exactly one user resolves. Errors are returned to the
    /// caller; lifecycle operations go through `notify_best_effort` instead.
    pub async fn send_expt_notify(&self, expt: &Experiment, status: ExptStatus) -> ExptflowResult<()> {
        let card = build_card(expt, status)?;

        let users = self
            .deps
            .users
            .get_users(std::slice::from_ref(&expt.created_by))
            .await
            .map_err(|e| NotifyError::UserLookup {
                reason: e.to_string(),
            })?;
        let [recipient] = users.as_slice() else {
            tracing::debug!(
                expt_id = expt.id,
                created_by = %expt.created_by,
                resolved = users.len(),
                "Notify recipient not resolved, skipping"
            );
            return Ok(());
        };

        self.deps
            .notifier
            .send_card(recipient, &card)
            .await
            .map_err(|e| NotifyError::SendFailed {
                reason: e.to_string(),
            })?;
        Ok(())
    }

    pub(super) async fn notify_best_effort(&self, expt: &Experiment, status: ExptStatus) {
        if let Err(e) = self.send_expt_notify(expt, status).await {
            tracing::warn!(
                space_id = expt.space_id,
                expt_id = expt.id,
                status = %status,
                error = %e,
                "Experiment notification failed"
            );
        }
    }
}
