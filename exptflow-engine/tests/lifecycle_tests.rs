//! Lifecycle manager integration tests over in-memory stores.

#[path = "support/harness.rs"]
mod harness;

use chrono::{Duration as ChronoDuration, Utc};
use exptflow_core::services::BenefitOutcome;
use exptflow_core::{
    run_lease_key, DenyReason, ExperimentPatch, ExptRunMode, ExptStatus, ExptflowError,
    ItemInput, RunState, TurnInput, ValidationError,
};
use exptflow_engine::{CompleteOptions, ManagerConfig};
use exptflow_storage::ExptStorage;
use exptflow_test_utils::assertions::{assert_not_found, assert_validation_err};
use exptflow_test_utils::fixtures::{items, ExperimentBuilder, TEST_USER};
use harness::{Harness, SPACE};
use std::collections::HashMap;

const RUN: i64 = 77;

/// Append one single-turn item per state and move each to that state.
async fn seed(h: &Harness, expt_id: i64, states: &[RunState]) {
    let ids: Vec<i64> = (1..=states.len() as i64).collect();
    h.manager
        .invoke(SPACE, expt_id, RUN, items(&ids), &h.session())
        .await
        .unwrap();
    for (id, state) in ids.iter().zip(states) {
        if *state != RunState::Queueing {
            h.storage
                .turn_result_set_status(SPACE, expt_id, *id, 0, *state)
                .await
                .unwrap();
            h.storage
                .item_result_set_status(SPACE, expt_id, *id, *state)
                .await
                .unwrap();
        }
    }
}

async fn processing_expt(h: &Harness, expt_id: i64) {
    h.insert(
        &ExperimentBuilder::new(SPACE, expt_id)
            .status(ExptStatus::Processing)
            .latest_run_id(RUN)
            .build(),
    )
    .await;
}

// ============================================================================
// INVOKE
// ============================================================================

#[tokio::test]
async fn test_invoke_skips_existing_and_repeated_items() {
    let h = Harness::new();
    processing_expt(&h, 10).await;

    h.manager
        .invoke(SPACE, 10, RUN, items(&[1, 2]), &h.session())
        .await
        .unwrap();
    assert_eq!(h.storage.item_count(SPACE, 10).await, 2);
    assert_eq!(h.storage.turn_count(SPACE, 10).await, 2);
    assert_eq!(h.storage.item_run_log_count(SPACE, 10).await, 2);

    h.manager
        .invoke(SPACE, 10, RUN, items(&[2, 3, 3]), &h.session())
        .await
        .unwrap();
    assert_eq!(h.storage.item_count(SPACE, 10).await, 3);

    let stats = h.storage.stats_get(SPACE, 10).await.unwrap().unwrap();
    assert_eq!(stats.counts.pending, 3);

    let item3 = h.storage.item_get(SPACE, 10, 3).await.unwrap();
    assert_eq!(item3.item_idx, 2);
    assert_eq!(item3.status, RunState::Queueing);

    let events = h.publisher.schedule_events();
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.expt_run_mode == ExptRunMode::Append));
}

#[tokio::test]
async fn test_invoke_with_nothing_new_publishes_nothing() {
    let h = Harness::new();
    processing_expt(&h, 11).await;
    h.manager
        .invoke(SPACE, 11, RUN, items(&[1]), &h.session())
        .await
        .unwrap();

    h.manager
        .invoke(SPACE, 11, RUN, items(&[1]), &h.session())
        .await
        .unwrap();
    h.manager
        .invoke(SPACE, 11, RUN, Vec::new(), &h.session())
        .await
        .unwrap();

    assert_eq!(h.publisher.schedule_count(), 1);
    let stats = h.storage.stats_get(SPACE, 11).await.unwrap().unwrap();
    assert_eq!(stats.counts.pending, 1);
}

#[tokio::test]
async fn test_invoke_creates_one_row_per_turn() {
    let h = Harness::new();
    processing_expt(&h, 12).await;
    let batch = vec![
        ItemInput {
            item_id: 1,
            turns: vec![
                TurnInput {
                    turn_id: 5,
                    fields: HashMap::new(),
                },
                TurnInput {
                    turn_id: 6,
                    fields: HashMap::new(),
                },
            ],
        },
        ItemInput {
            item_id: 2,
            turns: Vec::new(),
        },
    ];

    h.manager
        .invoke(SPACE, 12, RUN, batch, &h.session())
        .await
        .unwrap();

    assert_eq!(h.storage.turn_count(SPACE, 12).await, 3);
    let second = h.storage.turn_get(SPACE, 12, 1, 6).await.unwrap();
    assert_eq!(second.turn_idx, 1);
    let bare = h.storage.turn_get(SPACE, 12, 2, 0).await.unwrap();
    assert_eq!(bare.turn_idx, 0);
    assert_eq!(bare.status, RunState::Queueing);
}

// ============================================================================
// CHECK RUN
// ============================================================================

#[tokio::test]
async fn test_check_run_accepts_valid_experiment() {
    let h = Harness::new();
    h.insert(&ExperimentBuilder::new(SPACE, 20).build()).await;
    h.manager.check_run(SPACE, 20, &h.session()).await.unwrap();
    assert_eq!(h.benefit.requests().len(), 1);
    assert_eq!(
        h.audit.audited_texts(),
        vec!["experiment-20".to_string(), "nightly regression".to_string()]
    );
}

#[tokio::test]
async fn test_check_run_rejects_empty_eval_set() {
    let h = Harness::new();
    h.insert(&ExperimentBuilder::new(SPACE, 21).item_count(0).build())
        .await;

    let result = h.manager.check_run(SPACE, 21, &h.session()).await;
    assert_validation_err(&result);
    let message = result.unwrap_err().to_string();
    assert!(message.contains("empty EvalSetVersion"), "{message}");
}

#[tokio::test]
async fn test_check_run_online_needs_eval_set_but_no_benefit() {
    let h = Harness::new();
    h.insert(&ExperimentBuilder::new(SPACE, 22).online().item_count(0).build())
        .await;
    h.benefit.set_outcome(BenefitOutcome::denied(DenyReason::QuotaExhausted));

    // Online runs do not need items up front and are never billed here.
    h.manager.check_run(SPACE, 22, &h.session()).await.unwrap();
    assert!(h.benefit.requests().is_empty());

    h.insert(
        &ExperimentBuilder::new(SPACE, 29)
            .online()
            .without_eval_set()
            .build(),
    )
    .await;
    let result = h.manager.check_run(SPACE, 29, &h.session()).await;
    assert!(matches!(
        result,
        Err(ExptflowError::Validation(ValidationError::RequiredFieldMissing { ref field })) if field == "eval_set"
    ));
}

#[tokio::test]
async fn test_check_run_rejects_concurrency_and_audit() {
    let h = Harness::new();
    h.insert(&ExperimentBuilder::new(SPACE, 23).item_concurrency(500).build())
        .await;
    let result = h.manager.check_run(SPACE, 23, &h.session()).await;
    assert!(matches!(
        result,
        Err(ExptflowError::Validation(ValidationError::ItemConcurrencyExceeded { requested: 500, .. }))
    ));

    h.insert(&ExperimentBuilder::new(SPACE, 24).build()).await;
    h.audit.reject_with("contains banned words");
    let result = h.manager.check_run(SPACE, 24, &h.session()).await;
    assert!(matches!(
        result,
        Err(ExptflowError::Validation(ValidationError::AuditRejected { .. }))
    ));
}

#[tokio::test]
async fn test_check_run_passes_when_audit_is_down() {
    let h = Harness::new();
    h.insert(&ExperimentBuilder::new(SPACE, 36).build()).await;
    h.audit.set_fail(true);

    h.manager.check_run(SPACE, 36, &h.session()).await.unwrap();
    assert_eq!(h.audit.audited_texts().len(), 2);
}

#[tokio::test]
async fn test_check_run_requires_eval_conf() {
    let h = Harness::new();
    let mut expt = ExperimentBuilder::new(SPACE, 37).name("").build();
    h.insert(&expt).await;
    // A blank name is not a validation concern.
    h.manager.check_run(SPACE, 37, &h.session()).await.unwrap();

    expt.id = 38;
    expt.eval_conf = None;
    h.insert(&expt).await;
    let result = h.manager.check_run(SPACE, 38, &h.session()).await;
    assert!(matches!(
        result,
        Err(ExptflowError::Validation(ValidationError::RequiredFieldMissing { ref field })) if field == "eval_conf"
    ));
}

#[tokio::test]
async fn test_check_run_rejects_bad_connector() {
    let h = Harness::new();

    let mut mismatched = ExperimentBuilder::new(SPACE, 25).build();
    if let Some(conf) = mismatched
        .eval_conf
        .as_mut()
        .and_then(|c| c.connector.target_conf.as_mut())
    {
        conf.target_version_id = 999;
    }
    h.insert(&mismatched).await;
    let result = h.manager.check_run(SPACE, 25, &h.session()).await;
    assert!(matches!(
        result,
        Err(ExptflowError::Validation(ValidationError::TargetVersionMismatch { actual: 999, .. }))
    ));

    let mut unknown_field = ExperimentBuilder::new(SPACE, 26).build();
    if let Some(ingress) = unknown_field
        .eval_conf
        .as_mut()
        .and_then(|c| c.connector.evaluators_conf.as_mut())
        .and_then(|e| e.evaluator_conf.first_mut())
        .and_then(|c| c.ingress_conf.as_mut())
        .and_then(|i| i.eval_set_adapter.as_mut())
    {
        ingress.field_confs[0].from_field = "no_such_field".to_string();
    }
    h.insert(&unknown_field).await;
    let result = h.manager.check_run(SPACE, 26, &h.session()).await;
    assert!(matches!(
        result,
        Err(ExptflowError::Validation(ValidationError::UnknownSchemaField { .. }))
    ));

    let mut unattached = ExperimentBuilder::new(SPACE, 39).build();
    if let Some(conf) = unattached
        .eval_conf
        .as_mut()
        .and_then(|c| c.connector.evaluators_conf.as_mut())
        .and_then(|e| e.evaluator_conf.first_mut())
    {
        conf.evaluator_version_id = 424242;
    }
    h.insert(&unattached).await;
    let result = h.manager.check_run(SPACE, 39, &h.session()).await;
    assert!(matches!(
        result,
        Err(ExptflowError::Validation(ValidationError::InvalidValue { ref field, .. }))
            if field == "evaluator_version_id"
    ));

    h.insert(
        &ExperimentBuilder::new(SPACE, 27)
            .target_runtime_param(r#"{"temperature":0.2}"#)
            .build(),
    )
    .await;
    h.target.set_reject_runtime_param(true);
    let result = h.manager.check_run(SPACE, 27, &h.session()).await;
    assert!(matches!(
        result,
        Err(ExptflowError::Validation(ValidationError::InvalidRuntimeParam { .. }))
    ));
}

#[tokio::test]
async fn test_check_run_benefit_deny_and_free() {
    let h = Harness::new();
    h.insert(&ExperimentBuilder::new(SPACE, 28).build()).await;

    h.benefit.set_outcome(BenefitOutcome::denied(DenyReason::InsufficientBalance));
    let result = h.manager.check_run(SPACE, 28, &h.session()).await;
    assert_eq!(
        result,
        Err(ExptflowError::BenefitDenied {
            reason: DenyReason::InsufficientBalance
        })
    );

    h.benefit.set_outcome(BenefitOutcome::free());
    h.manager.check_run(SPACE, 28, &h.session()).await.unwrap();
    assert!(h.experiment(28).await.credit_free);

    // A credit-free experiment is no longer benefit-checked.
    let before = h.benefit.requests().len();
    h.manager.check_run(SPACE, 28, &h.session()).await.unwrap();
    assert_eq!(h.benefit.requests().len(), before);
}

#[tokio::test]
async fn test_check_run_missing_experiment() {
    let h = Harness::new();
    let result = h.manager.check_run(SPACE, 404, &h.session()).await;
    assert_not_found(&result);
}

// ============================================================================
// RUN / RETRY / BEGIN SCHEDULE
// ============================================================================

#[tokio::test]
async fn test_run_publishes_submit_and_notifies_start() {
    let h = Harness::new();
    h.insert(&ExperimentBuilder::new(SPACE, 30).build()).await;
    let ext = HashMap::from([("source".to_string(), "api".to_string())]);

    h.manager
        .run(SPACE, 30, RUN, &h.session(), ext.clone())
        .await
        .unwrap();
    h.manager
        .retry_unsuccess(SPACE, 30, RUN + 1, &h.session(), HashMap::new())
        .await
        .unwrap();

    let events = h.publisher.schedule_events();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].expt_run_mode, ExptRunMode::Submit);
    assert_eq!(events[0].ext, ext);
    assert_eq!(events[0].session.user_id, TEST_USER);
    assert_eq!(events[1].expt_run_mode, ExptRunMode::FailRetry);
    assert_eq!(events[1].expt_run_id, RUN + 1);
    assert_eq!(h.quota.reserved(), 2);
    assert_eq!(h.notifier.titles(), vec!["Experiment starting".to_string()]);
}

#[tokio::test]
async fn test_run_fails_when_quota_refuses() {
    let h = Harness::new();
    h.insert(&ExperimentBuilder::new(SPACE, 31).build()).await;
    h.quota.set_fail_reserve(true);

    let result = h.manager.run(SPACE, 31, RUN, &h.session(), HashMap::new()).await;
    assert!(result.is_err());
    assert_eq!(h.publisher.schedule_count(), 0);
}

#[tokio::test]
async fn test_begin_schedule_transitions() {
    let h = Harness::new();
    h.insert(&ExperimentBuilder::new(SPACE, 32).build()).await;
    let status = h.manager.begin_schedule(SPACE, 32).await.unwrap();
    assert_eq!(status, ExptStatus::Processing);
    let expt = h.experiment(32).await;
    assert_eq!(expt.status, ExptStatus::Processing);
    assert!(expt.start_at.is_some());

    // Still within its alive window.
    assert_eq!(
        h.manager.begin_schedule(SPACE, 32).await.unwrap(),
        ExptStatus::Processing
    );

    h.insert(
        &ExperimentBuilder::new(SPACE, 33)
            .status(ExptStatus::Processing)
            .start_at(Utc::now() - ChronoDuration::seconds(120))
            .max_alive_secs(60)
            .build(),
    )
    .await;
    assert_eq!(
        h.manager.begin_schedule(SPACE, 33).await.unwrap(),
        ExptStatus::Draining
    );

    // A Pending experiment already past its alive window drains right away.
    h.insert(
        &ExperimentBuilder::new(SPACE, 35)
            .start_at(Utc::now() - ChronoDuration::seconds(120))
            .max_alive_secs(60)
            .build(),
    )
    .await;
    assert_eq!(
        h.manager.begin_schedule(SPACE, 35).await.unwrap(),
        ExptStatus::Draining
    );
    assert_eq!(h.experiment(35).await.status, ExptStatus::Draining);

    h.insert(
        &ExperimentBuilder::new(SPACE, 34)
            .status(ExptStatus::Success)
            .build(),
    )
    .await;
    assert_eq!(
        h.manager.begin_schedule(SPACE, 34).await.unwrap(),
        ExptStatus::Success
    );
}

// ============================================================================
// RUN LOG
// ============================================================================

#[tokio::test]
async fn test_log_run_serializes_runs() {
    let h = Harness::new();
    h.insert(&ExperimentBuilder::new(SPACE, 40).build()).await;

    h.manager
        .log_run(SPACE, 40, 1, ExptRunMode::Submit, &h.session())
        .await
        .unwrap();
    assert_eq!(h.experiment(40).await.latest_run_id, 1);
    let log = h.manager.get_run_log(SPACE, 40, 1).await.unwrap();
    assert_eq!(log.status, ExptStatus::Pending);
    assert_eq!(log.created_by, TEST_USER);

    let second = h
        .manager
        .log_run(SPACE, 40, 2, ExptRunMode::FailRetry, &h.session())
        .await;
    assert_eq!(second, Err(ExptflowError::LeaseContention { expt_id: 40 }));

    h.manager
        .complete_run(SPACE, 40, 1, CompleteOptions::new())
        .await
        .unwrap();
    h.manager
        .log_run(SPACE, 40, 2, ExptRunMode::FailRetry, &h.session())
        .await
        .unwrap();
    assert_eq!(h.experiment(40).await.latest_run_id, 2);
}

#[tokio::test]
async fn test_log_run_releases_lease_when_run_log_fails() {
    let h = Harness::new();
    // Experiment row is missing, so the latest-run update fails.
    let result = h
        .manager
        .log_run(SPACE, 41, 1, ExptRunMode::Submit, &h.session())
        .await;
    assert_not_found(&result);
    assert!(!h.leases.is_held(&run_lease_key(41)));
}

#[tokio::test]
async fn test_set_expt_terminating() {
    let h = Harness::new();
    processing_expt(&h, 42).await;
    h.manager
        .log_run(SPACE, 42, RUN, ExptRunMode::Submit, &h.session())
        .await
        .unwrap();

    h.manager.set_expt_terminating(SPACE, 42, RUN).await.unwrap();
    assert_eq!(h.experiment(42).await.status, ExptStatus::Terminating);
    let log = h.manager.get_run_log(SPACE, 42, RUN).await.unwrap();
    assert_eq!(log.status, ExptStatus::Terminating);
}

// ============================================================================
// COMPLETE RUN
// ============================================================================

#[tokio::test]
async fn test_complete_run_counts_and_status() {
    let h = Harness::new();
    processing_expt(&h, 50).await;
    seed(&h, 50, &[RunState::Success, RunState::Success, RunState::Terminal]).await;
    h.manager
        .log_run(SPACE, 50, RUN, ExptRunMode::Submit, &h.session())
        .await
        .unwrap();

    h.manager
        .complete_run(SPACE, 50, RUN, CompleteOptions::new())
        .await
        .unwrap();

    let log = h.manager.get_run_log(SPACE, 50, RUN).await.unwrap();
    assert_eq!(log.status, ExptStatus::Success);
    assert_eq!(log.counts.success, 2);
    assert_eq!(log.counts.terminated, 1);
    assert!(!h.leases.is_held(&run_lease_key(50)));
}

#[tokio::test]
async fn test_complete_run_same_token_acts_once() {
    let h = Harness::new();
    processing_expt(&h, 51).await;
    seed(&h, 51, &[RunState::Success, RunState::Queueing]).await;
    h.manager
        .log_run(SPACE, 51, RUN, ExptRunMode::Submit, &h.session())
        .await
        .unwrap();

    let opts = CompleteOptions::new().with_token("evt-1");
    h.manager
        .complete_run(SPACE, 51, RUN, opts.clone())
        .await
        .unwrap();
    let log = h.manager.get_run_log(SPACE, 51, RUN).await.unwrap();
    assert_eq!(log.status, ExptStatus::Failed);
    assert_eq!(log.counts.pending, 1);

    h.storage
        .turn_result_set_status(SPACE, 51, 2, 0, RunState::Success)
        .await
        .unwrap();
    h.manager.complete_run(SPACE, 51, RUN, opts).await.unwrap();
    let log = h.manager.get_run_log(SPACE, 51, RUN).await.unwrap();
    assert_eq!(log.counts.success, 1, "duplicate token must not recount");

    // A fresh token recounts but a finished run log keeps its status.
    h.manager
        .complete_run(SPACE, 51, RUN, CompleteOptions::new().with_token("evt-2"))
        .await
        .unwrap();
    let log = h.manager.get_run_log(SPACE, 51, RUN).await.unwrap();
    assert_eq!(log.counts.success, 2);
    assert_eq!(log.status, ExptStatus::Failed);
}

#[tokio::test]
async fn test_complete_run_override_and_missing_log() {
    let h = Harness::new();
    processing_expt(&h, 52).await;
    seed(&h, 52, &[RunState::Fail]).await;
    h.manager
        .log_run(SPACE, 52, RUN, ExptRunMode::Submit, &h.session())
        .await
        .unwrap();

    h.manager
        .complete_run(
            SPACE,
            52,
            RUN,
            CompleteOptions::new()
                .with_status(ExptStatus::Terminated)
                .with_message("stopped by user"),
        )
        .await
        .unwrap();
    let log = h.manager.get_run_log(SPACE, 52, RUN).await.unwrap();
    assert_eq!(log.status, ExptStatus::Terminated);
    assert_eq!(log.status_message.as_deref(), Some("stopped by user"));

    let missing = h
        .manager
        .complete_run(SPACE, 52, RUN + 1, CompleteOptions::new())
        .await;
    assert_not_found(&missing);
}

#[tokio::test]
async fn test_run_stats_independent_of_page_size() {
    let states: Vec<RunState> = (0..23)
        .map(|i| RunState::ALL[i % RunState::ALL.len()])
        .collect();

    let mut results = Vec::new();
    for page_size in [1, 4, 10, 23, 100] {
        let h = Harness::with_config(ManagerConfig {
            stats_page_size: page_size,
            ..ManagerConfig::development()
        });
        processing_expt(&h, 53).await;
        seed(&h, 53, &states).await;
        h.manager
            .log_run(SPACE, 53, RUN, ExptRunMode::Submit, &h.session())
            .await
            .unwrap();
        h.manager.pend_run(SPACE, 53, RUN).await.unwrap();
        let log = h.manager.get_run_log(SPACE, 53, RUN).await.unwrap();
        assert_eq!(log.status, ExptStatus::Pending);
        results.push(log.counts);
    }

    assert_eq!(results[0].total(), 23);
    assert!(results.windows(2).all(|w| w[0] == w[1]), "{results:?}");
}

#[tokio::test]
async fn test_run_stats_page_ceiling_counts_rest_as_pending() {
    let h = Harness::with_config(ManagerConfig {
        stats_page_size: 5,
        stats_max_pages: 2,
        ..ManagerConfig::development()
    });
    processing_expt(&h, 54).await;
    seed(&h, 54, &[RunState::Success; 12]).await;
    h.manager
        .log_run(SPACE, 54, RUN, ExptRunMode::Submit, &h.session())
        .await
        .unwrap();

    h.manager.pend_run(SPACE, 54, RUN).await.unwrap();
    let log = h.manager.get_run_log(SPACE, 54, RUN).await.unwrap();
    assert_eq!(log.counts.success, 10);
    assert_eq!(log.counts.pending, 2);
}

// ============================================================================
// COMPLETE EXPERIMENT
// ============================================================================

#[tokio::test]
async fn test_complete_expt_success() {
    let h = Harness::new();
    processing_expt(&h, 60).await;
    seed(&h, 60, &[RunState::Success, RunState::Success]).await;

    h.manager
        .complete_expt(SPACE, 60, CompleteOptions::new())
        .await
        .unwrap();

    let expt = h.experiment(60).await;
    assert_eq!(expt.status, ExptStatus::Success);
    assert!(expt.end_at.is_some());
    assert_eq!(h.quota.released(), 1);
    assert_eq!(h.publisher.aggr_events().len(), 1);
    assert_eq!(h.notifier.titles(), vec!["Experiment succeeded".to_string()]);

    let stats = h.storage.stats_get(SPACE, 60).await.unwrap().unwrap();
    assert_eq!(stats.counts.success, 2);
    assert_eq!(stats.counts.pending, 0);
}

#[tokio::test]
async fn test_complete_expt_status_precedence() {
    let h = Harness::new();
    processing_expt(&h, 61).await;
    seed(&h, 61, &[RunState::Success, RunState::Fail]).await;
    h.manager
        .complete_expt(SPACE, 61, CompleteOptions::new().skip_aggr_calculate())
        .await
        .unwrap();
    assert_eq!(h.experiment(61).await.status, ExptStatus::Failed);
    assert!(h.publisher.aggr_events().is_empty());

    // A non-finished override does not win over the recount.
    processing_expt(&h, 62).await;
    seed(&h, 62, &[RunState::Success]).await;
    h.manager
        .complete_expt(
            SPACE,
            62,
            CompleteOptions::new().with_status(ExptStatus::Draining),
        )
        .await
        .unwrap();
    assert_eq!(h.experiment(62).await.status, ExptStatus::Success);
}

#[tokio::test]
async fn test_complete_expt_is_noop_when_finished_or_missing() {
    let h = Harness::new();
    h.insert(
        &ExperimentBuilder::new(SPACE, 63)
            .status(ExptStatus::Failed)
            .build(),
    )
    .await;

    h.manager
        .complete_expt(SPACE, 63, CompleteOptions::new().with_status(ExptStatus::Success))
        .await
        .unwrap();
    h.manager
        .complete_expt(SPACE, 404, CompleteOptions::new())
        .await
        .unwrap();

    assert_eq!(h.experiment(63).await.status, ExptStatus::Failed);
    assert_eq!(h.quota.released(), 0);
    assert!(h.notifier.cards().is_empty());
}

#[tokio::test]
async fn test_complete_expt_same_token_acts_once() {
    let h = Harness::new();
    processing_expt(&h, 64).await;
    seed(&h, 64, &[RunState::Success]).await;
    let opts = CompleteOptions::new().with_token("done-64");

    h.manager.complete_expt(SPACE, 64, opts.clone()).await.unwrap();
    // Reopen the row so only the token can stop the second call.
    h.storage
        .experiment_update(
            SPACE,
            64,
            &ExperimentPatch {
                status: Some(ExptStatus::Processing),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    h.manager.complete_expt(SPACE, 64, opts).await.unwrap();

    assert_eq!(h.quota.released(), 1);
    assert_eq!(h.experiment(64).await.status, ExptStatus::Processing);
}

#[tokio::test]
async fn test_complete_expt_tolerates_notify_failures() {
    let h = Harness::new();
    processing_expt(&h, 65).await;
    h.notifier.set_fail(true);
    h.manager
        .complete_expt(SPACE, 65, CompleteOptions::new())
        .await
        .unwrap();
    assert_eq!(h.experiment(65).await.status, ExptStatus::Success);

    // Unknown creator: nothing is sent.
    h.notifier.set_fail(false);
    h.insert(
        &ExperimentBuilder::new(SPACE, 66)
            .status(ExptStatus::Processing)
            .created_by("ghost")
            .build(),
    )
    .await;
    h.manager
        .complete_expt(SPACE, 66, CompleteOptions::new())
        .await
        .unwrap();
    assert!(h.notifier.cards().is_empty());
}

// ============================================================================
// KILL / TERMINATION CASCADE
// ============================================================================

#[tokio::test]
async fn test_kill_terminates_incomplete_rows() {
    let h = Harness::new();
    processing_expt(&h, 70).await;
    let mut states = vec![RunState::Success, RunState::Fail];
    states.extend(std::iter::repeat(RunState::Queueing).take(10));
    states.push(RunState::Processing);
    seed(&h, 70, &states).await;

    h.manager.kill(SPACE, 70, "killed by owner").await.unwrap();

    let expt = h.experiment(70).await;
    assert_eq!(expt.status, ExptStatus::Terminated);
    assert_eq!(expt.status_message.as_deref(), Some("killed by owner"));

    assert_eq!(
        h.storage.turn_get(SPACE, 70, 1, 0).await.unwrap().status,
        RunState::Success
    );
    assert_eq!(
        h.storage.item_get(SPACE, 70, 2).await.unwrap().status,
        RunState::Fail
    );
    for item_id in 3..=13 {
        assert_eq!(
            h.storage.turn_get(SPACE, 70, item_id, 0).await.unwrap().status,
            RunState::Terminal
        );
        assert_eq!(
            h.storage.item_get(SPACE, 70, item_id).await.unwrap().status,
            RunState::Terminal
        );
    }
    assert_eq!(h.results.filter_upserts(), (3..=13).collect::<Vec<i64>>());
    assert_eq!(h.notifier.titles(), vec!["Experiment terminated".to_string()]);
}

#[tokio::test]
async fn test_terminated_without_item_turn_completion() {
    let h = Harness::new();
    processing_expt(&h, 71).await;
    seed(&h, 71, &[RunState::Queueing, RunState::Queueing]).await;

    h.manager
        .complete_expt(
            SPACE,
            71,
            CompleteOptions::new()
                .with_status(ExptStatus::Terminated)
                .skip_item_turn_completion(),
        )
        .await
        .unwrap();

    assert_eq!(h.experiment(71).await.status, ExptStatus::Terminated);
    assert_eq!(
        h.storage.turn_get(SPACE, 71, 1, 0).await.unwrap().status,
        RunState::Queueing
    );
    assert!(h.results.filter_upserts().is_empty());
}

// ============================================================================
// FINISH / PEND
// ============================================================================

#[tokio::test]
async fn test_finish_drains_once() {
    let h = Harness::new();
    processing_expt(&h, 80).await;

    h.manager.finish(SPACE, 80, RUN, &h.session()).await.unwrap();
    h.manager.finish(SPACE, 80, RUN, &h.session()).await.unwrap();

    assert_eq!(h.experiment(80).await.status, ExptStatus::Draining);
    let events = h.publisher.schedule_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].expt_run_mode, ExptRunMode::Append);
}

#[tokio::test]
async fn test_finish_ignores_finished_experiment() {
    let h = Harness::new();
    h.insert(
        &ExperimentBuilder::new(SPACE, 81)
            .status(ExptStatus::Success)
            .build(),
    )
    .await;
    h.manager.finish(SPACE, 81, RUN, &h.session()).await.unwrap();
    assert_eq!(h.experiment(81).await.status, ExptStatus::Success);
    assert_eq!(h.publisher.schedule_count(), 0);
}

#[tokio::test]
async fn test_pend_expt_refreshes_stats() {
    let h = Harness::new();
    processing_expt(&h, 82).await;
    seed(&h, 82, &[RunState::Success, RunState::Fail, RunState::Queueing]).await;

    h.manager.pend_expt(SPACE, 82).await.unwrap();
    let stats = h.storage.stats_get(SPACE, 82).await.unwrap().unwrap();
    assert_eq!(stats.counts.success, 1);
    assert_eq!(stats.counts.fail, 1);
    assert_eq!(stats.counts.pending, 1);
    assert_eq!(h.experiment(82).await.status, ExptStatus::Processing);
}
