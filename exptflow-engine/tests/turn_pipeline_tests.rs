//! Per-turn pipeline tests: target phase, evaluator fan-out, reuse and
//! failure isolation.

use exptflow_core::services::{BenefitKind, EvaluatorInput};
use exptflow_core::{
    Content, DenyReason, EvaluatorRecord, Experiment, ExptflowError, RecordStatus, Session,
    TargetRecord, RUNTIME_PARAM_FIELD,
};
use exptflow_engine::turn::PriorResults;
use exptflow_engine::{ExptMetrics, PipelineServices, TurnEvalContext, TurnPipeline};
use exptflow_test_utils::fixtures::{
    code_evaluator, default_evaluator_ingress, prompt_evaluator, turn_fields, ExperimentBuilder,
    TEST_USER,
};
use exptflow_test_utils::{MockEvalSetItems, MockEvaluatorService, MockTargetService, ScriptedBenefit};
use prometheus::Registry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct Rig {
    target: Arc<MockTargetService>,
    evaluator: Arc<MockEvaluatorService>,
    benefit: Arc<ScriptedBenefit>,
    items: Arc<MockEvalSetItems>,
    pipeline: TurnPipeline,
}

impl Rig {
    fn new() -> Self {
        let target = Arc::new(MockTargetService::new());
        let evaluator = Arc::new(MockEvaluatorService::new());
        let benefit = Arc::new(ScriptedBenefit::new());
        let items = Arc::new(MockEvalSetItems::new());
        let metrics = ExptMetrics::new(&Registry::new()).expect("metrics register");
        let pipeline = TurnPipeline::new(
            PipelineServices {
                target: target.clone(),
                evaluator: evaluator.clone(),
                benefit: benefit.clone(),
                eval_set_items: Some(items.clone()),
            },
            metrics,
            3,
        );
        Self {
            target,
            evaluator,
            benefit,
            items,
            pipeline,
        }
    }
}

fn ctx(expt: Experiment) -> TurnEvalContext {
    TurnEvalContext {
        experiment: Arc::new(expt),
        run_id: 9,
        item_id: 1,
        turn_id: 0,
        turn_fields: turn_fields(&[("question", "2+2?"), ("reference", "4")]),
        prior: PriorResults::default(),
        session: Session::new(TEST_USER),
    }
}

fn offline() -> ExperimentBuilder {
    ExperimentBuilder::new(1, 100)
}

// ============================================================================
// TARGET PHASE
// ============================================================================

#[tokio::test]
async fn test_offline_turn_calls_target_then_evaluator() {
    let rig = Rig::new();
    let result = rig.pipeline.eval(&ctx(offline().build())).await;

    assert!(result.eval_err.is_none(), "{:?}", result.eval_err);
    let target = result.target_result.expect("target record");
    assert_eq!(target.status, RecordStatus::Success);

    let calls = rig.target.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].input_fields.get("input"), Some(&Content::text("2+2?")));

    assert_eq!(result.evaluator_results.len(), 1);
    assert_eq!(result.evaluator_results[&901].status, RecordStatus::Success);
}

#[tokio::test]
async fn test_online_turn_skips_target() {
    let rig = Rig::new();
    let result = rig.pipeline.eval(&ctx(offline().online().build())).await;

    assert!(result.eval_err.is_none());
    assert_eq!(rig.target.call_count(), 0);
    let target = result.target_result.expect("skipped target record");
    assert_eq!(target.status, RecordStatus::Success);
    assert!(target.output_fields.is_empty());
    assert_eq!(rig.evaluator.call_count(), 1);
    // Only the evaluator call is paid for.
    assert_eq!(rig.benefit.request_count(|k| *k == BenefitKind::TargetCall), 0);
}

#[tokio::test]
async fn test_target_without_version_is_skipped() {
    let rig = Rig::new();
    let result = rig.pipeline.eval(&ctx(offline().without_target().build())).await;
    assert!(result.eval_err.is_none());
    assert_eq!(rig.target.call_count(), 0);
}

#[tokio::test]
async fn test_runtime_param_reaches_target_call() {
    let rig = Rig::new();
    let expt = offline().target_runtime_param(r#"{"model":"m1"}"#).build();
    rig.pipeline.eval(&ctx(expt)).await;

    let calls = rig.target.calls();
    assert_eq!(
        calls[0].ext.get(RUNTIME_PARAM_FIELD).map(String::as_str),
        Some(r#"{"model":"m1"}"#)
    );
}

#[tokio::test]
async fn test_truncated_fields_are_fetched_in_full() {
    let rig = Rig::new();
    rig.items.insert(1, 0, "question", Content::text("what is 2+2, in full?"));
    let mut turn = ctx(offline().build());
    if let Some(question) = turn.turn_fields.get_mut("question") {
        question.omitted = true;
        question.text = Some("what is".to_string());
    }

    rig.pipeline.eval(&turn).await;

    assert_eq!(rig.items.fetch_count(), 1);
    assert_eq!(
        rig.target.calls()[0].input_fields.get("input"),
        Some(&Content::text("what is 2+2, in full?"))
    );
}

#[tokio::test]
async fn test_only_mapped_truncated_fields_are_fetched() {
    let rig = Rig::new();
    let mut turn = ctx(offline().online().build());
    turn.turn_fields.insert(
        "notes".to_string(),
        Content {
            omitted: true,
            ..Content::text("unmapped")
        },
    );
    if let Some(question) = turn.turn_fields.get_mut("question") {
        question.omitted = true;
    }

    let result = rig.pipeline.eval(&turn).await;

    assert!(result.eval_err.is_none(), "{:?}", result.eval_err);
    // The target is skipped, so only the evaluator's question column is read.
    assert_eq!(rig.items.fetch_count(), 1);
}

#[tokio::test]
async fn test_target_service_error_aborts_turn() {
    let rig = Rig::new();
    rig.target.set_fail(true);
    let result = rig.pipeline.eval(&ctx(offline().build())).await;

    assert!(matches!(result.eval_err, Some(ExptflowError::External(_))));
    assert!(result.target_result.is_none());
    assert_eq!(rig.evaluator.call_count(), 0);
}

#[tokio::test]
async fn test_failed_target_record_skips_evaluators() {
    let rig = Rig::new();
    rig.target.set_status(RecordStatus::Fail);
    let result = rig.pipeline.eval(&ctx(offline().build())).await;

    assert!(result.eval_err.is_none());
    assert_eq!(result.target_result.map(|t| t.status), Some(RecordStatus::Fail));
    assert!(result.evaluator_results.is_empty());
    assert_eq!(rig.evaluator.call_count(), 0);
}

#[tokio::test]
async fn test_target_benefit_denied() {
    let rig = Rig::new();
    rig.benefit.deny_target(DenyReason::AccountOverdue);
    let result = rig.pipeline.eval(&ctx(offline().build())).await;

    assert_eq!(
        result.eval_err,
        Some(ExptflowError::BenefitDenied {
            reason: DenyReason::AccountOverdue
        })
    );
    assert_eq!(rig.target.call_count(), 0);
}

#[tokio::test]
async fn test_credit_free_turn_is_still_benefit_checked() {
    let rig = Rig::new();
    let result = rig.pipeline.eval(&ctx(offline().credit_free().build())).await;

    assert!(result.eval_err.is_none(), "{:?}", result.eval_err);
    let requests = rig.benefit.requests();
    assert_eq!(requests.len(), 2);
    assert!(requests.iter().all(|r| r.is_free));
    assert_eq!(rig.target.call_count(), 1);
}

#[tokio::test]
async fn test_credit_free_turn_honours_explicit_deny() {
    let rig = Rig::new();
    rig.benefit.deny_target(DenyReason::InsufficientBalance);
    let result = rig.pipeline.eval(&ctx(offline().credit_free().build())).await;

    assert_eq!(
        result.eval_err,
        Some(ExptflowError::BenefitDenied {
            reason: DenyReason::InsufficientBalance
        })
    );
    assert_eq!(rig.benefit.request_count(|k| *k == BenefitKind::TargetCall), 1);
    assert_eq!(rig.target.call_count(), 0);
    assert_eq!(rig.evaluator.call_count(), 0);
}

// ============================================================================
// REUSE
// ============================================================================

#[tokio::test]
async fn test_successful_prior_records_are_reused() {
    let rig = Rig::new();
    let mut turn = ctx(offline().build());
    turn.prior.target = Some(TargetRecord {
        id: 55,
        status: RecordStatus::Success,
        output_fields: HashMap::from([("output".to_string(), Content::text(r#"{"answer":"5"}"#))]),
        ..Default::default()
    });
    turn.prior.evaluators.insert(
        901,
        EvaluatorRecord {
            id: 66,
            evaluator_version_id: 901,
            status: RecordStatus::Success,
            score: Some(0.5),
            ..Default::default()
        },
    );

    let result = rig.pipeline.eval(&turn).await;

    assert!(result.eval_err.is_none());
    assert_eq!(rig.target.call_count(), 0);
    assert_eq!(rig.evaluator.call_count(), 0);
    assert!(rig.benefit.requests().is_empty());
    assert_eq!(result.target_result.map(|t| t.id), Some(55));
    assert_eq!(result.evaluator_results[&901].id, 66);
}

#[tokio::test]
async fn test_failed_prior_records_are_retried() {
    let rig = Rig::new();
    let mut turn = ctx(offline().build());
    turn.prior.target = Some(TargetRecord {
        id: 55,
        status: RecordStatus::Fail,
        ..Default::default()
    });
    turn.prior.evaluators.insert(
        901,
        EvaluatorRecord::failed(901, 1, 0, "timeout".to_string()),
    );

    let result = rig.pipeline.eval(&turn).await;

    assert_eq!(rig.target.call_count(), 1);
    assert_eq!(rig.evaluator.call_count(), 1);
    assert_eq!(result.evaluator_results[&901].status, RecordStatus::Success);
}

// ============================================================================
// EVALUATOR PHASE
// ============================================================================

#[tokio::test]
async fn test_prompt_evaluator_gets_flat_input() {
    let rig = Rig::new();
    rig.pipeline.eval(&ctx(offline().build())).await;

    let calls = rig.evaluator.calls();
    let call = &calls[0];
    let EvaluatorInput::Flat { input_fields } = &call.input else {
        panic!("expected flat input, got {:?}", call.input);
    };
    assert_eq!(input_fields.get("input"), Some(&Content::text("2+2?")));
    assert_eq!(input_fields.get("reference"), Some(&Content::text("4")));
    assert_eq!(input_fields.get("actual"), Some(&Content::text("4")));
}

#[tokio::test]
async fn test_code_evaluator_gets_split_input() {
    let rig = Rig::new();
    let expt = offline()
        .evaluators(vec![(code_evaluator(902), default_evaluator_ingress())])
        .build();
    rig.pipeline.eval(&ctx(expt)).await;

    let calls = rig.evaluator.calls();
    let call = &calls[0];
    let EvaluatorInput::Split {
        dataset_fields,
        target_output_fields,
    } = &call.input
    else {
        panic!("expected split input, got {:?}", call.input);
    };
    assert_eq!(dataset_fields.len(), 2);
    assert!(!dataset_fields.contains_key("actual"));
    assert!(target_output_fields.contains_key("output"));
}

#[tokio::test]
async fn test_evaluator_failure_is_isolated() {
    let rig = Rig::new();
    rig.evaluator.fail_version(902);
    let expt = offline()
        .evaluators(vec![
            (prompt_evaluator(901), default_evaluator_ingress()),
            (prompt_evaluator(902), default_evaluator_ingress()),
            (prompt_evaluator(903), default_evaluator_ingress()),
        ])
        .build();

    let result = rig.pipeline.eval(&ctx(expt)).await;

    assert!(result.eval_err.is_none());
    assert_eq!(result.evaluator_results.len(), 3);
    assert_eq!(result.evaluator_results[&901].status, RecordStatus::Success);
    assert_eq!(result.evaluator_results[&902].status, RecordStatus::Fail);
    assert!(result.evaluator_results[&902].error.is_some());
    assert_eq!(result.evaluator_results[&903].status, RecordStatus::Success);
}

#[tokio::test]
async fn test_evaluator_benefit_denial_reported() {
    let rig = Rig::new();
    rig.benefit.deny_evaluator(902, DenyReason::QuotaExhausted);
    let expt = offline()
        .evaluators(vec![
            (prompt_evaluator(901), default_evaluator_ingress()),
            (prompt_evaluator(902), default_evaluator_ingress()),
        ])
        .build();

    let result = rig.pipeline.eval(&ctx(expt)).await;

    assert_eq!(
        result.eval_err,
        Some(ExptflowError::BenefitDenied {
            reason: DenyReason::QuotaExhausted
        })
    );
    assert!(result.evaluator_results.contains_key(&901));
    assert!(!result.evaluator_results.contains_key(&902));
    assert_eq!(rig.evaluator.call_count(), 1);
}

#[tokio::test]
async fn test_evaluator_fan_out_is_bounded() {
    let rig = Rig::new();
    rig.evaluator.set_delay(Duration::from_millis(20));
    let evaluators = (1..=6)
        .map(|v| (prompt_evaluator(900 + v), default_evaluator_ingress()))
        .collect();
    let expt = offline()
        .evaluators(evaluators)
        .evaluator_concurrency(2)
        .build();

    let result = rig.pipeline.eval(&ctx(expt)).await;

    assert_eq!(result.evaluator_results.len(), 6);
    assert_eq!(rig.evaluator.call_count(), 6);
    assert_eq!(rig.evaluator.max_in_flight(), 2);
}

#[tokio::test]
async fn test_unknown_evaluator_is_config_error() {
    let rig = Rig::new();
    let mut expt = offline().build();
    expt.evaluators.clear();

    let result = rig.pipeline.eval(&ctx(expt)).await;

    assert!(matches!(result.eval_err, Some(ExptflowError::Validation(_))));
    assert_eq!(rig.evaluator.call_count(), 0);
    assert!(result.target_result.is_some());
}
