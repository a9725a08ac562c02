//! Two-phase evaluation of one turn: target call, then evaluator fan-out.
//!
//! Every external call site first checks for a successful record from an
//! earlier delivery and reuses it, so redelivered turns are cheap and never
//! double-billed.

use super::input::InputLayout;
use crate::field::{apply_field_adapters, source_field_name};
use crate::telemetry::ExptMetrics;
use exptflow_core::services::{
    BenefitKind, BenefitRequest, BenefitService, EvalSetItemService, EvalTargetService,
    EvaluatorCall, EvaluatorService, TargetCall,
};
use exptflow_core::{
    EvaluatorConf, EvaluatorRecord, Experiment, ExptflowError, ExptflowResult, FieldMap, ItemId,
    RecordStatus, RunId, Session, TargetRecord, TurnId, ValidationError, RUNTIME_PARAM_FIELD,
};
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

// ============================================================================
// TYPES
// ============================================================================

/// Records persisted by earlier deliveries of the same turn.
#[derive(Debug, Clone, Default)]
pub struct PriorResults {
    pub target: Option<TargetRecord>,
    /// Keyed by evaluator version id.
    pub evaluators: HashMap<i64, EvaluatorRecord>,
}

/// Everything needed to evaluate one turn.
#[derive(Debug, Clone)]
pub struct TurnEvalContext {
    pub experiment: Arc<Experiment>,
    pub run_id: RunId,
    pub item_id: ItemId,
    pub turn_id: TurnId,
    pub turn_fields: FieldMap,
    pub prior: PriorResults,
    pub session: Session,
}

/// Outcome of [`TurnPipeline::eval`].
///
/// `eval_err` carries configuration, quota and target-call failures. A
/// failing evaluator only marks its own record.
#[derive(Debug, Clone, Default)]
pub struct TurnEvalResult {
    pub target_result: Option<TargetRecord>,
    pub evaluator_results: HashMap<i64, EvaluatorRecord>,
    pub eval_err: Option<ExptflowError>,
}

/// External services the pipeline calls.
#[derive(Clone)]
pub struct PipelineServices {
    pub target: Arc<dyn EvalTargetService>,
    pub evaluator: Arc<dyn EvaluatorService>,
    pub benefit: Arc<dyn BenefitService>,
    /// Fetches eval-set fields stored truncated. Without it, truncated
    /// values are used as stored.
    pub eval_set_items: Option<Arc<dyn EvalSetItemService>>,
}

// ============================================================================
// PIPELINE
// ============================================================================

pub struct TurnPipeline {
    services: PipelineServices,
    metrics: ExptMetrics,
    default_evaluator_concurrency: usize,
}

/// Fan-out width: the experiment's setting, or the default when unset or
/// non-positive. Never below one.
pub fn evaluator_concurrency(configured: Option<i32>, default: usize) -> usize {
    match configured {
        Some(n) if n > 0 => n as usize,
        _ => default.max(1),
    }
}

impl TurnPipeline {
    pub fn new(
        services: PipelineServices,
        metrics: ExptMetrics,
        default_evaluator_concurrency: usize,
    ) -> Self {
        Self {
            services,
            metrics,
            default_evaluator_concurrency,
        }
    }

    /// Evaluate one turn.
    pub async fn eval(&self, ctx: &TurnEvalContext) -> TurnEvalResult {
        let expt = &ctx.experiment;
        let mut result = TurnEvalResult {
            evaluator_results: ctx.prior.evaluators.clone(),
            ..Default::default()
        };

        let turn_fields = match self.hydrate_turn_fields(ctx).await {
            Ok(fields) => fields,
            Err(e) => return self.finish(ctx, result.with_err(e)),
        };

        let target = match self.call_target(ctx, &turn_fields).await {
            Ok(target) => target,
            Err(e) => return self.finish(ctx, result.with_err(e)),
        };

        if target.status == RecordStatus::Fail {
            tracing::info!(
                expt_id = expt.id,
                item_id = ctx.item_id,
                turn_id = ctx.turn_id,
                error = target.error.as_deref().unwrap_or_default(),
                "Target failed, skipping evaluators"
            );
            result.target_result = Some(target);
            return self.finish(ctx, result);
        }

        match self.call_evaluators(ctx, &turn_fields, &target).await {
            Ok((records, quota_err)) => {
                result.evaluator_results.extend(records);
                result.eval_err = quota_err;
            }
            Err(e) => result.eval_err = Some(e),
        }
        result.target_result = Some(target);
        self.finish(ctx, result)
    }

    fn finish(&self, ctx: &TurnEvalContext, result: TurnEvalResult) -> TurnEvalResult {
        match &result.eval_err {
            Some(e) => {
                self.metrics.record_turn_eval("eval_err");
                tracing::warn!(
                    expt_id = ctx.experiment.id,
                    run_id = ctx.run_id,
                    item_id = ctx.item_id,
                    turn_id = ctx.turn_id,
                    error = %e,
                    "Turn evaluation failed"
                );
            }
            None => self.metrics.record_turn_eval("ok"),
        }
        result
    }

    /// Replace truncated eval-set values with their full content. Only
    /// fields read by a call that will actually run are fetched.
    async fn hydrate_turn_fields(&self, ctx: &TurnEvalContext) -> ExptflowResult<FieldMap> {
        let mut fields = ctx.turn_fields.clone();
        let Some(items) = &self.services.eval_set_items else {
            return Ok(fields);
        };
        let mapped = mapped_eval_set_fields(ctx)?;
        let omitted: Vec<String> = fields
            .iter()
            .filter(|(name, content)| content.omitted && mapped.contains(*name))
            .map(|(name, _)| name.clone())
            .collect();
        for name in omitted {
            let full = items
                .fetch_field(
                    ctx.experiment.space_id,
                    ctx.experiment.eval_set_id,
                    ctx.item_id,
                    ctx.turn_id,
                    &name,
                )
                .await?;
            if let Some(content) = full {
                fields.insert(name, content);
            }
        }
        Ok(fields)
    }

    /// Fails closed: a service error or an explicit deny stops the call.
    async fn check_benefit(&self, ctx: &TurnEvalContext, kind: BenefitKind) -> ExptflowResult<()> {
        let outcome = self
            .services
            .benefit
            .check_and_deduct(&BenefitRequest {
                space_id: ctx.experiment.space_id,
                expt_id: ctx.experiment.id,
                user_id: ctx.session.user_id.clone(),
                kind,
                is_free: ctx.experiment.credit_free,
            })
            .await?;
        match outcome.deny_reason {
            Some(reason) => Err(ExptflowError::BenefitDenied { reason }),
            None => Ok(()),
        }
    }

    // ========================================================================
    // TARGET PHASE
    // ========================================================================

    async fn call_target(
        &self,
        ctx: &TurnEvalContext,
        turn_fields: &FieldMap,
    ) -> ExptflowResult<TargetRecord> {
        let expt = &ctx.experiment;

        if expt.skips_target() {
            self.metrics.record_target_call("skipped");
            return Ok(TargetRecord::skipped(ctx.item_id, ctx.turn_id));
        }

        if let Some(prior) = &ctx.prior.target {
            if prior.status == RecordStatus::Success {
                self.metrics.record_target_call("reused");
                tracing::debug!(
                    expt_id = expt.id,
                    item_id = ctx.item_id,
                    turn_id = ctx.turn_id,
                    "Reusing successful target result"
                );
                return Ok(prior.clone());
            }
        }

        self.check_benefit(ctx, BenefitKind::TargetCall).await?;

        let target_conf = expt.target_conf().ok_or_else(|| ValidationError::RequiredFieldMissing {
            field: "target_conf".to_string(),
        })?;
        let input_fields = match &target_conf.ingress_conf {
            Some(ingress) => apply_field_adapters(&ingress.eval_set_adapter.field_confs, turn_fields)?,
            None => FieldMap::new(),
        };
        let mut ext = HashMap::new();
        if let Some(param) = target_conf.runtime_param() {
            ext.insert(RUNTIME_PARAM_FIELD.to_string(), param.to_string());
        }

        let call = TargetCall {
            space_id: expt.space_id,
            expt_id: expt.id,
            target_id: expt.target_id,
            target_version_id: expt.target_version_id,
            item_id: ctx.item_id,
            turn_id: ctx.turn_id,
            input_fields,
            ext,
        };
        match self.services.target.execute(&call).await {
            Ok(record) => {
                self.metrics.record_target_call(record.status.as_db_str());
                Ok(record)
            }
            Err(e) => {
                self.metrics.record_target_call("error");
                Err(e)
            }
        }
    }

    // ========================================================================
    // EVALUATOR PHASE
    // ========================================================================

    /// Run every evaluator that has no successful record yet.
    ///
    /// Returns the new records plus the first quota failure, if any. An
    /// `Err` means no evaluator ran because the mapping config is broken.
    async fn call_evaluators(
        &self,
        ctx: &TurnEvalContext,
        turn_fields: &FieldMap,
        target: &TargetRecord,
    ) -> ExptflowResult<(HashMap<i64, EvaluatorRecord>, Option<ExptflowError>)> {
        let expt = &ctx.experiment;
        let Some(evaluators_conf) = expt.evaluators_conf() else {
            return Ok((HashMap::new(), None));
        };

        let mut calls = Vec::new();
        for conf in &evaluators_conf.evaluator_conf {
            let done = ctx
                .prior
                .evaluators
                .get(&conf.evaluator_version_id)
                .is_some_and(|r| r.status == RecordStatus::Success);
            if done {
                self.metrics.record_evaluator_call("reused");
                continue;
            }
            calls.push(self.build_evaluator_call(ctx, conf, turn_fields, &target.output_fields)?);
        }
        if calls.is_empty() {
            return Ok((HashMap::new(), None));
        }

        let width = evaluator_concurrency(
            evaluators_conf.evaluator_concurrency,
            self.default_evaluator_concurrency,
        );
        let outcomes: Vec<(i64, ExptflowResult<EvaluatorRecord>)> = stream::iter(calls)
            .map(|call| async move {
                let version_id = call.evaluator_version_id;
                (version_id, self.run_evaluator(ctx, call).await)
            })
            .buffer_unordered(width)
            .collect()
            .await;

        let mut records = HashMap::new();
        let mut quota_err = None;
        for (version_id, outcome) in outcomes {
            match outcome {
                Ok(record) => {
                    records.insert(version_id, record);
                }
                Err(e) => {
                    tracing::warn!(
                        expt_id = expt.id,
                        evaluator_version_id = version_id,
                        error = %e,
                        "Evaluator call refused by benefit check"
                    );
                    quota_err.get_or_insert(e);
                }
            }
        }
        Ok((records, quota_err))
    }

    fn build_evaluator_call(
        &self,
        ctx: &TurnEvalContext,
        conf: &EvaluatorConf,
        turn_fields: &FieldMap,
        target_output: &FieldMap,
    ) -> ExptflowResult<EvaluatorCall> {
        let expt = &ctx.experiment;
        let evaluator = expt.evaluator(conf.evaluator_version_id).ok_or_else(|| {
            ValidationError::RequiredFieldMissing {
                field: format!("evaluator {}", conf.evaluator_version_id),
            }
        })?;
        let ingress = conf.ingress_conf.clone().unwrap_or_default();
        let input = InputLayout::for_kind(evaluator.kind).build(&ingress, turn_fields, target_output)?;

        let mut ext = HashMap::new();
        if let Some(param) = conf
            .run_conf
            .as_ref()
            .and_then(|rc| rc.runtime_param.as_ref())
            .filter(|p| !p.is_empty())
        {
            ext.insert(RUNTIME_PARAM_FIELD.to_string(), param.clone());
        }

        Ok(EvaluatorCall {
            space_id: expt.space_id,
            expt_id: expt.id,
            evaluator_version_id: conf.evaluator_version_id,
            item_id: ctx.item_id,
            turn_id: ctx.turn_id,
            input,
            ext,
        })
    }

    /// Benefit-gate and run one evaluator. Only a benefit failure is an `Err`;
    /// a failing evaluator becomes a `Fail` record.
    async fn run_evaluator(
        &self,
        ctx: &TurnEvalContext,
        call: EvaluatorCall,
    ) -> ExptflowResult<EvaluatorRecord> {
        let version_id = call.evaluator_version_id;
        self.check_benefit(
            ctx,
            BenefitKind::EvaluatorCall {
                evaluator_version_id: version_id,
            },
        )
        .await?;

        match self.services.evaluator.run(&call).await {
            Ok(record) => {
                self.metrics.record_evaluator_call(record.status.as_db_str());
                Ok(record)
            }
            Err(e) => {
                self.metrics.record_evaluator_call("error");
                tracing::warn!(
                    expt_id = ctx.experiment.id,
                    item_id = ctx.item_id,
                    turn_id = ctx.turn_id,
                    evaluator_version_id = version_id,
                    error = %e,
                    "Evaluator call failed"
                );
                Ok(EvaluatorRecord::failed(
                    version_id,
                    ctx.item_id,
                    ctx.turn_id,
                    e.to_string(),
                ))
            }
        }
    }
}

/// Eval-set columns read by the target call and by evaluators that still
/// have to run on this turn.
fn mapped_eval_set_fields(ctx: &TurnEvalContext) -> Result<HashSet<String>, ValidationError> {
    let expt = &ctx.experiment;
    let mut names = HashSet::new();

    let target_pending = !expt.skips_target()
        && !ctx
            .prior
            .target
            .as_ref()
            .is_some_and(|t| t.status == RecordStatus::Success);
    if target_pending {
        if let Some(ingress) = expt.target_conf().and_then(|c| c.ingress_conf.as_ref()) {
            for conf in &ingress.eval_set_adapter.field_confs {
                names.insert(source_field_name(&conf.from_field)?);
            }
        }
    }

    if let Some(evaluators_conf) = expt.evaluators_conf() {
        for conf in &evaluators_conf.evaluator_conf {
            let done = ctx
                .prior
                .evaluators
                .get(&conf.evaluator_version_id)
                .is_some_and(|r| r.status == RecordStatus::Success);
            let adapter = conf.ingress_conf.as_ref().and_then(|i| i.eval_set_adapter.as_ref());
            if let (false, Some(adapter)) = (done, adapter) {
                for field_conf in &adapter.field_confs {
                    names.insert(source_field_name(&field_conf.from_field)?);
                }
            }
        }
    }
    Ok(names)
}

impl TurnEvalResult {
    fn with_err(mut self, err: ExptflowError) -> Self {
        self.eval_err = Some(err);
        self
    }
}
