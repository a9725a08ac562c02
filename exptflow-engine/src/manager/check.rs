//! Pre-run validation.
//!
//! `check_run` builds a chain of [`RunCheck`]s for the experiment and runs
//! them in order. The first failure short-circuits.

use super::ExptManager;
use crate::field::source_field_name;
use exptflow_core::services::{AuditOutcome, BenefitKind, BenefitRequest};
use exptflow_core::{
    Experiment, ExperimentPatch, ExptId, ExptType, ExptflowError, ExptflowResult, FieldConf,
    FieldSchema, FieldSource, Session, SpaceId, ValidationError,
};

/// One link of the pre-run validator chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunCheck {
    /// Eval config presence, item concurrency and content audit.
    Basic,
    /// Eval set reference. Offline runs also need a non-empty version.
    EvalSet,
    /// Field mappings against the eval-set and target schemas.
    Connector,
    /// Entitlement for the run. Persists a free grant.
    Benefit,
}

impl RunCheck {
    /// Checks that apply to `expt`, in execution order.
    pub fn chain_for(expt: &Experiment) -> Vec<RunCheck> {
        let mut chain = vec![RunCheck::Basic, RunCheck::EvalSet, RunCheck::Connector];
        if expt.expt_type != ExptType::Online && !expt.credit_free {
            chain.push(RunCheck::Benefit);
        }
        chain
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunCheck::Basic => "basic",
            RunCheck::EvalSet => "eval_set",
            RunCheck::Connector => "connector",
            RunCheck::Benefit => "benefit",
        }
    }
}

impl ExptManager {
    /// Validate that an experiment can be run.
    pub async fn check_run(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        session: &Session,
    ) -> ExptflowResult<()> {
        let expt = self.load_experiment(space_id, expt_id).await?;
        for check in RunCheck::chain_for(&expt) {
            if let Err(e) = self.apply_check(check, &expt, session).await {
                tracing::info!(
                    space_id = space_id,
                    expt_id = expt_id,
                    check = check.as_str(),
                    error = %e,
                    "Run check failed"
                );
                return Err(e);
            }
        }
        Ok(())
    }

    async fn apply_check(
        &self,
        check: RunCheck,
        expt: &Experiment,
        session: &Session,
    ) -> ExptflowResult<()> {
        match check {
            RunCheck::Basic => self.check_basic(expt).await,
            RunCheck::EvalSet => check_eval_set(expt).map_err(Into::into),
            RunCheck::Connector => self.check_connector(expt).await,
            RunCheck::Benefit => self.check_run_benefit(expt, session).await,
        }
    }

    async fn check_basic(&self, expt: &Experiment) -> ExptflowResult<()> {
        let eval_conf = expt
            .eval_conf
            .as_ref()
            .ok_or_else(|| ValidationError::RequiredFieldMissing {
                field: "eval_conf".to_string(),
            })?;
        if let Some(requested) = eval_conf.item_concurrency {
            if requested > self.config.max_item_concurrency {
                return Err(ValidationError::ItemConcurrencyExceeded {
                    requested,
                    limit: self.config.max_item_concurrency,
                }
                .into());
            }
        }

        let texts: Vec<String> = [&expt.name, &expt.description]
            .into_iter()
            .filter(|t| !t.is_empty())
            .cloned()
            .collect();
        match self.deps.audit.audit_texts(expt.space_id, &texts).await {
            Ok(AuditOutcome::Approved) => Ok(()),
            Ok(AuditOutcome::Rejected { reason }) => Err(ValidationError::AuditRejected { reason }.into()),
            Err(e) => {
                tracing::warn!(
                    space_id = expt.space_id,
                    expt_id = expt.id,
                    error = %e,
                    "Audit unavailable, passing experiment"
                );
                Ok(())
            }
        }
    }

    async fn check_connector(&self, expt: &Experiment) -> ExptflowResult<()> {
        let eval_set_schema = expt
            .eval_set
            .as_ref()
            .and_then(|s| s.version.as_ref())
            .map(|v| v.field_schemas.as_slice());
        let offline = expt.expt_type == ExptType::Offline;

        if offline && !expt.skips_target() {
            let target_conf = expt.target_conf().ok_or_else(|| ValidationError::RequiredFieldMissing {
                field: "target_conf".to_string(),
            })?;
            if target_conf.target_version_id != expt.target_version_id {
                return Err(ValidationError::TargetVersionMismatch {
                    expected: expt.target_version_id,
                    actual: target_conf.target_version_id,
                }
                .into());
            }
            if let Some(ingress) = &target_conf.ingress_conf {
                if let Some(schema) = eval_set_schema {
                    check_mapped_fields(
                        "target",
                        &ingress.eval_set_adapter.field_confs,
                        schema,
                        FieldSource::EvalSet.as_db_str(),
                    )?;
                }
            }
            if let Some(param) = target_conf.runtime_param() {
                self.deps
                    .target
                    .validate_runtime_param(expt.target_version_id, param)
                    .await
                    .map_err(|e| ValidationError::InvalidRuntimeParam {
                        reason: e.to_string(),
                    })?;
            }
        }

        let Some(evaluators_conf) = expt.evaluators_conf() else {
            return Ok(());
        };
        let target_schema = expt
            .target
            .as_ref()
            .and_then(|t| t.version.as_ref())
            .map(|v| v.output_schemas.as_slice());

        for conf in &evaluators_conf.evaluator_conf {
            if expt.evaluator(conf.evaluator_version_id).is_none() {
                return Err(ValidationError::InvalidValue {
                    field: "evaluator_version_id".to_string(),
                    reason: format!(
                        "evaluator version {} is not attached to the experiment",
                        conf.evaluator_version_id
                    ),
                }
                .into());
            }
            let Some(ingress) = &conf.ingress_conf else {
                continue;
            };
            let owner = format!("evaluator {}", conf.evaluator_version_id);
            for (source, field_conf) in ingress.sourced_confs() {
                let schema = match source {
                    FieldSource::EvalSet => eval_set_schema,
                    FieldSource::Target if offline => target_schema,
                    FieldSource::Target => None,
                };
                if let Some(schema) = schema {
                    check_mapped_fields(
                        &owner,
                        std::slice::from_ref(field_conf),
                        schema,
                        source.as_db_str(),
                    )?;
                }
            }
        }
        Ok(())
    }

    async fn check_run_benefit(&self, expt: &Experiment, session: &Session) -> ExptflowResult<()> {
        let outcome = self
            .deps
            .benefit
            .check_and_deduct(&BenefitRequest {
                space_id: expt.space_id,
                expt_id: expt.id,
                user_id: session.user_id.clone(),
                kind: BenefitKind::ExptRun,
                is_free: expt.credit_free,
            })
            .await?;
        if let Some(reason) = outcome.deny_reason {
            return Err(ExptflowError::BenefitDenied { reason });
        }
        if outcome.is_free {
            self.deps
                .storage
                .experiment_update(
                    expt.space_id,
                    expt.id,
                    &ExperimentPatch {
                        credit_free: Some(true),
                        ..Default::default()
                    },
                )
                .await?;
            tracing::info!(
                space_id = expt.space_id,
                expt_id = expt.id,
                "Experiment granted free run"
            );
        }
        Ok(())
    }
}

fn check_eval_set(expt: &Experiment) -> Result<(), ValidationError> {
    let eval_set = expt
        .eval_set
        .as_ref()
        .ok_or_else(|| ValidationError::RequiredFieldMissing {
            field: "eval_set".to_string(),
        })?;
    if expt.expt_type == ExptType::Online {
        return Ok(());
    }
    let version = eval_set
        .version
        .as_ref()
        .ok_or_else(|| ValidationError::RequiredFieldMissing {
            field: "eval_set_version".to_string(),
        })?;
    if version.item_count == 0 {
        return Err(ValidationError::EmptyEvalSetVersion {
            version_id: version.id,
        });
    }
    Ok(())
}

/// Every rule must read a field the schema declares.
fn check_mapped_fields(
    owner: &str,
    confs: &[FieldConf],
    schema: &[FieldSchema],
    schema_name: &'static str,
) -> Result<(), ValidationError> {
    for conf in confs {
        let field = source_field_name(&conf.from_field)?;
        if !schema.iter().any(|s| s.name == field) {
            return Err(ValidationError::UnknownSchemaField {
                owner: owner.to_string(),
                field,
                schema: schema_name,
            });
        }
    }
    Ok(())
}
