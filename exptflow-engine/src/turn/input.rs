//! Evaluator input layouts.
//!
//! Each evaluator kind maps to exactly one layout, and each layout owns its
//! way of combining turn fields with target output.

use crate::field::apply_field_adapters;
use exptflow_core::services::EvaluatorInput;
use exptflow_core::{EvaluatorIngressConf, EvaluatorKind, FieldMap, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputLayout {
    /// Every mapped field merged into one map.
    Flat,
    /// Mapped eval-set fields in one bucket, the whole target output in another.
    Split,
}

impl InputLayout {
    pub fn for_kind(kind: EvaluatorKind) -> Self {
        match kind {
            EvaluatorKind::Prompt => InputLayout::Flat,
            EvaluatorKind::Code => InputLayout::Split,
            EvaluatorKind::CustomRpc { has_input_schema } => {
                if has_input_schema {
                    InputLayout::Flat
                } else {
                    InputLayout::Split
                }
            }
        }
    }

    pub fn build(
        &self,
        ingress: &EvaluatorIngressConf,
        turn_fields: &FieldMap,
        target_output: &FieldMap,
    ) -> Result<EvaluatorInput, ValidationError> {
        let dataset_fields = match &ingress.eval_set_adapter {
            Some(adapter) => apply_field_adapters(&adapter.field_confs, turn_fields)?,
            None => FieldMap::new(),
        };

        match self {
            InputLayout::Split => Ok(EvaluatorInput::Split {
                dataset_fields,
                target_output_fields: target_output.clone(),
            }),
            InputLayout::Flat => {
                let mut input_fields = dataset_fields;
                if let Some(adapter) = &ingress.target_adapter {
                    input_fields.extend(apply_field_adapters(&adapter.field_confs, target_output)?);
                }
                Ok(EvaluatorInput::Flat { input_fields })
            }
        }
    }
}
