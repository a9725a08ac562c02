//! Experiment, run and result entities.

use crate::{EvaluatorKind, ExptRunMode, ExptStatus, ExptType, FieldSource, RecordStatus, RunState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ============================================================================
// IDENTITY TYPES
// ============================================================================

pub type SpaceId = i64;
pub type ExptId = i64;
pub type RunId = i64;
pub type ItemId = i64;
pub type TurnId = i64;
pub type Timestamp = DateTime<Utc>;

/// Named field values keyed by field name.
pub type FieldMap = HashMap<String, Content>;

/// Ext key carrying a runtime parameter blob into target and evaluator calls.
pub const RUNTIME_PARAM_FIELD: &str = "builtin_runtime_param";

// ============================================================================
// CONTENT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ContentType {
    #[default]
    Text,
    Image,
    Audio,
    MultiPart,
}

/// A field value. Only text content participates in JSON-path extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Content {
    pub content_type: ContentType,
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<Content>,
    /// The stored value was truncated; the full value must be fetched.
    #[serde(default)]
    pub omitted: bool,
}

impl Content {
    pub fn text(value: impl Into<String>) -> Self {
        Self {
            content_type: ContentType::Text,
            text: Some(value.into()),
            parts: Vec::new(),
            omitted: false,
        }
    }

    pub fn empty_text() -> Self {
        Self::text("")
    }

    pub fn is_text(&self) -> bool {
        self.content_type == ContentType::Text
    }

    pub fn as_text(&self) -> Option<&str> {
        self.text.as_deref()
    }
}

// ============================================================================
// FIELD ADAPTERS & CONNECTOR CONFIG
// ============================================================================

/// One mapping rule: write `from_field` (optionally `a.b[0]` path) into `field_name`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FieldConf {
    pub field_name: String,
    pub from_field: String,
    /// Literal value, used by custom-config adapters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl FieldConf {
    pub fn new(field_name: impl Into<String>, from_field: impl Into<String>) -> Self {
        Self {
            field_name: field_name.into(),
            from_field: from_field.into(),
            value: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FieldAdapter {
    pub field_confs: Vec<FieldConf>,
}

impl FieldAdapter {
    pub fn new(field_confs: Vec<FieldConf>) -> Self {
        Self { field_confs }
    }

    /// Literal value of a named conf, if present.
    pub fn value_of(&self, field_name: &str) -> Option<&str> {
        self.field_confs
            .iter()
            .find(|fc| fc.field_name == field_name)
            .and_then(|fc| fc.value.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TargetIngressConf {
    pub eval_set_adapter: FieldAdapter,
    /// Carries the runtime parameter under [`RUNTIME_PARAM_FIELD`].
    #[serde(default)]
    pub custom_conf: Option<FieldAdapter>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TargetConf {
    pub target_version_id: i64,
    #[serde(default)]
    pub ingress_conf: Option<TargetIngressConf>,
}

impl TargetConf {
    pub fn runtime_param(&self) -> Option<&str> {
        self.ingress_conf
            .as_ref()
            .and_then(|ic| ic.custom_conf.as_ref())
            .and_then(|cc| cc.value_of(RUNTIME_PARAM_FIELD))
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EvaluatorIngressConf {
    #[serde(default)]
    pub eval_set_adapter: Option<FieldAdapter>,
    #[serde(default)]
    pub target_adapter: Option<FieldAdapter>,
}

impl EvaluatorIngressConf {
    /// All mapping rules tagged with their source.
    pub fn sourced_confs(&self) -> impl Iterator<Item = (FieldSource, &FieldConf)> {
        let eval_set = self
            .eval_set_adapter
            .iter()
            .flat_map(|a| a.field_confs.iter().map(|fc| (FieldSource::EvalSet, fc)));
        let target = self
            .target_adapter
            .iter()
            .flat_map(|a| a.field_confs.iter().map(|fc| (FieldSource::Target, fc)));
        eval_set.chain(target)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EvaluatorRunConf {
    #[serde(default)]
    pub runtime_param: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EvaluatorConf {
    pub evaluator_version_id: i64,
    #[serde(default)]
    pub ingress_conf: Option<EvaluatorIngressConf>,
    #[serde(default)]
    pub run_conf: Option<EvaluatorRunConf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EvaluatorsConf {
    #[serde(default)]
    pub evaluator_concurrency: Option<i32>,
    pub evaluator_conf: Vec<EvaluatorConf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ConnectorConf {
    #[serde(default)]
    pub target_conf: Option<TargetConf>,
    #[serde(default)]
    pub evaluators_conf: Option<EvaluatorsConf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EvalConf {
    pub connector: ConnectorConf,
    #[serde(default)]
    pub item_concurrency: Option<i32>,
}

// ============================================================================
// EVAL SET / TARGET / EVALUATOR DESCRIPTORS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FieldSchema {
    pub name: String,
    #[serde(default)]
    pub content_type: ContentType,
}

impl FieldSchema {
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content_type: ContentType::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EvalSetVersion {
    pub id: i64,
    pub item_count: i64,
    pub field_schemas: Vec<FieldSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EvalSet {
    pub id: i64,
    pub name: String,
    pub version: Option<EvalSetVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EvalTargetVersion {
    pub id: i64,
    pub output_schemas: Vec<FieldSchema>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct EvalTarget {
    pub id: i64,
    pub version: Option<EvalTargetVersion>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Evaluator {
    pub version_id: i64,
    pub name: String,
    pub kind: EvaluatorKind,
}

// ============================================================================
// EXPERIMENT
// ============================================================================

/// An experiment with its hydrated eval set, target and evaluators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Experiment {
    pub id: ExptId,
    pub space_id: SpaceId,
    pub name: String,
    pub description: String,
    pub created_by: String,
    pub expt_type: ExptType,
    pub status: ExptStatus,
    #[serde(default)]
    pub status_message: Option<String>,

    pub eval_set_id: i64,
    pub eval_set_version_id: i64,
    pub target_id: i64,
    pub target_version_id: i64,
    pub evaluator_version_ids: Vec<i64>,
    #[serde(default)]
    pub eval_conf: Option<EvalConf>,

    #[serde(default)]
    pub eval_set: Option<EvalSet>,
    #[serde(default)]
    pub target: Option<EvalTarget>,
    #[serde(default)]
    pub evaluators: Vec<Evaluator>,

    /// Persisted once the benefit check grants a free run.
    pub credit_free: bool,
    pub latest_run_id: RunId,
    /// Processing longer than this sends the experiment into Draining.
    #[serde(default)]
    pub max_alive_secs: Option<i64>,
    #[serde(default)]
    pub start_at: Option<Timestamp>,
    #[serde(default)]
    pub end_at: Option<Timestamp>,
}

impl Experiment {
    pub fn connector(&self) -> Option<&ConnectorConf> {
        self.eval_conf.as_ref().map(|c| &c.connector)
    }

    pub fn target_conf(&self) -> Option<&TargetConf> {
        self.connector().and_then(|c| c.target_conf.as_ref())
    }

    pub fn evaluators_conf(&self) -> Option<&EvaluatorsConf> {
        self.connector().and_then(|c| c.evaluators_conf.as_ref())
    }

    pub fn evaluator(&self, version_id: i64) -> Option<&Evaluator> {
        self.evaluators.iter().find(|e| e.version_id == version_id)
    }

    /// Whether per-turn target calls are skipped for this experiment.
    pub fn skips_target(&self) -> bool {
        self.expt_type == ExptType::Online || self.target_version_id == 0
    }
}

/// Partial update applied by the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExperimentPatch {
    pub status: Option<ExptStatus>,
    pub status_message: Option<String>,
    pub latest_run_id: Option<RunId>,
    pub credit_free: Option<bool>,
    pub start_at: Option<Timestamp>,
    pub end_at: Option<Timestamp>,
}

// ============================================================================
// STATS & RUN LOG
// ============================================================================

/// Item status counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub success: i64,
    pub fail: i64,
    pub terminated: i64,
}

impl StatusCounts {
    pub fn record(&mut self, state: RunState) {
        match state {
            RunState::Queueing => self.pending += 1,
            RunState::Processing => self.processing += 1,
            RunState::Success => self.success += 1,
            RunState::Fail => self.fail += 1,
            RunState::Terminal => self.terminated += 1,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.success + self.fail + self.terminated
    }

    /// Any unsuccessful or unfinished row.
    pub fn has_unsuccessful(&self) -> bool {
        self.pending > 0 || self.processing > 0 || self.fail > 0 || self.terminated > 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExptStats {
    pub expt_id: ExptId,
    pub space_id: SpaceId,
    pub counts: StatusCounts,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

/// Arithmetic adjustment applied to the stats row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsDelta {
    pub pending: i64,
    pub processing: i64,
    pub success: i64,
    pub fail: i64,
    pub terminated: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RunLog {
    pub id: RunId,
    pub expt_id: ExptId,
    pub space_id: SpaceId,
    pub mode: ExptRunMode,
    pub status: ExptStatus,
    pub counts: StatusCounts,
    pub created_by: String,
    #[serde(default)]
    pub status_message: Option<String>,
    pub created_at: Timestamp,
    #[serde(default)]
    pub updated_at: Option<Timestamp>,
}

// ============================================================================
// ITEM / TURN RESULTS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ItemResult {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    pub item_id: ItemId,
    pub item_idx: i64,
    pub status: RunState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ItemRunLog {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    pub run_id: RunId,
    pub item_id: ItemId,
    pub status: RunState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TurnResult {
    pub id: i64,
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    pub item_id: ItemId,
    pub turn_id: TurnId,
    pub turn_idx: i64,
    pub status: RunState,
}

/// A turn of an appended item.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TurnInput {
    pub turn_id: TurnId,
    pub fields: FieldMap,
}

/// A data item submitted through `invoke`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ItemInput {
    pub item_id: ItemId,
    pub turns: Vec<TurnInput>,
}

/// Pagination window for list calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }
}

// ============================================================================
// CALL RECORDS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TargetRecord {
    pub id: i64,
    pub target_id: i64,
    pub target_version_id: i64,
    pub item_id: ItemId,
    pub turn_id: TurnId,
    pub status: RecordStatus,
    pub input_fields: FieldMap,
    pub output_fields: FieldMap,
    #[serde(default)]
    pub error: Option<String>,
}

impl TargetRecord {
    /// Record returned when the target call is skipped.
    pub fn skipped(item_id: ItemId, turn_id: TurnId) -> Self {
        Self {
            item_id,
            turn_id,
            status: RecordStatus::Success,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EvaluatorRecord {
    pub id: i64,
    pub evaluator_version_id: i64,
    pub item_id: ItemId,
    pub turn_id: TurnId,
    pub status: RecordStatus,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl EvaluatorRecord {
    /// Local record for an evaluator call that errored.
    pub fn failed(evaluator_version_id: i64, item_id: ItemId, turn_id: TurnId, error: String) -> Self {
        Self {
            evaluator_version_id,
            item_id,
            turn_id,
            status: RecordStatus::Fail,
            error: Some(error),
            ..Default::default()
        }
    }
}

/// Caller identity carried on events and checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Session {
    pub user_id: String,
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
