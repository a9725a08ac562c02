//! Contracts for the external collaborators the engine drives.
//!
//! Implementations live outside this workspace; `exptflow-test-utils`
//! provides scriptable mocks for every trait.

use crate::{
    AggrCalculateEvent, Content, DenyReason, EvaluatorRecord, ExptId, ExptflowResult, FieldMap,
    ItemId, RunId, ScheduleEvent, Session, SpaceId, StatusCounts, TargetRecord, TurnId,
    TurnResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

// ============================================================================
// EVENTS
// ============================================================================

/// Message bus producer. Delivery is at-least-once.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish_schedule_event(
        &self,
        event: &ScheduleEvent,
        visibility_delay: Duration,
    ) -> ExptflowResult<()>;

    async fn publish_aggr_calculate_event(
        &self,
        event: &AggrCalculateEvent,
        visibility_delay: Duration,
    ) -> ExptflowResult<()>;
}

// ============================================================================
// QUOTA / BENEFIT / AUDIT
// ============================================================================

/// Concurrent-run slots per space.
#[async_trait]
pub trait QuotaService: Send + Sync {
    async fn reserve_run(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        run_id: RunId,
        session: &Session,
    ) -> ExptflowResult<()>;

    async fn release_run(&self, space_id: SpaceId, expt_id: ExptId, run_id: RunId)
        -> ExptflowResult<()>;
}

/// What a benefit check is paying for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BenefitKind {
    ExptRun,
    TargetCall,
    EvaluatorCall { evaluator_version_id: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BenefitRequest {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    pub user_id: String,
    pub kind: BenefitKind,
    /// The experiment was granted a free run. The service still decides
    /// whether the call may proceed.
    pub is_free: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BenefitOutcome {
    pub deny_reason: Option<DenyReason>,
    /// The run is not billed.
    pub is_free: bool,
}

impl BenefitOutcome {
    pub fn allowed() -> Self {
        Self::default()
    }

    pub fn free() -> Self {
        Self {
            deny_reason: None,
            is_free: true,
        }
    }

    pub fn denied(reason: DenyReason) -> Self {
        Self {
            deny_reason: Some(reason),
            is_free: false,
        }
    }
}

/// Entitlement gate consulted before every billable call.
#[async_trait]
pub trait BenefitService: Send + Sync {
    async fn check_and_deduct(&self, request: &BenefitRequest) -> ExptflowResult<BenefitOutcome>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    Approved,
    Rejected { reason: String },
}

/// Content moderation for user-visible experiment text.
#[async_trait]
pub trait AuditService: Send + Sync {
    async fn audit_texts(&self, space_id: SpaceId, texts: &[String]) -> ExptflowResult<AuditOutcome>;
}

// ============================================================================
// TARGET / EVALUATOR / EVAL SET
// ============================================================================

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TargetCall {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    pub target_id: i64,
    pub target_version_id: i64,
    pub item_id: ItemId,
    pub turn_id: TurnId,
    pub input_fields: FieldMap,
    pub ext: HashMap<String, String>,
}

#[async_trait]
pub trait EvalTargetService: Send + Sync {
    /// Execute the system under test. The returned record's status tells
    /// whether the target itself succeeded.
    async fn execute(&self, call: &TargetCall) -> ExptflowResult<TargetRecord>;

    async fn validate_runtime_param(&self, target_version_id: i64, param: &str)
        -> ExptflowResult<()>;
}

/// Evaluator input, shaped by evaluator kind.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluatorInput {
    /// Every mapped field in one map.
    Flat { input_fields: FieldMap },
    /// Eval-set fields and target output fields kept apart.
    Split {
        dataset_fields: FieldMap,
        target_output_fields: FieldMap,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluatorCall {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    pub evaluator_version_id: i64,
    pub item_id: ItemId,
    pub turn_id: TurnId,
    pub input: EvaluatorInput,
    pub ext: HashMap<String, String>,
}

#[async_trait]
pub trait EvaluatorService: Send + Sync {
    async fn run(&self, call: &EvaluatorCall) -> ExptflowResult<EvaluatorRecord>;
}

/// Fetches full field values for eval-set content stored truncated.
#[async_trait]
pub trait EvalSetItemService: Send + Sync {
    async fn fetch_field(
        &self,
        space_id: SpaceId,
        eval_set_id: i64,
        item_id: ItemId,
        turn_id: TurnId,
        field_name: &str,
    ) -> ExptflowResult<Option<Content>>;
}

// ============================================================================
// RESULTS
// ============================================================================

#[async_trait]
pub trait ResultService: Send + Sync {
    /// Recompute experiment-level item counts from persisted results.
    async fn calculate_stats(&self, space_id: SpaceId, expt_id: ExptId)
        -> ExptflowResult<StatusCounts>;

    async fn incomplete_turns(&self, space_id: SpaceId, expt_id: ExptId)
        -> ExptflowResult<Vec<TurnResult>>;

    /// Refresh the filter index rows of the given items.
    async fn upsert_turn_result_filter(
        &self,
        space_id: SpaceId,
        expt_id: ExptId,
        item_ids: &[ItemId],
    ) -> ExptflowResult<()>;
}

// ============================================================================
// USERS / NOTIFY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UserInfo {
    pub user_id: String,
    pub name: String,
    pub email: Option<String>,
}

#[async_trait]
pub trait UserProvider: Send + Sync {
    async fn get_users(&self, user_ids: &[String]) -> ExptflowResult<Vec<UserInfo>>;
}

/// Completion card handed to the notification channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotifyCard {
    pub title: String,
    pub params: HashMap<String, String>,
}

#[async_trait]
pub trait NotifyAdapter: Send + Sync {
    async fn send_card(&self, recipient: &UserInfo, card: &NotifyCard) -> ExptflowResult<()>;
}
