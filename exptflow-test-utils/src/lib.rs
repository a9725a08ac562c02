//! exptflow Test Utilities
//!
//! Centralized test infrastructure for the exptflow workspace:
//! - Scriptable mocks for every external service trait
//! - Proptest generators for keys, statuses and result rows
//! - Experiment fixtures
//! - Custom assertions for exptflow error kinds

// Re-export in-memory stores from their source crate
pub use exptflow_storage::{
    InMemoryDeadlineStore, InMemoryIdempotencyStore, InMemoryLeaseStore, MockStorage,
};

use async_trait::async_trait;
use exptflow_core::services::{
    AuditOutcome, AuditService, BenefitKind, BenefitOutcome, BenefitRequest, BenefitService,
    EvalSetItemService, EvalTargetService, EvaluatorCall, EvaluatorService, EventPublisher,
    NotifyAdapter, NotifyCard, QuotaService, ResultService, TargetCall, UserInfo, UserProvider,
};
use exptflow_core::{
    AggrCalculateEvent, Content, DenyReason, EvaluatorRecord, ExptId, ExptflowResult,
    ExternalError, FieldMap, ItemId, Page, RecordStatus, RunId, ScheduleEvent, Session, SpaceId,
    StatusCounts, TargetRecord, TurnId, TurnResult,
};
use exptflow_storage::ExptStorage;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn failure(service: &'static str) -> exptflow_core::ExptflowError {
    ExternalError::new(service, "injected failure").into()
}

// ============================================================================
// EVENT PUBLISHER
// ============================================================================

/// Publisher that records every event. Can be switched to fail.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    schedule: Mutex<Vec<(ScheduleEvent, Duration)>>,
    aggr: Mutex<Vec<AggrCalculateEvent>>,
    fail: AtomicBool,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn schedule_events(&self) -> Vec<ScheduleEvent> {
        lock(&self.schedule).iter().map(|(e, _)| e.clone()).collect()
    }

    pub fn schedule_delays(&self) -> Vec<Duration> {
        lock(&self.schedule).iter().map(|(_, d)| *d).collect()
    }

    pub fn schedule_count(&self) -> usize {
        lock(&self.schedule).len()
    }

    pub fn aggr_events(&self) -> Vec<AggrCalculateEvent> {
        lock(&self.aggr).clone()
    }
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish_schedule_event(
        &self,
        event: &ScheduleEvent,
        visibility_delay: Duration,
    ) -> ExptflowResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(failure("publisher"));
        }
        lock(&self.schedule).push((event.clone(), visibility_delay));
        Ok(())
    }

    async fn publish_aggr_calculate_event(
        &self,
        event: &AggrCalculateEvent,
        _visibility_delay: Duration,
    ) -> ExptflowResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(failure("publisher"));
        }
        lock(&self.aggr).push(event.clone());
        Ok(())
    }
}

// ============================================================================
// QUOTA / BENEFIT / AUDIT
// ============================================================================

/// Quota service that grants every reservation and counts calls.
#[derive(Debug, Default)]
pub struct StaticQuota {
    pub reserved: AtomicU64,
    pub released: AtomicU64,
    fail_reserve: AtomicBool,
}

impl StaticQuota {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_reserve(&self, fail: bool) {
        self.fail_reserve.store(fail, Ordering::SeqCst);
    }

    pub fn reserved(&self) -> u64 {
        self.reserved.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl QuotaService for StaticQuota {
    async fn reserve_run(
        &self,
        _space_id: SpaceId,
        _expt_id: ExptId,
        _run_id: RunId,
        _session: &Session,
    ) -> ExptflowResult<()> {
        if self.fail_reserve.load(Ordering::SeqCst) {
            return Err(failure("quota"));
        }
        self.reserved.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn release_run(&self, _space_id: SpaceId, _expt_id: ExptId, _run_id: RunId) -> ExptflowResult<()> {
        self.released.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Benefit service with a default outcome plus per-evaluator overrides.
#[derive(Debug, Default)]
pub struct ScriptedBenefit {
    outcome: Mutex<BenefitOutcome>,
    target_outcome: Mutex<Option<BenefitOutcome>>,
    evaluator_outcomes: Mutex<HashMap<i64, BenefitOutcome>>,
    requests: Mutex<Vec<BenefitRequest>>,
    fail: AtomicBool,
}

impl ScriptedBenefit {
    /// Allows everything.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_outcome(&self, outcome: BenefitOutcome) {
        *lock(&self.outcome) = outcome;
    }

    pub fn deny_target(&self, reason: DenyReason) {
        *lock(&self.target_outcome) = Some(BenefitOutcome::denied(reason));
    }

    pub fn deny_evaluator(&self, evaluator_version_id: i64, reason: DenyReason) {
        lock(&self.evaluator_outcomes).insert(evaluator_version_id, BenefitOutcome::denied(reason));
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn requests(&self) -> Vec<BenefitRequest> {
        lock(&self.requests).clone()
    }

    pub fn request_count(&self, matches: impl Fn(&BenefitKind) -> bool) -> usize {
        lock(&self.requests).iter().filter(|r| matches(&r.kind)).count()
    }
}

#[async_trait]
impl BenefitService for ScriptedBenefit {
    async fn check_and_deduct(&self, request: &BenefitRequest) -> ExptflowResult<BenefitOutcome> {
        lock(&self.requests).push(request.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(failure("benefit"));
        }
        let scripted = match request.kind {
            BenefitKind::TargetCall => lock(&self.target_outcome).clone(),
            BenefitKind::EvaluatorCall {
                evaluator_version_id,
            } => lock(&self.evaluator_outcomes).get(&evaluator_version_id).cloned(),
            BenefitKind::ExptRun => None,
        };
        Ok(scripted.unwrap_or_else(|| lock(&self.outcome).clone()))
    }
}

/// Audit service that approves unless told to reject or fail.
#[derive(Debug, Default)]
pub struct MockAudit {
    reject: Mutex<Option<String>>,
    audited: Mutex<Vec<String>>,
    fail: AtomicBool,
}

impl MockAudit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reject_with(&self, reason: impl Into<String>) {
        *lock(&self.reject) = Some(reason.into());
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn audited_texts(&self) -> Vec<String> {
        lock(&self.audited).clone()
    }
}

#[async_trait]
impl AuditService for MockAudit {
    async fn audit_texts(&self, _space_id: SpaceId, texts: &[String]) -> ExptflowResult<AuditOutcome> {
        lock(&self.audited).extend(texts.iter().cloned());
        if self.fail.load(Ordering::SeqCst) {
            return Err(failure("audit"));
        }
        Ok(match lock(&self.reject).clone() {
            Some(reason) => AuditOutcome::Rejected { reason },
            None => AuditOutcome::Approved,
        })
    }
}

// ============================================================================
// TARGET / EVALUATOR / EVAL SET
// ============================================================================

/// Target executor returning a fixed output and recording calls.
#[derive(Debug)]
pub struct MockTargetService {
    output: Mutex<FieldMap>,
    status: Mutex<RecordStatus>,
    calls: Mutex<Vec<TargetCall>>,
    fail: AtomicBool,
    reject_runtime_param: AtomicBool,
}

impl Default for MockTargetService {
    fn default() -> Self {
        Self {
            output: Mutex::new(FieldMap::from([(
                "output".to_string(),
                Content::text(r#"{"answer":"4","confidence":0.9}"#),
            )])),
            status: Mutex::new(RecordStatus::Success),
            calls: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            reject_runtime_param: AtomicBool::new(false),
        }
    }
}

impl MockTargetService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_output(&self, output: FieldMap) {
        *lock(&self.output) = output;
    }

    /// Status of the records the target returns.
    pub fn set_status(&self, status: RecordStatus) {
        *lock(&self.status) = status;
    }

    /// Make `execute` return a service error.
    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn set_reject_runtime_param(&self, reject: bool) {
        self.reject_runtime_param.store(reject, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<TargetCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }
}

#[async_trait]
impl EvalTargetService for MockTargetService {
    async fn execute(&self, call: &TargetCall) -> ExptflowResult<TargetRecord> {
        lock(&self.calls).push(call.clone());
        if self.fail.load(Ordering::SeqCst) {
            return Err(failure("target"));
        }
        let status = *lock(&self.status);
        Ok(TargetRecord {
            id: call.item_id * 1_000 + call.turn_id,
            target_id: call.target_id,
            target_version_id: call.target_version_id,
            item_id: call.item_id,
            turn_id: call.turn_id,
            status,
            input_fields: call.input_fields.clone(),
            output_fields: lock(&self.output).clone(),
            error: (status == RecordStatus::Fail).then(|| "target returned failure".to_string()),
        })
    }

    async fn validate_runtime_param(&self, _target_version_id: i64, param: &str) -> ExptflowResult<()> {
        if self.reject_runtime_param.load(Ordering::SeqCst) {
            return Err(ExternalError::new("target", format!("unsupported runtime param {param}")).into());
        }
        serde_json::from_str::<serde_json::Value>(param)?;
        Ok(())
    }
}

/// Evaluator service that scores 1.0, with per-version failures and an
/// in-flight high-water mark.
#[derive(Debug, Default)]
pub struct MockEvaluatorService {
    failing: Mutex<HashSet<i64>>,
    delay: Mutex<Duration>,
    calls: Mutex<Vec<EvaluatorCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockEvaluatorService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_version(&self, evaluator_version_id: i64) {
        lock(&self.failing).insert(evaluator_version_id);
    }

    /// Hold each call this long, so concurrent calls overlap.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = delay;
    }

    pub fn calls(&self) -> Vec<EvaluatorCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EvaluatorService for MockEvaluatorService {
    async fn run(&self, call: &EvaluatorCall) -> ExptflowResult<EvaluatorRecord> {
        lock(&self.calls).push(call.clone());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = *lock(&self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if lock(&self.failing).contains(&call.evaluator_version_id) {
            return Err(failure("evaluator"));
        }
        Ok(EvaluatorRecord {
            id: call.evaluator_version_id * 1_000 + call.turn_id,
            evaluator_version_id: call.evaluator_version_id,
            item_id: call.item_id,
            turn_id: call.turn_id,
            status: RecordStatus::Success,
            score: Some(1.0),
            reasoning: Some("matches reference".to_string()),
            error: None,
        })
    }
}

/// Full field values for content stored truncated.
#[derive(Debug, Default)]
pub struct MockEvalSetItems {
    fields: Mutex<HashMap<(ItemId, TurnId, String), Content>>,
    fetches: AtomicUsize,
}

impl MockEvalSetItems {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, item_id: ItemId, turn_id: TurnId, name: impl Into<String>, content: Content) {
        lock(&self.fields).insert((item_id, turn_id, name.into()), content);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EvalSetItemService for MockEvalSetItems {
    async fn fetch_field(
        &self,
        _space_id: SpaceId,
        _eval_set_id: i64,
        item_id: ItemId,
        turn_id: TurnId,
        field_name: &str,
    ) -> ExptflowResult<Option<Content>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.fields)
            .get(&(item_id, turn_id, field_name.to_string()))
            .cloned())
    }
}

// ============================================================================
// RESULTS
// ============================================================================

/// Result service computing everything by scanning a [`MockStorage`].
pub struct ScanningResultService {
    storage: MockStorage,
    page_size: usize,
    filter_upserts: Mutex<Vec<ItemId>>,
}

impl ScanningResultService {
    pub fn new(storage: MockStorage) -> Self {
        Self {
            storage,
            page_size: 50,
            filter_upserts: Mutex::new(Vec::new()),
        }
    }

    /// Item ids passed to `upsert_turn_result_filter`, in call order.
    pub fn filter_upserts(&self) -> Vec<ItemId> {
        lock(&self.filter_upserts).clone()
    }

    async fn all_turns(&self, space_id: SpaceId, expt_id: ExptId) -> ExptflowResult<Vec<TurnResult>> {
        let mut rows = Vec::new();
        loop {
            let page = self
                .storage
                .turn_results_list(space_id, expt_id, Page::new(rows.len(), self.page_size))
                .await?;
            if page.rows.is_empty() {
                return Ok(rows);
            }
            rows.extend(page.rows);
        }
    }
}

#[async_trait]
impl ResultService for ScanningResultService {
    async fn calculate_stats(&self, space_id: SpaceId, expt_id: ExptId) -> ExptflowResult<StatusCounts> {
        let mut counts = StatusCounts::default();
        let mut offset = 0;
        loop {
            let page = self
                .storage
                .item_results_list(space_id, expt_id, Page::new(offset, self.page_size))
                .await?;
            if page.rows.is_empty() {
                return Ok(counts);
            }
            offset += page.rows.len();
            for item in &page.rows {
                counts.record(item.status);
            }
        }
    }

    async fn incomplete_turns(&self, space_id: SpaceId, expt_id: ExptId) -> ExptflowResult<Vec<TurnResult>> {
        Ok(self
            .all_turns(space_id, expt_id)
            .await?
            .into_iter()
            .filter(|t| !t.status.is_terminal())
            .collect())
    }

    async fn upsert_turn_result_filter(
        &self,
        _space_id: SpaceId,
        _expt_id: ExptId,
        item_ids: &[ItemId],
    ) -> ExptflowResult<()> {
        lock(&self.filter_upserts).extend_from_slice(item_ids);
        Ok(())
    }
}

// ============================================================================
// USERS / NOTIFY
// ============================================================================

/// User directory keyed by user id.
#[derive(Debug, Default)]
pub struct MockUsers {
    users: Mutex<Vec<UserInfo>>,
}

impl MockUsers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(self, user_id: &str) -> Self {
        self.add(UserInfo {
            user_id: user_id.to_string(),
            name: user_id.to_string(),
            email: Some(format!("{user_id}@example.com")),
        });
        self
    }

    pub fn add(&self, user: UserInfo) {
        lock(&self.users).push(user);
    }
}

#[async_trait]
impl UserProvider for MockUsers {
    async fn get_users(&self, user_ids: &[String]) -> ExptflowResult<Vec<UserInfo>> {
        Ok(lock(&self.users)
            .iter()
            .filter(|u| user_ids.contains(&u.user_id))
            .cloned()
            .collect())
    }
}

/// Notifier recording every card. Can be switched to fail.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    cards: Mutex<Vec<(String, NotifyCard)>>,
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// (recipient user id, card) pairs.
    pub fn cards(&self) -> Vec<(String, NotifyCard)> {
        lock(&self.cards).clone()
    }

    pub fn titles(&self) -> Vec<String> {
        lock(&self.cards).iter().map(|(_, c)| c.title.clone()).collect()
    }
}

#[async_trait]
impl NotifyAdapter for RecordingNotifier {
    async fn send_card(&self, recipient: &UserInfo, card: &NotifyCard) -> ExptflowResult<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(failure("notify"));
        }
        lock(&self.cards).push((recipient.user_id.clone(), card.clone()));
        Ok(())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    use exptflow_core::{DeadlineKey, ExptStatus, RunState, TurnResult};
    use proptest::prelude::*;

    pub fn arb_deadline_key() -> impl Strategy<Value = DeadlineKey> {
        (1i64..i64::MAX, 1i64..i64::MAX, 1i64..i64::MAX)
            .prop_map(|(space, expt, run)| DeadlineKey::new(space, expt, run))
    }

    pub fn arb_run_state() -> impl Strategy<Value = RunState> {
        prop_oneof![
            Just(RunState::Queueing),
            Just(RunState::Processing),
            Just(RunState::Success),
            Just(RunState::Fail),
            Just(RunState::Terminal),
        ]
    }

    pub fn arb_expt_status() -> impl Strategy<Value = ExptStatus> {
        proptest::sample::select(ExptStatus::ALL.to_vec())
    }

    /// Turn rows with unique (item, turn) identity for one experiment.
    pub fn arb_turn_results(
        space_id: i64,
        expt_id: i64,
        max_items: usize,
    ) -> impl Strategy<Value = Vec<TurnResult>> {
        proptest::collection::vec(
            (1usize..4, proptest::collection::vec(arb_run_state(), 3)),
            0..=max_items,
        )
        .prop_map(move |items| {
            let mut rows = Vec::new();
            for (item_idx, (turns, states)) in items.into_iter().enumerate() {
                for (turn_idx, state) in states.into_iter().take(turns).enumerate() {
                    rows.push(TurnResult {
                        id: rows.len() as i64 + 1,
                        space_id,
                        expt_id,
                        item_id: item_idx as i64 + 1,
                        turn_id: turn_idx as i64,
                        turn_idx: turn_idx as i64,
                        status: state,
                    });
                }
            }
            rows
        })
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    use exptflow_core::{
        Content, ConnectorConf, EvalConf, EvalSet, EvalSetVersion, EvalTarget, EvalTargetVersion,
        Evaluator, EvaluatorConf, EvaluatorIngressConf, EvaluatorKind, EvaluatorsConf, Experiment,
        ExptStatus, ExptType, FieldAdapter, FieldConf, FieldMap, FieldSchema, ItemInput,
        TargetConf, TargetIngressConf, TurnInput,
    };

    pub const TEST_USER: &str = "user-1";
    pub const TARGET_VERSION_ID: i64 = 500;

    /// Builder for hydrated experiments.
    ///
    /// Defaults to an Offline, Pending experiment over a 10-item eval set
    /// with `question`/`reference` fields, a target mapping `question` to
    /// `input`, and one prompt evaluator (version 901).
    #[derive(Debug, Clone)]
    pub struct ExperimentBuilder {
        expt: Experiment,
        evaluators: Vec<(Evaluator, EvaluatorIngressConf)>,
        evaluator_concurrency: Option<i32>,
        item_concurrency: Option<i32>,
        runtime_param: Option<String>,
    }

    impl ExperimentBuilder {
        pub fn new(space_id: i64, expt_id: i64) -> Self {
            let expt = Experiment {
                id: expt_id,
                space_id,
                name: format!("experiment-{expt_id}"),
                description: "nightly regression".to_string(),
                created_by: TEST_USER.to_string(),
                expt_type: ExptType::Offline,
                status: ExptStatus::Pending,
                eval_set_id: 300,
                eval_set_version_id: 301,
                target_id: 400,
                target_version_id: TARGET_VERSION_ID,
                eval_set: Some(EvalSet {
                    id: 300,
                    name: "qa".to_string(),
                    version: Some(EvalSetVersion {
                        id: 301,
                        item_count: 10,
                        field_schemas: vec![FieldSchema::text("question"), FieldSchema::text("reference")],
                    }),
                }),
                target: Some(EvalTarget {
                    id: 400,
                    version: Some(EvalTargetVersion {
                        id: TARGET_VERSION_ID,
                        output_schemas: vec![FieldSchema::text("output")],
                    }),
                }),
                ..Default::default()
            };
            Self {
                expt,
                evaluators: vec![(prompt_evaluator(901), default_evaluator_ingress())],
                evaluator_concurrency: None,
                item_concurrency: None,
                runtime_param: None,
            }
        }

        pub fn online(mut self) -> Self {
            self.expt.expt_type = ExptType::Online;
            self
        }

        pub fn status(mut self, status: ExptStatus) -> Self {
            self.expt.status = status;
            self
        }

        pub fn name(mut self, name: impl Into<String>) -> Self {
            self.expt.name = name.into();
            self
        }

        pub fn created_by(mut self, user: impl Into<String>) -> Self {
            self.expt.created_by = user.into();
            self
        }

        pub fn item_count(mut self, count: i64) -> Self {
            if let Some(version) = self.expt.eval_set.as_mut().and_then(|s| s.version.as_mut()) {
                version.item_count = count;
            }
            self
        }

        pub fn without_eval_set(mut self) -> Self {
            self.expt.eval_set = None;
            self
        }

        /// No target: the target phase is skipped.
        pub fn without_target(mut self) -> Self {
            self.expt.target_version_id = 0;
            self.expt.target_id = 0;
            self.expt.target = None;
            self
        }

        pub fn credit_free(mut self) -> Self {
            self.expt.credit_free = true;
            self
        }

        pub fn latest_run_id(mut self, run_id: i64) -> Self {
            self.expt.latest_run_id = run_id;
            self
        }

        pub fn max_alive_secs(mut self, secs: i64) -> Self {
            self.expt.max_alive_secs = Some(secs);
            self
        }

        pub fn start_at(mut self, at: chrono::DateTime<chrono::Utc>) -> Self {
            self.expt.start_at = Some(at);
            self
        }

        pub fn item_concurrency(mut self, n: i32) -> Self {
            self.item_concurrency = Some(n);
            self
        }

        pub fn evaluator_concurrency(mut self, n: i32) -> Self {
            self.evaluator_concurrency = Some(n);
            self
        }

        pub fn target_runtime_param(mut self, param: impl Into<String>) -> Self {
            self.runtime_param = Some(param.into());
            self
        }

        /// Replace the evaluator list.
        pub fn evaluators(mut self, evaluators: Vec<(Evaluator, EvaluatorIngressConf)>) -> Self {
            self.evaluators = evaluators;
            self
        }

        pub fn no_evaluators(mut self) -> Self {
            self.evaluators.clear();
            self
        }

        pub fn build(self) -> Experiment {
            let mut expt = self.expt;
            let target_conf = (expt.target_version_id != 0).then(|| TargetConf {
                target_version_id: expt.target_version_id,
                ingress_conf: Some(TargetIngressConf {
                    eval_set_adapter: FieldAdapter::new(vec![FieldConf::new("input", "question")]),
                    custom_conf: self.runtime_param.map(|param| {
                        FieldAdapter::new(vec![FieldConf {
                            field_name: exptflow_core::RUNTIME_PARAM_FIELD.to_string(),
                            from_field: String::new(),
                            value: Some(param),
                        }])
                    }),
                }),
            });
            let evaluators_conf = (!self.evaluators.is_empty()).then(|| EvaluatorsConf {
                evaluator_concurrency: self.evaluator_concurrency,
                evaluator_conf: self
                    .evaluators
                    .iter()
                    .map(|(e, ingress)| EvaluatorConf {
                        evaluator_version_id: e.version_id,
                        ingress_conf: Some(ingress.clone()),
                        run_conf: None,
                    })
                    .collect(),
            });
            expt.evaluator_version_ids = self.evaluators.iter().map(|(e, _)| e.version_id).collect();
            expt.evaluators = self.evaluators.into_iter().map(|(e, _)| e).collect();
            expt.eval_conf = Some(EvalConf {
                connector: ConnectorConf {
                    target_conf,
                    evaluators_conf,
                },
                item_concurrency: self.item_concurrency,
            });
            expt
        }
    }

    pub fn prompt_evaluator(version_id: i64) -> Evaluator {
        Evaluator {
            version_id,
            name: format!("prompt-{version_id}"),
            kind: EvaluatorKind::Prompt,
        }
    }

    pub fn code_evaluator(version_id: i64) -> Evaluator {
        Evaluator {
            version_id,
            name: format!("code-{version_id}"),
            kind: EvaluatorKind::Code,
        }
    }

    /// Maps `question` and `reference` from the eval set and `output.answer`
    /// from the target.
    pub fn default_evaluator_ingress() -> EvaluatorIngressConf {
        EvaluatorIngressConf {
            eval_set_adapter: Some(FieldAdapter::new(vec![
                FieldConf::new("input", "question"),
                FieldConf::new("reference", "reference"),
            ])),
            target_adapter: Some(FieldAdapter::new(vec![FieldConf::new("actual", "output.answer")])),
        }
    }

    pub fn turn_fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), Content::text(*v)))
            .collect()
    }

    /// Single-turn items with the given ids.
    pub fn items(ids: &[i64]) -> Vec<ItemInput> {
        ids.iter()
            .map(|&item_id| ItemInput {
                item_id,
                turns: vec![TurnInput {
                    turn_id: 0,
                    fields: turn_fields(&[("question", "2+2?"), ("reference", "4")]),
                }],
            })
            .collect()
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    use exptflow_core::{ExptflowError, ExptflowResult};

    /// Assert that a result is a validation error.
    pub fn assert_validation_err<T: std::fmt::Debug>(result: &ExptflowResult<T>) {
        assert!(
            matches!(result, Err(ExptflowError::Validation(_))),
            "Expected validation error, got {:?}",
            result
        );
    }

    /// Assert that a result is a not-found storage error.
    pub fn assert_not_found<T: std::fmt::Debug>(result: &ExptflowResult<T>) {
        assert!(
            matches!(result, Err(e) if e.is_not_found()),
            "Expected not-found error, got {:?}",
            result
        );
    }
}
