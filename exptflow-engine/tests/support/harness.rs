//! Shared wiring for engine integration tests.

#![allow(dead_code)]

use exptflow_core::{Experiment, Session};
use exptflow_engine::{ExptManager, ExptMetrics, ManagerConfig, ManagerDeps};
use exptflow_storage::ExptStorage;
use exptflow_test_utils::{
    InMemoryIdempotencyStore, InMemoryLeaseStore, MockAudit, MockStorage, MockTargetService,
    MockUsers, RecordingNotifier, RecordingPublisher, ScanningResultService, ScriptedBenefit,
    StaticQuota,
};
use prometheus::Registry;
use std::sync::Arc;

pub const SPACE: i64 = 1;
pub const USER: &str = exptflow_test_utils::fixtures::TEST_USER;

/// A manager over in-memory stores with every collaborator exposed.
pub struct Harness {
    pub storage: MockStorage,
    pub leases: Arc<InMemoryLeaseStore>,
    pub idempotency: Arc<InMemoryIdempotencyStore>,
    pub publisher: Arc<RecordingPublisher>,
    pub quota: Arc<StaticQuota>,
    pub benefit: Arc<ScriptedBenefit>,
    pub audit: Arc<MockAudit>,
    pub target: Arc<MockTargetService>,
    pub results: Arc<ScanningResultService>,
    pub users: Arc<MockUsers>,
    pub notifier: Arc<RecordingNotifier>,
    pub registry: Registry,
    pub manager: ExptManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::development())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let storage = MockStorage::new();
        let leases = Arc::new(InMemoryLeaseStore::new());
        let idempotency = Arc::new(InMemoryIdempotencyStore::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let quota = Arc::new(StaticQuota::new());
        let benefit = Arc::new(ScriptedBenefit::new());
        let audit = Arc::new(MockAudit::new());
        let target = Arc::new(MockTargetService::new());
        let results = Arc::new(ScanningResultService::new(storage.clone()));
        let users = Arc::new(MockUsers::new().with_user(USER));
        let notifier = Arc::new(RecordingNotifier::new());
        let registry = Registry::new();
        let metrics = ExptMetrics::new(&registry).expect("metrics register");

        let deps = ManagerDeps {
            storage: Arc::new(storage.clone()),
            leases: leases.clone(),
            idempotency: idempotency.clone(),
            publisher: publisher.clone(),
            quota: quota.clone(),
            benefit: benefit.clone(),
            audit: audit.clone(),
            target: target.clone(),
            results: results.clone(),
            users: users.clone(),
            notifier: notifier.clone(),
        };
        let manager = ExptManager::new(deps, config, metrics);

        Self {
            storage,
            leases,
            idempotency,
            publisher,
            quota,
            benefit,
            audit,
            target,
            results,
            users,
            notifier,
            registry,
            manager,
        }
    }

    pub async fn insert(&self, expt: &Experiment) {
        self.storage
            .experiment_insert(expt)
            .await
            .expect("insert experiment");
    }

    pub async fn experiment(&self, expt_id: i64) -> Experiment {
        self.storage
            .experiment_get(SPACE, expt_id)
            .await
            .expect("get experiment")
            .expect("experiment exists")
    }

    pub fn session(&self) -> Session {
        Session::new(USER)
    }
}
