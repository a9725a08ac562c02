//! exptflow Engine
//!
//! Orchestration of evaluation experiments:
//!
//! - [`manager`]: the experiment lifecycle state machine
//! - [`turn`]: the two-phase target-then-evaluators pipeline for one turn
//! - [`field`]: field resolution and field adapter application
//! - [`jobs`]: the deadline dispatcher background task
//!
//! Storage and external services are injected as trait objects from
//! `exptflow-storage` and `exptflow_core::services`.

pub mod config;
pub mod constants;
pub mod field;
pub mod jobs;
pub mod manager;
pub mod telemetry;
pub mod turn;

pub use config::{DispatcherConfig, ManagerConfig, TelemetryConfig};
pub use field::{apply_field_adapters, extract_json_path, resolve_field, FieldPath, PathSegment};
pub use jobs::{deadline_dispatch_task, DeadlineDispatcher, DispatcherDeps, DispatcherMetrics};
pub use manager::{final_expt_status, CompleteOptions, ExptManager, ManagerDeps, RunCheck};
pub use telemetry::{init_tracing, ExptMetrics};
pub use turn::{PipelineServices, TurnEvalContext, TurnEvalResult, TurnPipeline};
