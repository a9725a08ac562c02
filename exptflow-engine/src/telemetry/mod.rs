//! Telemetry: Prometheus metrics and tracing setup.

pub mod metrics;
pub mod tracer;

pub use metrics::{render, ExptMetrics};
pub use tracer::init_tracing;
