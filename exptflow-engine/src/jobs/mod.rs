//! Background jobs for the exptflow engine.
//!
//! - `deadline_dispatch`: turns due deadline members into schedule events
//!
//! Jobs are spawned next to the event consumers and stopped through a
//! shared `watch` channel:
//!
//! ```ignore
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! tokio::spawn(deadline_dispatch_task(Arc::clone(&dispatcher), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

pub mod deadline_dispatch;

pub use deadline_dispatch::{
    deadline_dispatch_task, DeadlineDispatcher, DispatcherDeps, DispatcherMetrics,
    DispatcherSnapshot, MemberOutcome, TickReport,
};
