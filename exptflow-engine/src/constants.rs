//! Constants for the exptflow engine
//!
//! Default timings, batch sizes and key prefixes. Every value here can be
//! overridden through the config structs in [`crate::config`].

// ============================================================================
// LIFECYCLE MANAGER
// ============================================================================

/// Visibility delay of schedule events published by `run` / `retry_unsuccess`
pub const DEFAULT_SCHEDULE_DELAY_SECS: u64 = 3;

/// Default TTL of the per-experiment run lease (the "zombie interval")
pub const DEFAULT_ZOMBIE_INTERVAL_SECS: u64 = 3600;

/// TTL of `complete_run` / `complete_expt` seen markers
pub const DEFAULT_COMPLETE_TOKEN_TTL_SECS: u64 = 180;

/// TTL of `finish` seen markers
pub const DEFAULT_FINISH_TOKEN_TTL_SECS: u64 = 60;

/// Rows per page when recomputing run status counts
pub const DEFAULT_STATS_PAGE_SIZE: usize = 100;

/// Page ceiling when recomputing run status counts
pub const DEFAULT_STATS_MAX_PAGES: usize = 10_000;

/// Pause between stats pages
pub const DEFAULT_STATS_PAGE_PAUSE_MS: u64 = 20;

/// Rows terminated per chunk in the termination cascade
pub const DEFAULT_TERMINATE_CHUNK_SIZE: usize = 30;

/// Pause between termination chunks
pub const DEFAULT_TERMINATE_CHUNK_PAUSE_MS: u64 = 50;

/// Settle time between row creation and the queueing counter bump in `invoke`
pub const DEFAULT_INVOKE_SETTLE_MS: u64 = 30;

/// Visibility delay of the post-completion aggregation event
pub const DEFAULT_AGGR_EVENT_DELAY_SECS: u64 = 3;

/// Upper bound accepted for an experiment's item concurrency
pub const DEFAULT_MAX_ITEM_CONCURRENCY: i32 = 50;

/// Evaluator fan-out width when the experiment leaves it unset
pub const DEFAULT_EVALUATOR_CONCURRENCY: usize = 3;

// ============================================================================
// DEADLINE DISPATCHER
// ============================================================================

/// Tick interval of the dispatcher loop
pub const DEFAULT_DISPATCH_INTERVAL_SECS: u64 = 45;

/// Due members handled per tick
pub const DEFAULT_DISPATCH_BATCH_SIZE: usize = 200;

/// TTL of a member claim
pub const DEFAULT_DISPATCH_CLAIM_TTL_SECS: u64 = 60;

/// Visibility delay of dispatched schedule events
pub const DEFAULT_DISPATCH_PUBLISH_DELAY_SECS: u64 = 3;

// ============================================================================
// IDEMPOTENCY KEY PREFIXES
// ============================================================================

pub const COMPLETE_RUN_KEY_PREFIX: &str = "CompleteRun:";
pub const COMPLETE_EXPT_KEY_PREFIX: &str = "CompleteExpt:";
pub const FINISH_EXPT_KEY_PREFIX: &str = "FinishExpt:";

// ============================================================================
// NOTIFICATION
// ============================================================================

/// Placeholder for absent notification parameters
pub const NOTIFY_EMPTY_PARAM: &str = "-";

/// Timestamp format used in notification cards
pub const NOTIFY_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
