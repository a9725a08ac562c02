//! Engine configuration.
//!
//! Every struct has a `Default` built from [`crate::constants`], a
//! `from_env()` reading `EXPTFLOW_*` variables, and a `development()`
//! preset with short timings for tests and local runs.

use crate::constants::*;
use exptflow_core::ConfigError;
use std::str::FromStr;
use std::time::Duration;

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

fn env_secs(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_parse(name, default))
}

fn env_millis(name: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(name, default))
}

fn require_positive(field: &str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(())
}

// ============================================================================
// LIFECYCLE MANAGER
// ============================================================================

/// Configuration for [`crate::manager::ExptManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// TTL of the per-experiment run lease. A dead owner blocks new runs
    /// for at most this long.
    pub zombie_interval: Duration,

    /// Visibility delay of schedule events from `run` / `retry_unsuccess`
    pub schedule_delay: Duration,

    pub complete_token_ttl: Duration,
    pub finish_token_ttl: Duration,

    pub stats_page_size: usize,
    pub stats_max_pages: usize,
    pub stats_page_pause: Duration,

    pub terminate_chunk_size: usize,
    pub terminate_chunk_pause: Duration,

    pub invoke_settle_delay: Duration,
    pub aggr_event_delay: Duration,

    /// Upper bound accepted by `check_run` for item concurrency
    pub max_item_concurrency: i32,

    /// Evaluator fan-out width when an experiment leaves it unset or non-positive
    pub default_evaluator_concurrency: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            zombie_interval: Duration::from_secs(DEFAULT_ZOMBIE_INTERVAL_SECS),
            schedule_delay: Duration::from_secs(DEFAULT_SCHEDULE_DELAY_SECS),
            complete_token_ttl: Duration::from_secs(DEFAULT_COMPLETE_TOKEN_TTL_SECS),
            finish_token_ttl: Duration::from_secs(DEFAULT_FINISH_TOKEN_TTL_SECS),
            stats_page_size: DEFAULT_STATS_PAGE_SIZE,
            stats_max_pages: DEFAULT_STATS_MAX_PAGES,
            stats_page_pause: Duration::from_millis(DEFAULT_STATS_PAGE_PAUSE_MS),
            terminate_chunk_size: DEFAULT_TERMINATE_CHUNK_SIZE,
            terminate_chunk_pause: Duration::from_millis(DEFAULT_TERMINATE_CHUNK_PAUSE_MS),
            invoke_settle_delay: Duration::from_millis(DEFAULT_INVOKE_SETTLE_MS),
            aggr_event_delay: Duration::from_secs(DEFAULT_AGGR_EVENT_DELAY_SECS),
            max_item_concurrency: DEFAULT_MAX_ITEM_CONCURRENCY,
            default_evaluator_concurrency: DEFAULT_EVALUATOR_CONCURRENCY,
        }
    }
}

impl ManagerConfig {
    /// Create ManagerConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `EXPTFLOW_ZOMBIE_INTERVAL_SECS` (default: 3600)
    /// - `EXPTFLOW_SCHEDULE_DELAY_SECS` (default: 3)
    /// - `EXPTFLOW_COMPLETE_TOKEN_TTL_SECS` (default: 180)
    /// - `EXPTFLOW_FINISH_TOKEN_TTL_SECS` (default: 60)
    /// - `EXPTFLOW_STATS_PAGE_SIZE` (default: 100)
    /// - `EXPTFLOW_STATS_MAX_PAGES` (default: 10000)
    /// - `EXPTFLOW_STATS_PAGE_PAUSE_MS` (default: 20)
    /// - `EXPTFLOW_TERMINATE_CHUNK_SIZE` (default: 30)
    /// - `EXPTFLOW_TERMINATE_CHUNK_PAUSE_MS` (default: 50)
    /// - `EXPTFLOW_INVOKE_SETTLE_MS` (default: 30)
    /// - `EXPTFLOW_AGGR_EVENT_DELAY_SECS` (default: 3)
    /// - `EXPTFLOW_MAX_ITEM_CONCURRENCY` (default: 50)
    /// - `EXPTFLOW_DEFAULT_EVALUATOR_CONCURRENCY` (default: 3)
    pub fn from_env() -> Self {
        Self {
            zombie_interval: env_secs("EXPTFLOW_ZOMBIE_INTERVAL_SECS", DEFAULT_ZOMBIE_INTERVAL_SECS),
            schedule_delay: env_secs("EXPTFLOW_SCHEDULE_DELAY_SECS", DEFAULT_SCHEDULE_DELAY_SECS),
            complete_token_ttl: env_secs(
                "EXPTFLOW_COMPLETE_TOKEN_TTL_SECS",
                DEFAULT_COMPLETE_TOKEN_TTL_SECS,
            ),
            finish_token_ttl: env_secs(
                "EXPTFLOW_FINISH_TOKEN_TTL_SECS",
                DEFAULT_FINISH_TOKEN_TTL_SECS,
            ),
            stats_page_size: env_parse("EXPTFLOW_STATS_PAGE_SIZE", DEFAULT_STATS_PAGE_SIZE),
            stats_max_pages: env_parse("EXPTFLOW_STATS_MAX_PAGES", DEFAULT_STATS_MAX_PAGES),
            stats_page_pause: env_millis(
                "EXPTFLOW_STATS_PAGE_PAUSE_MS",
                DEFAULT_STATS_PAGE_PAUSE_MS,
            ),
            terminate_chunk_size: env_parse(
                "EXPTFLOW_TERMINATE_CHUNK_SIZE",
                DEFAULT_TERMINATE_CHUNK_SIZE,
            ),
            terminate_chunk_pause: env_millis(
                "EXPTFLOW_TERMINATE_CHUNK_PAUSE_MS",
                DEFAULT_TERMINATE_CHUNK_PAUSE_MS,
            ),
            invoke_settle_delay: env_millis("EXPTFLOW_INVOKE_SETTLE_MS", DEFAULT_INVOKE_SETTLE_MS),
            aggr_event_delay: env_secs(
                "EXPTFLOW_AGGR_EVENT_DELAY_SECS",
                DEFAULT_AGGR_EVENT_DELAY_SECS,
            ),
            max_item_concurrency: env_parse(
                "EXPTFLOW_MAX_ITEM_CONCURRENCY",
                DEFAULT_MAX_ITEM_CONCURRENCY,
            ),
            default_evaluator_concurrency: env_parse(
                "EXPTFLOW_DEFAULT_EVALUATOR_CONCURRENCY",
                DEFAULT_EVALUATOR_CONCURRENCY,
            ),
        }
    }

    /// Short timings for tests. Pacing pauses are zero.
    pub fn development() -> Self {
        Self {
            zombie_interval: Duration::from_secs(60),
            schedule_delay: Duration::from_millis(10),
            complete_token_ttl: Duration::from_secs(180),
            finish_token_ttl: Duration::from_secs(60),
            stats_page_size: 10,
            stats_max_pages: 1_000,
            stats_page_pause: Duration::ZERO,
            terminate_chunk_size: 5,
            terminate_chunk_pause: Duration::ZERO,
            invoke_settle_delay: Duration::ZERO,
            aggr_event_delay: Duration::from_millis(10),
            max_item_concurrency: DEFAULT_MAX_ITEM_CONCURRENCY,
            default_evaluator_concurrency: DEFAULT_EVALUATOR_CONCURRENCY,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("stats_page_size", self.stats_page_size)?;
        require_positive("stats_max_pages", self.stats_max_pages)?;
        require_positive("terminate_chunk_size", self.terminate_chunk_size)?;
        require_positive("default_evaluator_concurrency", self.default_evaluator_concurrency)?;
        if self.zombie_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "zombie_interval".to_string(),
                value: "0".to_string(),
                reason: "run lease TTL must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// DEADLINE DISPATCHER
// ============================================================================

/// Configuration for the deadline dispatcher loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often to scan the due store (default: 45 seconds)
    pub interval: Duration,

    /// Maximum due members handled per tick (default: 200)
    pub batch_size: usize,

    /// Claim lease TTL; an unfinished claim is retried by any instance after this
    /// (default: 60 seconds)
    pub claim_ttl: Duration,

    /// Visibility delay of published schedule events (default: 3 seconds)
    pub publish_delay: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_DISPATCH_INTERVAL_SECS),
            batch_size: DEFAULT_DISPATCH_BATCH_SIZE,
            claim_ttl: Duration::from_secs(DEFAULT_DISPATCH_CLAIM_TTL_SECS),
            publish_delay: Duration::from_secs(DEFAULT_DISPATCH_PUBLISH_DELAY_SECS),
        }
    }
}

impl DispatcherConfig {
    /// Create DispatcherConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `EXPTFLOW_DISPATCH_INTERVAL_SECS` (default: 45)
    /// - `EXPTFLOW_DISPATCH_BATCH_SIZE` (default: 200)
    /// - `EXPTFLOW_DISPATCH_CLAIM_TTL_SECS` (default: 60)
    /// - `EXPTFLOW_DISPATCH_PUBLISH_DELAY_SECS` (default: 3)
    pub fn from_env() -> Self {
        Self {
            interval: env_secs("EXPTFLOW_DISPATCH_INTERVAL_SECS", DEFAULT_DISPATCH_INTERVAL_SECS),
            batch_size: env_parse("EXPTFLOW_DISPATCH_BATCH_SIZE", DEFAULT_DISPATCH_BATCH_SIZE),
            claim_ttl: env_secs(
                "EXPTFLOW_DISPATCH_CLAIM_TTL_SECS",
                DEFAULT_DISPATCH_CLAIM_TTL_SECS,
            ),
            publish_delay: env_secs(
                "EXPTFLOW_DISPATCH_PUBLISH_DELAY_SECS",
                DEFAULT_DISPATCH_PUBLISH_DELAY_SECS,
            ),
        }
    }

    pub fn development() -> Self {
        Self {
            interval: Duration::from_millis(50),
            batch_size: 20,
            claim_ttl: Duration::from_secs(5),
            publish_delay: Duration::from_millis(10),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("batch_size", self.batch_size)?;
        if self.interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                field: "interval".to_string(),
                value: "0".to_string(),
                reason: "tick interval must be non-zero".to_string(),
            });
        }
        Ok(())
    }
}

// ============================================================================
// TELEMETRY
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is unset
    pub log_level: String,
    /// Emit JSON lines instead of human-readable output
    pub json_logs: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
        }
    }
}

impl TelemetryConfig {
    /// - `EXPTFLOW_LOG_LEVEL` (default: info)
    /// - `EXPTFLOW_LOG_JSON` (default: false)
    pub fn from_env() -> Self {
        Self {
            log_level: std::env::var("EXPTFLOW_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            json_logs: std::env::var("EXPTFLOW_LOG_JSON")
                .map(|s| s == "true" || s == "1")
                .unwrap_or(false),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manager_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.schedule_delay, Duration::from_secs(3));
        assert_eq!(config.stats_page_size, 100);
        assert_eq!(config.stats_max_pages, 10_000);
        assert_eq!(config.stats_page_pause, Duration::from_millis(20));
        assert_eq!(config.terminate_chunk_size, 30);
        assert_eq!(config.terminate_chunk_pause, Duration::from_millis(50));
        assert_eq!(config.complete_token_ttl, Duration::from_secs(180));
        assert_eq!(config.default_evaluator_concurrency, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_dispatcher_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.interval, Duration::from_secs(45));
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.claim_ttl, Duration::from_secs(60));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = ManagerConfig {
            stats_page_size: 0,
            ..ManagerConfig::development()
        };
        assert!(config.validate().is_err());

        let config = DispatcherConfig {
            batch_size: 0,
            ..DispatcherConfig::development()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("EXPTFLOW_TEST_GARBAGE_SIZE", "not-a-number");
        assert_eq!(env_parse("EXPTFLOW_TEST_GARBAGE_SIZE", 7usize), 7);
        std::env::set_var("EXPTFLOW_TEST_GARBAGE_SIZE", " 12 ");
        assert_eq!(env_parse("EXPTFLOW_TEST_GARBAGE_SIZE", 7usize), 12);
        std::env::remove_var("EXPTFLOW_TEST_GARBAGE_SIZE");
    }
}
