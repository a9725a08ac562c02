//! Error types for exptflow operations

use crate::ExptId;
use std::fmt;
use thiserror::Error;

/// Storage layer errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict on {entity} with id {id}: {reason}")]
    Conflict {
        entity: &'static str,
        id: String,
        reason: String,
    },

    #[error("Storage unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("Storage lock poisoned")]
    LockPoisoned,
}

impl StorageError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StorageError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Configuration and field-mapping validation errors. Never retryable.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    RequiredFieldMissing { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("with empty EvalSetVersion {version_id}")]
    EmptyEvalSetVersion { version_id: i64 },

    #[error("Field {field} mapped by {owner} is not in the {schema} schema")]
    UnknownSchemaField {
        owner: String,
        field: String,
        schema: &'static str,
    },

    #[error("Target version mismatch: experiment uses {expected}, connector uses {actual}")]
    TargetVersionMismatch { expected: i64, actual: i64 },

    #[error("Invalid runtime parameter: {reason}")]
    InvalidRuntimeParam { reason: String },

    #[error("Content rejected by audit: {reason}")]
    AuditRejected { reason: String },

    #[error("Item concurrency {requested} exceeds limit {limit}")]
    ItemConcurrencyExceeded { requested: i32, limit: i32 },

    #[error("Malformed field path {path:?}: {reason}")]
    InvalidFieldPath { path: String, reason: String },
}

/// Failure reported by a downstream service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{service} call failed: {reason}")]
pub struct ExternalError {
    pub service: &'static str,
    pub reason: String,
}

impl ExternalError {
    pub fn new(service: &'static str, reason: impl Into<String>) -> Self {
        Self {
            service,
            reason: reason.into(),
        }
    }
}

/// Completion notification errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NotifyError {
    #[error("No notification template for experiment status {status}")]
    UnsupportedStatus { status: String },

    #[error("User lookup failed: {reason}")]
    UserLookup { reason: String },

    #[error("Notification send failed: {reason}")]
    SendFailed { reason: String },
}

/// Configuration errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {field}: {value} - {reason}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
    },
}

/// Reason an entitlement check refused a paid call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    InsufficientBalance,
    AccountOverdue,
    QuotaExhausted,
    Other(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::InsufficientBalance => write!(f, "insufficient balance"),
            DenyReason::AccountOverdue => write!(f, "account overdue"),
            DenyReason::QuotaExhausted => write!(f, "quota exhausted"),
            DenyReason::Other(reason) => write!(f, "{reason}"),
        }
    }
}

/// Master error type for all exptflow operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExptflowError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Benefit check denied: {reason}")]
    BenefitDenied { reason: DenyReason },

    #[error("Experiment {expt_id} is already running")]
    LeaseContention { expt_id: ExptId },

    #[error(transparent)]
    External(#[from] ExternalError),

    #[error("Notify error: {0}")]
    Notify(#[from] NotifyError),

    #[error("Malformed deadline key: {member}")]
    MalformedDeadlineKey { member: String },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl ExptflowError {
    /// Completion paths treat a missing entity as an already-deleted experiment.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ExptflowError::Storage(StorageError::NotFound { .. }))
    }

    /// Whether redelivery of the triggering event may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExptflowError::Storage(StorageError::Unavailable { .. })
                | ExptflowError::Storage(StorageError::Conflict { .. })
                | ExptflowError::External(_)
        )
    }
}

impl From<serde_json::Error> for ExptflowError {
    fn from(e: serde_json::Error) -> Self {
        ExptflowError::Serialization(e.to_string())
    }
}

/// Result type for all exptflow operations.
pub type ExptflowResult<T> = Result<T, ExptflowError>;

// ============================================================================
// TESTS
// ============================================================================
