//! Status and kind enums for experiments, runs, items and turns.
//!
//! Numeric values are the persisted wire values and must not be renumbered.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// PARSE ERROR
// ============================================================================

/// Error when parsing an enum from its string or numeric representation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumParseError {
    pub kind: &'static str,
    pub value: String,
}

impl EnumParseError {
    fn new(kind: &'static str, value: impl ToString) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid {}: {}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

// ============================================================================
// EXPERIMENT STATUS
// ============================================================================

/// Lifecycle status of an experiment (and of each of its run logs).
///
/// ```text
/// Pending ──→ Processing ──→ Success | Failed
///    │             │
///    │             └──→ Draining ──→ Success | Failed
///    └──→ Terminating ──→ Terminated | SystemTerminated
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExptStatus {
    #[default]
    Unknown,
    Pending,
    Processing,
    Success,
    Failed,
    Terminated,
    SystemTerminated,
    Terminating,
    Draining,
}

impl ExptStatus {
    pub const ALL: [ExptStatus; 9] = [
        ExptStatus::Unknown,
        ExptStatus::Pending,
        ExptStatus::Processing,
        ExptStatus::Success,
        ExptStatus::Failed,
        ExptStatus::Terminated,
        ExptStatus::SystemTerminated,
        ExptStatus::Terminating,
        ExptStatus::Draining,
    ];

    pub fn as_i32(&self) -> i32 {
        match self {
            ExptStatus::Unknown => 0,
            ExptStatus::Pending => 2,
            ExptStatus::Processing => 3,
            ExptStatus::Success => 11,
            ExptStatus::Failed => 12,
            ExptStatus::Terminated => 13,
            ExptStatus::SystemTerminated => 14,
            ExptStatus::Terminating => 15,
            ExptStatus::Draining => 21,
        }
    }

    pub fn from_i32(value: i32) -> Result<Self, EnumParseError> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_i32() == value)
            .ok_or_else(|| EnumParseError::new("experiment status", value))
    }

    /// Convert to database string representation.
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ExptStatus::Unknown => "unknown",
            ExptStatus::Pending => "pending",
            ExptStatus::Processing => "processing",
            ExptStatus::Success => "success",
            ExptStatus::Failed => "failed",
            ExptStatus::Terminated => "terminated",
            ExptStatus::SystemTerminated => "system_terminated",
            ExptStatus::Terminating => "terminating",
            ExptStatus::Draining => "draining",
        }
    }

    /// Parse from database string representation.
    pub fn from_db_str(s: &str) -> Result<Self, EnumParseError> {
        let lower = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|status| status.as_db_str() == lower)
            .ok_or_else(|| EnumParseError::new("experiment status", s))
    }

    /// Finished statuses accept no further lifecycle transitions.
    ///
    /// Draining and Terminating are wind-down states and are not finished.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            ExptStatus::Success
                | ExptStatus::Failed
                | ExptStatus::Terminated
                | ExptStatus::SystemTerminated
        )
    }

    /// Whether a persisted status may be moved to `next`.
    pub fn can_transition_to(&self, next: ExptStatus) -> bool {
        if self.is_finished() {
            return *self == next;
        }
        true
    }
}

impl fmt::Display for ExptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for ExptStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_db_str(s)
    }
}

// ============================================================================
// EXPERIMENT TYPE / RUN MODE
// ============================================================================

/// Offline experiments call a target; online experiments score existing traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExptType {
    #[default]
    Offline,
    Online,
}

impl ExptType {
    pub fn as_i32(&self) -> i32 {
        match self {
            ExptType::Offline => 1,
            ExptType::Online => 2,
        }
    }

    pub fn from_i32(value: i32) -> Result<Self, EnumParseError> {
        match value {
            1 => Ok(ExptType::Offline),
            2 => Ok(ExptType::Online),
            other => Err(EnumParseError::new("experiment type", other)),
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            ExptType::Offline => "offline",
            ExptType::Online => "online",
        }
    }
}

impl fmt::Display for ExptType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for ExptType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "offline" => Ok(ExptType::Offline),
            "online" => Ok(ExptType::Online),
            _ => Err(EnumParseError::new("experiment type", s)),
        }
    }
}

/// How a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ExptRunMode {
    /// Normal submission of the whole eval set.
    #[default]
    Submit,
    /// Retry of every item that did not succeed.
    FailRetry,
    /// Items appended to a running experiment.
    Append,
}

impl ExptRunMode {
    pub fn as_i32(&self) -> i32 {
        match self {
            ExptRunMode::Submit => 1,
            ExptRunMode::FailRetry => 2,
            ExptRunMode::Append => 3,
        }
    }

    pub fn from_i32(value: i32) -> Result<Self, EnumParseError> {
        match value {
            1 => Ok(ExptRunMode::Submit),
            2 => Ok(ExptRunMode::FailRetry),
            3 => Ok(ExptRunMode::Append),
            other => Err(EnumParseError::new("run mode", other)),
        }
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            ExptRunMode::Submit => "submit",
            ExptRunMode::FailRetry => "fail_retry",
            ExptRunMode::Append => "append",
        }
    }
}

impl fmt::Display for ExptRunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for ExptRunMode {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "submit" => Ok(ExptRunMode::Submit),
            "fail_retry" => Ok(ExptRunMode::FailRetry),
            "append" => Ok(ExptRunMode::Append),
            _ => Err(EnumParseError::new("run mode", s)),
        }
    }
}

// ============================================================================
// ITEM / TURN RUN STATE
// ============================================================================

/// Execution state of an item or turn row. Closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RunState {
    #[default]
    Queueing,
    Processing,
    Success,
    Fail,
    Terminal,
}

impl RunState {
    pub const ALL: [RunState; 5] = [
        RunState::Queueing,
        RunState::Processing,
        RunState::Success,
        RunState::Fail,
        RunState::Terminal,
    ];

    pub fn as_i32(&self) -> i32 {
        match self {
            RunState::Queueing => 0,
            RunState::Processing => 1,
            RunState::Success => 2,
            RunState::Fail => 3,
            RunState::Terminal => 5,
        }
    }

    pub fn from_i32(value: i32) -> Result<Self, EnumParseError> {
        Self::ALL
            .into_iter()
            .find(|s| s.as_i32() == value)
            .ok_or_else(|| EnumParseError::new("run state", value))
    }

    pub fn as_db_str(&self) -> &'static str {
        match self {
            RunState::Queueing => "queueing",
            RunState::Processing => "processing",
            RunState::Success => "success",
            RunState::Fail => "fail",
            RunState::Terminal => "terminal",
        }
    }

    /// Terminal rows are never overwritten outside a termination cascade,
    /// and the cascade itself only touches incomplete rows.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Success | RunState::Fail | RunState::Terminal)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

impl FromStr for RunState {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Self::ALL
            .into_iter()
            .find(|state| state.as_db_str() == lower)
            .ok_or_else(|| EnumParseError::new("run state", s))
    }
}

// ============================================================================
// RECORD STATUS / EVALUATOR KIND / FIELD SOURCE
// ============================================================================

/// Outcome of a single target or evaluator call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum RecordStatus {
    #[default]
    Unknown,
    Success,
    Fail,
}

impl RecordStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            RecordStatus::Unknown => "unknown",
            RecordStatus::Success => "success",
            RecordStatus::Fail => "fail",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

/// Evaluator flavor. Each variant owns one input-building layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EvaluatorKind {
    #[default]
    Prompt,
    Code,
    /// Remote evaluator; without declared input schemas it receives split buckets.
    CustomRpc { has_input_schema: bool },
}

impl EvaluatorKind {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            EvaluatorKind::Prompt => "prompt",
            EvaluatorKind::Code => "code",
            EvaluatorKind::CustomRpc { .. } => "custom_rpc",
        }
    }
}

impl fmt::Display for EvaluatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

/// Where a field adapter reads its source value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum FieldSource {
    #[default]
    EvalSet,
    Target,
}

impl FieldSource {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            FieldSource::EvalSet => "eval_set",
            FieldSource::Target => "target",
        }
    }
}

impl fmt::Display for FieldSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_db_str())
    }
}

// ============================================================================
// TESTS
// ============================================================================
