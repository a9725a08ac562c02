//! Schedule event wire schema and deadline store keys.

use crate::{ExptId, ExptRunMode, ExptType, RunId, Session, SpaceId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// SCHEDULE EVENT
// ============================================================================

/// Unit of dispatched work. Delivery is at-least-once, so every consumer
/// must tolerate duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEvent {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    pub expt_run_id: RunId,
    #[serde(with = "run_mode_wire")]
    pub expt_run_mode: ExptRunMode,
    #[serde(with = "expt_type_wire")]
    pub expt_type: ExptType,
    /// Unix seconds.
    pub created_at: i64,
    pub session: Session,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub ext: HashMap<String, String>,
}

impl ScheduleEvent {
    pub fn new(
        space_id: SpaceId,
        expt_id: ExptId,
        expt_run_id: RunId,
        expt_run_mode: ExptRunMode,
        expt_type: ExptType,
        session: Session,
    ) -> Self {
        Self {
            space_id,
            expt_id,
            expt_run_id,
            expt_run_mode,
            expt_type,
            created_at: chrono::Utc::now().timestamp(),
            session,
            ext: HashMap::new(),
        }
    }

    pub fn with_ext(mut self, ext: HashMap<String, String>) -> Self {
        self.ext = ext;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

mod run_mode_wire {
    use crate::ExptRunMode;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(mode: &ExptRunMode, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i32(mode.as_i32())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ExptRunMode, D::Error> {
        let raw = i32::deserialize(d)?;
        ExptRunMode::from_i32(raw).map_err(D::Error::custom)
    }
}

mod expt_type_wire {
    use crate::ExptType;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(t: &ExptType, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i32(t.as_i32())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ExptType, D::Error> {
        let raw = i32::deserialize(d)?;
        ExptType::from_i32(raw).map_err(D::Error::custom)
    }
}

/// Event asking the aggregation worker to recompute experiment aggregates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggrCalculateEvent {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    pub created_at: i64,
}

// ============================================================================
// DEADLINE KEY
// ============================================================================

/// Deadline store member naming one run: `"{space}:{expt}:{run}"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeadlineKey {
    pub space_id: SpaceId,
    pub expt_id: ExptId,
    pub run_id: RunId,
}

impl DeadlineKey {
    pub fn new(space_id: SpaceId, expt_id: ExptId, run_id: RunId) -> Self {
        Self {
            space_id,
            expt_id,
            run_id,
        }
    }

    pub fn member(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for DeadlineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.space_id, self.expt_id, self.run_id)
    }
}

/// Error when a deadline member cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadlineKeyParseError(pub String);

impl fmt::Display for DeadlineKeyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Invalid deadline key: {}", self.0)
    }
}

impl std::error::Error for DeadlineKeyParseError {}

impl FromStr for DeadlineKey {
    type Err = DeadlineKeyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || DeadlineKeyParseError(s.to_string());
        let mut ids = s.split(':').map(|part| {
            part.parse::<i64>()
                .ok()
                .filter(|id| *id > 0)
                .ok_or_else(err)
        });
        let (Some(space_id), Some(expt_id), Some(run_id), None) =
            (ids.next(), ids.next(), ids.next(), ids.next())
        else {
            return Err(err());
        };
        Ok(Self::new(space_id?, expt_id?, run_id?))
    }
}

// ============================================================================
// TESTS
// ============================================================================
