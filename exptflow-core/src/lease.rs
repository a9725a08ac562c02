//! TTL lease records shared by the run lease and the deadline claim.
//!
//! A lease is held until `release` or until `expires_at`, whichever comes
//! first. An expired lease may be taken over by any caller.

use crate::{ExptId, Timestamp};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Persisted state of one held lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseData {
    pub key: String,
    pub acquired_at: Timestamp,
    pub expires_at: Timestamp,
}

impl LeaseData {
    pub fn new(key: impl Into<String>, ttl: Duration, now: Timestamp) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            key: key.into(),
            acquired_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(now),
        }
    }

    /// Check if the lease has expired based on current time.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now >= self.expires_at
    }

    /// Calculate remaining duration until expiry.
    pub fn remaining_duration(&self, now: Timestamp) -> Option<Duration> {
        if now >= self.expires_at {
            None
        } else {
            (self.expires_at - now).to_std().ok()
        }
    }
}

/// Lease key serializing runs of one experiment.
pub fn run_lease_key(expt_id: ExptId) -> String {
    format!("expt_run_lock:{expt_id}")
}

/// Lease key claiming one deadline store member.
pub fn deadline_claim_key(member: &str) -> String {
    format!("expt_deadline_claim:{member}")
}
