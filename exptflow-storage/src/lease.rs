//! Distributed mutual exclusion with TTL leases.

use ::async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use exptflow_core::{ExptflowResult, LeaseData};
use std::time::Duration;

/// Lease backed by any store with an atomic compare-and-set.
///
/// A lease lapses on its own after `ttl`, so a crashed holder never blocks
/// other callers for longer than that.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Take the lease if it is free or expired. Returns whether it was taken.
    async fn acquire(&self, key: &str, ttl: Duration) -> ExptflowResult<bool>;

    /// Drop the lease. Returns whether a lease was held.
    async fn release(&self, key: &str) -> ExptflowResult<bool>;
}

/// In-process lease store. Per-key entry locking gives the compare-and-set.
#[derive(Debug, Default)]
pub struct InMemoryLeaseStore {
    leases: DashMap<String, LeaseData>,
}

impl InMemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether an unexpired lease is held on `key`.
    pub fn is_held(&self, key: &str) -> bool {
        self.leases
            .get(key)
            .map(|lease| !lease.is_expired(Utc::now()))
            .unwrap_or(false)
    }

    /// Expire a lease immediately, as if its holder had died long ago.
    pub fn force_expire(&self, key: &str) {
        if let Some(mut lease) = self.leases.get_mut(key) {
            lease.expires_at = lease.acquired_at;
        }
    }

    pub fn try_acquire(&self, key: &str, ttl: Duration) -> bool {
        let now = Utc::now();
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().is_expired(now) {
                    held.insert(LeaseData::new(key, ttl, now));
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(free) => {
                free.insert(LeaseData::new(key, ttl, now));
                true
            }
        }
    }

    pub fn drop_lease(&self, key: &str) -> bool {
        self.leases.remove(key).is_some()
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn acquire(&self, key: &str, ttl: Duration) -> ExptflowResult<bool> {
        Ok(self.try_acquire(key, ttl))
    }

    async fn release(&self, key: &str) -> ExptflowResult<bool> {
        Ok(self.drop_lease(key))
    }
}
