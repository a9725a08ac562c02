//! Time-ordered due store polled by the deadline dispatcher.
//!
//! Members are claimed with a TTL lease before being acted on. A claimed
//! member stays in the store until it is explicitly removed, so a claimant
//! that dies mid-flight leaves it for the next instance once the claim lapses.

use crate::lease::InMemoryLeaseStore;
use ::async_trait::async_trait;
use dashmap::DashMap;
use exptflow_core::{deadline_claim_key, ExptflowResult, StorageError, Timestamp};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

#[async_trait]
pub trait DeadlineStore: Send + Sync {
    async fn add(&self, member: &str, due_at: Timestamp) -> ExptflowResult<()>;

    /// Members due at or before `now`, earliest first, at most `limit`.
    async fn scan_due(&self, now: Timestamp, limit: usize) -> ExptflowResult<Vec<String>>;

    /// Claim a member for `ttl`. Returns false if another holder has it.
    async fn try_claim(&self, member: &str, ttl: Duration) -> ExptflowResult<bool>;

    /// Remove a member and its claim. Returns whether it was present.
    async fn remove(&self, member: &str) -> ExptflowResult<bool>;
}

/// In-process due store. Share one instance between dispatchers to model
/// several processes polling the same backend.
#[derive(Debug, Default)]
pub struct InMemoryDeadlineStore {
    members: DashMap<String, Timestamp>,
    claims: InMemoryLeaseStore,
    fail_claims: AtomicBool,
}

impl InMemoryDeadlineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, member: &str) -> bool {
        self.members.contains_key(member)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn is_claimed(&self, member: &str) -> bool {
        self.claims.is_held(&deadline_claim_key(member))
    }

    /// Let a claim lapse immediately.
    pub fn expire_claim(&self, member: &str) {
        self.claims.force_expire(&deadline_claim_key(member));
    }

    /// Make every `try_claim` fail with a storage error.
    pub fn set_fail_claims(&self, fail: bool) {
        self.fail_claims.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeadlineStore for InMemoryDeadlineStore {
    async fn add(&self, member: &str, due_at: Timestamp) -> ExptflowResult<()> {
        self.members.insert(member.to_string(), due_at);
        Ok(())
    }

    async fn scan_due(&self, now: Timestamp, limit: usize) -> ExptflowResult<Vec<String>> {
        let mut due: Vec<(Timestamp, String)> = self
            .members
            .iter()
            .filter(|entry| *entry.value() <= now)
            .map(|entry| (*entry.value(), entry.key().clone()))
            .collect();
        due.sort();
        Ok(due.into_iter().take(limit).map(|(_, member)| member).collect())
    }

    async fn try_claim(&self, member: &str, ttl: Duration) -> ExptflowResult<bool> {
        if self.fail_claims.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable {
                reason: "deadline store claim failed".to_string(),
            }
            .into());
        }
        Ok(self.claims.try_acquire(&deadline_claim_key(member), ttl))
    }

    async fn remove(&self, member: &str) -> ExptflowResult<bool> {
        self.claims.drop_lease(&deadline_claim_key(member));
        Ok(self.members.remove(member).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[tokio::test]
    async fn test_scan_due_orders_and_limits() {
        let store = InMemoryDeadlineStore::new();
        let now = Utc::now();
        store.add("1:1:3", now - chrono::Duration::seconds(10)).await.unwrap();
        store.add("1:1:1", now - chrono::Duration::seconds(30)).await.unwrap();
        store.add("1:1:2", now - chrono::Duration::seconds(20)).await.unwrap();
        store.add("1:1:9", now + chrono::Duration::seconds(60)).await.unwrap();

        let due = store.scan_due(now, 2).await.unwrap();
        assert_eq!(due, vec!["1:1:1".to_string(), "1:1:2".to_string()]);

        let all_due = store.scan_due(now, 200).await.unwrap();
        assert_eq!(all_due.len(), 3);
    }

    #[tokio::test]
    async fn test_claim_excludes_second_claimant_until_expiry() {
        let store = InMemoryDeadlineStore::new();
        store.add("1:2:3", Utc::now()).await.unwrap();

        assert!(store.try_claim("1:2:3", Duration::from_secs(60)).await.unwrap());
        assert!(!store.try_claim("1:2:3", Duration::from_secs(60)).await.unwrap());

        store.expire_claim("1:2:3");
        assert!(store.try_claim("1:2:3", Duration::from_secs(60)).await.unwrap());
        assert!(store.contains("1:2:3"));
    }

    #[tokio::test]
    async fn test_remove_drops_member_and_claim() {
        let store = InMemoryDeadlineStore::new();
        store.add("1:2:3", Utc::now()).await.unwrap();
        store.try_claim("1:2:3", Duration::from_secs(60)).await.unwrap();

        assert!(store.remove("1:2:3").await.unwrap());
        assert!(!store.contains("1:2:3"));
        assert!(!store.is_claimed("1:2:3"));
        assert!(!store.remove("1:2:3").await.unwrap());
    }

    #[tokio::test]
    async fn test_claim_failure_injection() {
        let store = InMemoryDeadlineStore::new();
        store.set_fail_claims(true);
        assert!(store.try_claim("1:2:3", Duration::from_secs(60)).await.is_err());
    }
}
