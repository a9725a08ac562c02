//! Short-lived "seen" markers that collapse duplicate event deliveries.

use ::async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use exptflow_core::ExptflowResult;
use std::time::Duration;

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn exists(&self, key: &str) -> ExptflowResult<bool>;

    async fn set(&self, key: &str, ttl: Duration) -> ExptflowResult<()>;
}

/// In-process marker store. Expired markers are dropped lazily on read.
#[derive(Debug, Default)]
pub struct InMemoryIdempotencyStore {
    markers: DashMap<String, DateTime<Utc>>,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    pub fn clear(&self) {
        self.markers.clear();
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn exists(&self, key: &str) -> ExptflowResult<bool> {
        let now = Utc::now();
        let expired = match self.markers.get(key) {
            Some(expires_at) if *expires_at > now => return Ok(true),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.markers.remove_if(key, |_, expires_at| *expires_at <= now);
        }
        Ok(false)
    }

    async fn set(&self, key: &str, ttl: Duration) -> ExptflowResult<()> {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        let expires_at = now.checked_add_signed(ttl).unwrap_or(now);
        self.markers.insert(key.to_string(), expires_at);
        Ok(())
    }
}
