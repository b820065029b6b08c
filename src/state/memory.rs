//! In-process state store. Backs single-instance deployments and the test
//! suite. No background sweeper: expiry is checked lazily on each read,
//! consistent with keeping state explicit rather than hiding timers.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{Lease, StateStore};
use crate::error::Result;

struct KvEntry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

struct LeaseEntry {
    token: String,
    expires_at: Instant,
}

#[derive(Default)]
pub struct InMemoryStateStore {
    kv: Mutex<HashMap<String, KvEntry>>,
    subscriptions: Mutex<HashSet<String>>,
    leases: Mutex<HashMap<String, LeaseEntry>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, thread_id: &str) -> Result<()> {
        self.subscriptions.lock().await.insert(thread_id.to_string());
        Ok(())
    }

    async fn unsubscribe(&self, thread_id: &str) -> Result<()> {
        self.subscriptions.lock().await.remove(thread_id);
        Ok(())
    }

    async fn is_subscribed(&self, thread_id: &str) -> Result<bool> {
        Ok(self.subscriptions.lock().await.contains(thread_id))
    }

    async fn list_subscriptions(&self, adapter_name: Option<&str>) -> Result<Vec<String>> {
        let subs = self.subscriptions.lock().await;
        Ok(subs
            .iter()
            .filter(|id| match adapter_name {
                Some(name) => id.starts_with(&format!("{name}:")),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn acquire_lease(&self, thread_id: &str, ttl: Duration) -> Result<Option<Lease>> {
        let mut leases = self.leases.lock().await;
        let now = Instant::now();
        if let Some(existing) = leases.get(thread_id) {
            if existing.expires_at > now {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4().to_string();
        leases.insert(
            thread_id.to_string(),
            LeaseEntry {
                token: token.clone(),
                expires_at: now + ttl,
            },
        );
        let expires_at = Utc::now()
            + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero());
        Ok(Some(Lease {
            thread_id: thread_id.to_string(),
            token,
            expires_at,
        }))
    }

    async fn release_lease(&self, lease: &Lease) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        match leases.get(&lease.thread_id) {
            Some(entry) if entry.token == lease.token => {
                leases.remove(&lease.thread_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn extend_lease(&self, lease: &Lease, ttl: Duration) -> Result<bool> {
        let mut leases = self.leases.lock().await;
        match leases.get_mut(&lease.thread_id) {
            Some(entry) if entry.token == lease.token => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let mut kv = self.kv.lock().await;
        let Some(entry) = kv.get(key) else {
            return Ok(None);
        };
        if entry.expires_at.is_some_and(|exp| exp <= Instant::now()) {
            kv.remove(key);
            return Ok(None);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        self.kv.lock().await.insert(
            key.to_string(),
            KvEntry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.kv.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn lease_acquire_is_exclusive() {
        let store = InMemoryStateStore::new();
        let first = store.acquire_lease("t1", Duration::from_secs(30)).await.unwrap();
        assert!(first.is_some());
        let second = store.acquire_lease("t1", Duration::from_secs(30)).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn stale_release_does_not_clobber_fresh_lease() {
        let store = InMemoryStateStore::new();
        let stale = store.acquire_lease("t1", Duration::from_millis(10)).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let fresh = store.acquire_lease("t1", Duration::from_secs(30)).await.unwrap().unwrap();
        let released = store.release_lease(&stale).await.unwrap();
        assert!(!released);
        let still_exclusive = store.acquire_lease("t1", Duration::from_secs(30)).await.unwrap();
        assert!(still_exclusive.is_none());
        assert!(store.release_lease(&fresh).await.unwrap());
    }

    #[tokio::test]
    async fn kv_round_trip_and_ttl_expiry() {
        let store = InMemoryStateStore::new();
        store
            .set("k", serde_json::json!("v"), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(serde_json::json!("v")));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn subscription_set_membership() {
        let store = InMemoryStateStore::new();
        assert!(!store.is_subscribed("slack:c:1").await.unwrap());
        store.subscribe("slack:c:1").await.unwrap();
        assert!(store.is_subscribed("slack:c:1").await.unwrap());
        store.unsubscribe("slack:c:1").await.unwrap();
        assert!(!store.is_subscribed("slack:c:1").await.unwrap());
    }
}
