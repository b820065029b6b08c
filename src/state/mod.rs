//! State store contract: the kernel's only dependency for subscriptions,
//! leases, and scalar KV, satisfied by [`memory::InMemoryStateStore`] and,
//! behind the `redb-store` feature, [`redb_store::RedbStateStore`].

pub mod memory;
#[cfg(feature = "redb-store")]
pub mod redb_store;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;

pub use memory::InMemoryStateStore;
#[cfg(feature = "redb-store")]
pub use redb_store::RedbStateStore;

/// A time-bounded exclusive claim on processing one thread, identified by a
/// token so a stale holder cannot clobber a fresher one's release/extend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub thread_id: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// The contract the dispatcher depends on. Any implementation (in-memory,
/// redb, a distributed store) must satisfy it: atomic lease acquire/release/
/// extend, token safety, and TTL correctness on both leases and KV entries.
#[async_trait]
pub trait StateStore: Send + Sync + 'static {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;

    async fn subscribe(&self, thread_id: &str) -> Result<()>;
    async fn unsubscribe(&self, thread_id: &str) -> Result<()>;
    async fn is_subscribed(&self, thread_id: &str) -> Result<bool>;
    /// Lists subscribed thread IDs, optionally filtered to one adapter's
    /// `<adapter>:` prefix. Ordering is unspecified.
    async fn list_subscriptions(&self, adapter_name: Option<&str>) -> Result<Vec<String>>;

    /// Succeeds only if no live lease exists for `thread_id`. Returns a fresh token.
    async fn acquire_lease(&self, thread_id: &str, ttl: Duration) -> Result<Option<Lease>>;
    /// Atomic check-and-delete: releases only if the stored token matches `lease.token`.
    async fn release_lease(&self, lease: &Lease) -> Result<bool>;
    /// Atomic token-matched TTL update.
    async fn extend_lease(&self, lease: &Lease, ttl: Duration) -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>>;
    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}
