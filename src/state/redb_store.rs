//! Durable, single-process-shared backend built on `redb`.
//!
//! The spec calls out a "reference Redis implementation" using
//! `SET key value NX PX ttl` plus a check-delete/check-pexpire Lua script;
//! no crate in reach wraps a distributed store, so this repurposes the
//! embedded `redb` dependency the rest of the runtime's settings already use.
//! `redb`'s single-writer-transaction model gives atomic compare-and-set for
//! free within one process without fabricating a network dependency. A
//! genuinely distributed backend is a documented extension point behind the
//! same `StateStore` trait, not something this crate implements.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};

use super::{Lease, StateStore};
use crate::error::{Error, Result};

const KV_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("kv");
const SUBS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("subscriptions");
const LEASE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("leases");

#[derive(Serialize, Deserialize)]
struct KvRecord {
    value: serde_json::Value,
    expires_at_ms: Option<i64>,
}

#[derive(Serialize, Deserialize)]
struct LeaseRecord {
    token: String,
    expires_at_ms: i64,
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn to_err(context: &str, err: impl std::fmt::Display) -> Error {
    Error::adapter("redb", format!("{context}: {err}"))
}

pub struct RedbStateStore {
    db: Arc<Database>,
}

impl RedbStateStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = Database::create(path).map_err(|e| to_err("open", e))?;
        {
            let txn = db.begin_write().map_err(|e| to_err("begin_write", e))?;
            txn.open_table(KV_TABLE).map_err(|e| to_err("open kv table", e))?;
            txn.open_table(SUBS_TABLE).map_err(|e| to_err("open subs table", e))?;
            txn.open_table(LEASE_TABLE).map_err(|e| to_err("open lease table", e))?;
            txn.commit().map_err(|e| to_err("commit", e))?;
        }
        Ok(Self { db: Arc::new(db) })
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| to_err("join", e))?
    }
}

#[async_trait]
impl StateStore for RedbStateStore {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, thread_id: &str) -> Result<()> {
        let thread_id = thread_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(|e| to_err("begin_write", e))?;
            {
                let mut table = txn.open_table(SUBS_TABLE).map_err(|e| to_err("open", e))?;
                table
                    .insert(thread_id.as_str(), &[][..])
                    .map_err(|e| to_err("insert", e))?;
            }
            txn.commit().map_err(|e| to_err("commit", e))?;
            Ok(())
        })
        .await
    }

    async fn unsubscribe(&self, thread_id: &str) -> Result<()> {
        let thread_id = thread_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(|e| to_err("begin_write", e))?;
            {
                let mut table = txn.open_table(SUBS_TABLE).map_err(|e| to_err("open", e))?;
                table.remove(thread_id.as_str()).map_err(|e| to_err("remove", e))?;
            }
            txn.commit().map_err(|e| to_err("commit", e))?;
            Ok(())
        })
        .await
    }

    async fn is_subscribed(&self, thread_id: &str) -> Result<bool> {
        let thread_id = thread_id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(|e| to_err("begin_read", e))?;
            let table = txn.open_table(SUBS_TABLE).map_err(|e| to_err("open", e))?;
            Ok(table.get(thread_id.as_str()).map_err(|e| to_err("get", e))?.is_some())
        })
        .await
    }

    async fn list_subscriptions(&self, adapter_name: Option<&str>) -> Result<Vec<String>> {
        let prefix = adapter_name.map(|name| format!("{name}:"));
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(|e| to_err("begin_read", e))?;
            let table = txn.open_table(SUBS_TABLE).map_err(|e| to_err("open", e))?;
            let mut out = Vec::new();
            for entry in table.iter().map_err(|e| to_err("iter", e))? {
                let (key, _) = entry.map_err(|e| to_err("iter entry", e))?;
                let key = key.value().to_string();
                if prefix.as_ref().is_none_or(|p| key.starts_with(p.as_str())) {
                    out.push(key);
                }
            }
            Ok(out)
        })
        .await
    }

    async fn acquire_lease(&self, thread_id: &str, ttl: Duration) -> Result<Option<Lease>> {
        let thread_id = thread_id.to_string();
        let ttl_ms = ttl.as_millis() as i64;
        let token = uuid::Uuid::new_v4().to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(|e| to_err("begin_write", e))?;
            let acquired;
            {
                let mut table = txn.open_table(LEASE_TABLE).map_err(|e| to_err("open", e))?;
                let now = now_ms();
                let live = match table.get(thread_id.as_str()).map_err(|e| to_err("get", e))? {
                    Some(bytes) => {
                        let record: LeaseRecord =
                            serde_json::from_slice(bytes.value()).map_err(|e| to_err("decode", e))?;
                        record.expires_at_ms > now
                    }
                    None => false,
                };
                if live {
                    acquired = None;
                } else {
                    let record = LeaseRecord {
                        token: token.clone(),
                        expires_at_ms: now + ttl_ms,
                    };
                    let bytes = serde_json::to_vec(&record).map_err(|e| to_err("encode", e))?;
                    table
                        .insert(thread_id.as_str(), bytes.as_slice())
                        .map_err(|e| to_err("insert", e))?;
                    acquired = Some(DateTime::<Utc>::from_timestamp_millis(record.expires_at_ms).unwrap_or_else(Utc::now));
                }
            }
            txn.commit().map_err(|e| to_err("commit", e))?;
            Ok(acquired.map(|expires_at| Lease {
                thread_id: thread_id.clone(),
                token: token.clone(),
                expires_at,
            }))
        })
        .await
    }

    async fn release_lease(&self, lease: &Lease) -> Result<bool> {
        let thread_id = lease.thread_id.clone();
        let token = lease.token.clone();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(|e| to_err("begin_write", e))?;
            let released;
            {
                let mut table = txn.open_table(LEASE_TABLE).map_err(|e| to_err("open", e))?;
                let matches = match table.get(thread_id.as_str()).map_err(|e| to_err("get", e))? {
                    Some(bytes) => {
                        let record: LeaseRecord =
                            serde_json::from_slice(bytes.value()).map_err(|e| to_err("decode", e))?;
                        record.token == token
                    }
                    None => false,
                };
                if matches {
                    table.remove(thread_id.as_str()).map_err(|e| to_err("remove", e))?;
                }
                released = matches;
            }
            txn.commit().map_err(|e| to_err("commit", e))?;
            Ok(released)
        })
        .await
    }

    async fn extend_lease(&self, lease: &Lease, ttl: Duration) -> Result<bool> {
        let thread_id = lease.thread_id.clone();
        let token = lease.token.clone();
        let ttl_ms = ttl.as_millis() as i64;
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(|e| to_err("begin_write", e))?;
            let extended;
            {
                let mut table = txn.open_table(LEASE_TABLE).map_err(|e| to_err("open", e))?;
                let current = match table.get(thread_id.as_str()).map_err(|e| to_err("get", e))? {
                    Some(bytes) => {
                        let record: LeaseRecord =
                            serde_json::from_slice(bytes.value()).map_err(|e| to_err("decode", e))?;
                        Some(record)
                    }
                    None => None,
                };
                match current {
                    Some(record) if record.token == token => {
                        let updated = LeaseRecord {
                            token: token.clone(),
                            expires_at_ms: now_ms() + ttl_ms,
                        };
                        let bytes = serde_json::to_vec(&updated).map_err(|e| to_err("encode", e))?;
                        table
                            .insert(thread_id.as_str(), bytes.as_slice())
                            .map_err(|e| to_err("insert", e))?;
                        extended = true;
                    }
                    _ => extended = false,
                }
            }
            txn.commit().map_err(|e| to_err("commit", e))?;
            Ok(extended)
        })
        .await
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let key = key.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(|e| to_err("begin_write", e))?;
            let found;
            {
                let mut table = txn.open_table(KV_TABLE).map_err(|e| to_err("open", e))?;
                found = match table.get(key.as_str()).map_err(|e| to_err("get", e))? {
                    Some(bytes) => {
                        let record: KvRecord =
                            serde_json::from_slice(bytes.value()).map_err(|e| to_err("decode", e))?;
                        match record.expires_at_ms {
                            Some(exp) if exp <= now_ms() => {
                                drop(bytes);
                                table.remove(key.as_str()).map_err(|e| to_err("remove", e))?;
                                None
                            }
                            _ => Some(record.value),
                        }
                    }
                    None => None,
                };
            }
            txn.commit().map_err(|e| to_err("commit", e))?;
            Ok(found)
        })
        .await
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        let key = key.to_string();
        let record = KvRecord {
            value,
            expires_at_ms: ttl.map(|d| now_ms() + d.as_millis() as i64),
        };
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(|e| to_err("begin_write", e))?;
            {
                let mut table = txn.open_table(KV_TABLE).map_err(|e| to_err("open", e))?;
                let bytes = serde_json::to_vec(&record).map_err(|e| to_err("encode", e))?;
                table
                    .insert(key.as_str(), bytes.as_slice())
                    .map_err(|e| to_err("insert", e))?;
            }
            txn.commit().map_err(|e| to_err("commit", e))?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let key = key.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(|e| to_err("begin_write", e))?;
            {
                let mut table = txn.open_table(KV_TABLE).map_err(|e| to_err("open", e))?;
                table.remove(key.as_str()).map_err(|e| to_err("remove", e))?;
            }
            txn.commit().map_err(|e| to_err("commit", e))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("chatkernel-redb-test-{}.redb", uuid::Uuid::new_v4()))
    }

    #[tokio::test]
    async fn lease_acquire_is_exclusive() {
        let path = tmp_path();
        let store = RedbStateStore::open(&path).unwrap();
        let first = store.acquire_lease("t1", Duration::from_secs(30)).await.unwrap();
        assert!(first.is_some());
        let second = store.acquire_lease("t1", Duration::from_secs(30)).await.unwrap();
        assert!(second.is_none());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn kv_round_trip() {
        let path = tmp_path();
        let store = RedbStateStore::open(&path).unwrap();
        store.set("k", serde_json::json!({"a": 1}), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(serde_json::json!({"a": 1})));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        let _ = std::fs::remove_file(path);
    }
}
