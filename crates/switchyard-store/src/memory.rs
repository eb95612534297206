use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::kv::{KvStore, Result};

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

#[derive(Default)]
struct Tables {
    strings: HashMap<String, Entry>,
    hashes: HashMap<String, HashMap<String, String>>,
    queues: HashMap<String, VecDeque<String>>,
}

/// Process-local [`KvStore`].
///
/// Expiry uses `tokio::time::Instant`, so paused-clock tests can advance
/// through TTLs. [`MemoryKv::set_available`] simulates an outage.
pub struct MemoryKv {
    tables: Mutex<Tables>,
    available: AtomicBool,
}

impl Default for MemoryKv {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryKv {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            available: AtomicBool::new(true),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    fn with_tables<T>(&self, f: impl FnOnce(&mut Tables, Instant) -> T) -> Result<T> {
        self.check()?;
        let now = Instant::now();
        let mut tables = self.tables.lock();
        Ok(f(&mut tables, now))
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_tables(|t, now| {
            let live = t.strings.get(key).map(|e| e.live(now))?;
            if !live {
                let _ = t.strings.remove(key);
                return None;
            }
            t.strings.get(key).map(|e| e.value.clone())
        })
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.with_tables(|t, now| {
            let _ = t.strings.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: ttl.map(|d| now + d),
                },
            );
        })
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        self.with_tables(|t, now| {
            if t.strings.get(key).is_some_and(|e| e.live(now)) {
                return false;
            }
            let _ = t.strings.insert(
                key.to_string(),
                Entry {
                    value: value.to_string(),
                    expires_at: ttl.map(|d| now + d),
                },
            );
            true
        })
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64> {
        self.with_tables(|t, now| {
            if let Some(entry) = t.strings.get_mut(key).filter(|e| e.live(now)) {
                let next = entry.value.parse::<u64>().unwrap_or(0) + 1;
                entry.value = next.to_string();
                return next;
            }
            let _ = t.strings.insert(
                key.to_string(),
                Entry {
                    value: "1".to_string(),
                    expires_at: Some(now + window),
                },
            );
            1
        })
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.with_tables(|t, _| {
            let s = t.strings.remove(key).is_some();
            let h = t.hashes.remove(key).is_some();
            let q = t.queues.remove(key).is_some();
            s || h || q
        })
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        self.with_tables(|t, _| t.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.with_tables(|t, _| {
            let _ = t
                .hashes
                .entry(key.to_string())
                .or_default()
                .insert(field.to_string(), value.to_string());
        })
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        self.with_tables(|t, _| {
            t.hashes
                .get_mut(key)
                .is_some_and(|h| h.remove(field).is_some())
        })
    }

    async fn push(&self, queue: &str, payload: &str) -> Result<u64> {
        self.with_tables(|t, _| {
            let q = t.queues.entry(queue.to_string()).or_default();
            q.push_back(payload.to_string());
            q.len() as u64
        })
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>> {
        self.with_tables(|t, _| t.queues.get_mut(queue).and_then(VecDeque::pop_front))
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        self.with_tables(|t, _| t.queues.get(queue).map_or(0, |q| q.len() as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ttl_follows_tokio_clock() {
        let kv = MemoryKv::new();
        kv.set("k", "v", Some(Duration::from_secs(5))).await.unwrap();
        tokio::time::advance(Duration::from_millis(4_999)).await;
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_after_expiry() {
        let kv = MemoryKv::new();
        let ttl = Some(Duration::from_secs(60));
        assert!(kv.set_nx("idem:a", "1", ttl).await.unwrap());
        assert!(!kv.set_nx("idem:a", "1", ttl).await.unwrap());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(kv.set_nx("idem:a", "1", ttl).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn incr_window_rolls_over() {
        let kv = MemoryKv::new();
        let w = Duration::from_secs(60);
        assert_eq!(kv.incr_window("rate:user:1", w).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(59)).await;
        assert_eq!(kv.incr_window("rate:user:1", w).await.unwrap(), 2);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(kv.incr_window("rate:user:1", w).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn hashes_and_queues() {
        let kv = MemoryKv::new();
        kv.hash_set("h", "a", "1").await.unwrap();
        kv.hash_set("h", "b", "2").await.unwrap();
        assert_eq!(kv.hash_get_all("h").await.unwrap().len(), 2);
        assert!(kv.hash_delete("h", "a").await.unwrap());
        assert!(!kv.hash_delete("nope", "a").await.unwrap());

        kv.push("q", "1").await.unwrap();
        kv.push("q", "2").await.unwrap();
        assert_eq!(kv.queue_len("q").await.unwrap(), 2);
        assert_eq!(kv.pop("q").await.unwrap().as_deref(), Some("1"));
        assert_eq!(kv.pop("q").await.unwrap().as_deref(), Some("2"));
        assert_eq!(kv.pop("q").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let kv = MemoryKv::new();
        kv.set_available(false);
        let err = kv.get("k").await.unwrap_err();
        assert_eq!(err.error_kind(), "unavailable");
        assert!(kv.push("q", "x").await.is_err());
        kv.set_available(true);
        assert!(kv.get("k").await.unwrap().is_none());
    }
}
