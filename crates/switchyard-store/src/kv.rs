use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Durable key/value operations the gateway needs: expiring strings, fixed
/// window counters, string hashes, and FIFO queues.
///
/// Expired strings are invisible to every read; backends may reclaim them
/// lazily.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Set only if absent (or expired). Returns `true` when this call wrote.
    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool>;

    /// Increment a window counter and return the new count. The expiry is
    /// set on the first increment of a window only, so later increments
    /// never extend it.
    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64>;

    /// Returns `true` if something was removed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()>;

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool>;

    /// Append to the tail of a queue; returns the new length.
    async fn push(&self, queue: &str, payload: &str) -> Result<u64>;

    /// Pop from the head of a queue.
    async fn pop(&self, queue: &str) -> Result<Option<String>>;

    async fn queue_len(&self, queue: &str) -> Result<u64>;
}

pub type SharedStore = Arc<dyn KvStore>;
