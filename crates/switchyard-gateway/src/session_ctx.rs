//! Per-user rolling conversation context.
//!
//! The local cache is authoritative for this process (last write wins).
//! Writes are persisted in the background through the task pool; reads fall
//! through to the store on a cache miss. Every store call is time-bounded, and
//! a slow or failed read is treated as a miss.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use switchyard_core::CanonicalEvent;
use switchyard_store::{keys, SharedStore, StoreError};

use crate::pool::TaskPool;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HistoryEntry {
    pub kind: String,
    pub text: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message_id: String,
    pub time: i64,
}

impl HistoryEntry {
    fn from_event(event: &CanonicalEvent) -> Self {
        Self {
            kind: event.kind.as_str().to_string(),
            text: event.text.clone(),
            group_id: event.group_id.clone(),
            message_id: event.message_id.clone(),
            time: event.time,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionContext {
    pub platform: String,
    pub user_id: String,
    pub history: Vec<HistoryEntry>,
    pub state: Map<String, Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

struct Cached {
    ctx: SessionContext,
    expires_at: Instant,
}

pub struct SessionStore {
    store: SharedStore,
    pool: TaskPool,
    cache: RwLock<HashMap<(String, String), Cached>>,
    history_limit: usize,
    ttl: Duration,
    store_timeout: Duration,
}

impl SessionStore {
    pub fn new(
        store: SharedStore,
        pool: TaskPool,
        history_limit: usize,
        ttl: Duration,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            pool,
            cache: RwLock::new(HashMap::new()),
            history_limit: history_limit.max(1),
            ttl,
            store_timeout: store_timeout.max(Duration::from_millis(1)),
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.store_timeout, fut).await?
    }

    fn cache_key(platform: &str, user_id: &str) -> (String, String) {
        (platform.to_string(), user_id.to_string())
    }

    fn cached(&self, platform: &str, user_id: &str) -> Option<SessionContext> {
        let now = Instant::now();
        let cache = self.cache.read();
        cache
            .get(&Self::cache_key(platform, user_id))
            .filter(|c| c.expires_at > now)
            .map(|c| c.ctx.clone())
    }

    /// Local cache first, then the store. A store hit hydrates the cache.
    pub async fn get(&self, platform: &str, user_id: &str) -> Option<SessionContext> {
        if let Some(ctx) = self.cached(platform, user_id) {
            return Some(ctx);
        }
        let raw = match self.bounded(self.store.get(&keys::session(platform, user_id))).await {
            Ok(raw) => raw?,
            Err(e) => {
                warn!(platform, user_id, error = %e, "session read-through failed");
                return None;
            }
        };
        let ctx: SessionContext = match serde_json::from_str(&raw) {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(platform, user_id, error = %e, "discarding unreadable session");
                return None;
            }
        };
        let key = Self::cache_key(platform, user_id);
        let now = Instant::now();
        let mut cache = self.cache.write();
        // A concurrent update may have landed while the store was read.
        if let Some(live) = cache.get(&key).filter(|c| c.expires_at > now) {
            return Some(live.ctx.clone());
        }
        let _ = cache.insert(
            key,
            Cached {
                ctx: ctx.clone(),
                expires_at: now + self.ttl,
            },
        );
        Some(ctx)
    }

    /// Append `event` to the user's history and refresh the TTL.
    pub async fn update(
        &self,
        platform: &str,
        user_id: &str,
        event: &CanonicalEvent,
    ) -> SessionContext {
        let existing = self.get(platform, user_id).await;

        let ctx = {
            let mut cache = self.cache.write();
            let now = Instant::now();
            let slot = cache
                .entry(Self::cache_key(platform, user_id))
                .or_insert_with(|| Cached {
                    ctx: existing.unwrap_or_else(|| SessionContext {
                        platform: platform.to_string(),
                        user_id: user_id.to_string(),
                        ..Default::default()
                    }),
                    expires_at: now + self.ttl,
                });
            if slot.expires_at <= now {
                slot.ctx.history.clear();
                slot.ctx.state.clear();
            }
            slot.ctx.history.push(HistoryEntry::from_event(event));
            let overflow = slot.ctx.history.len().saturating_sub(self.history_limit);
            let _ = slot.ctx.history.drain(..overflow);
            slot.ctx.updated_at = Some(Utc::now());
            slot.expires_at = now + self.ttl;
            slot.ctx.clone()
        };

        self.persist(&ctx);
        ctx
    }

    fn persist(&self, ctx: &SessionContext) {
        let json = match serde_json::to_string(ctx) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "session serialization failed");
                return;
            }
        };
        let key = keys::session(&ctx.platform, &ctx.user_id);
        let store = self.store.clone();
        let ttl = self.ttl;
        let limit = self.store_timeout;
        let spawned = self.pool.spawn("session_persist", {
            let key = key.clone();
            async move {
                match tokio::time::timeout(limit, store.set(&key, &json, Some(ttl))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!(key, error = %e, "session persist failed"),
                    Err(_) => warn!(key, "session persist timed out"),
                }
            }
        });
        if !spawned {
            error!(key, "session persist dropped, background pool saturated");
        }
    }

    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut cache = self.cache.write();
        let before = cache.len();
        cache.retain(|_, c| c.expires_at > now);
        let pruned = before - cache.len();
        if pruned > 0 {
            debug!(pruned, "expired sessions pruned");
        }
        pruned
    }

    pub fn len(&self) -> usize {
        self.cache.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.read().is_empty()
    }

    // Transient flags, each with its own caller-chosen TTL.

    pub async fn set_state(
        &self,
        platform: &str,
        user_id: &str,
        key: &str,
        value: &Value,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let json = serde_json::to_string(value)?;
        let key = keys::session_state(platform, user_id, key);
        self.bounded(self.store.set(&key, &json, Some(ttl))).await
    }

    pub async fn get_state(
        &self,
        platform: &str,
        user_id: &str,
        key: &str,
    ) -> Result<Option<Value>, StoreError> {
        let key = keys::session_state(platform, user_id, key);
        let raw = self.bounded(self.store.get(&key)).await?;
        raw.map(|r| serde_json::from_str(&r).map_err(StoreError::from))
            .transpose()
    }

    pub async fn clear_state(&self, platform: &str, user_id: &str, key: &str) -> Result<bool, StoreError> {
        let key = keys::session_state(platform, user_id, key);
        self.bounded(self.store.delete(&key)).await
    }
}
