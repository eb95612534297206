//! Idempotency and fixed-window rate limiting.
//!
//! Every store call is time-bounded. A failed or slow store lets the event
//! through.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use metrics::counter;
use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use switchyard_core::CanonicalEvent;
use switchyard_settings::LimitSettings;
use switchyard_store::{keys, SharedStore, StoreError};
use switchyard_telemetry::metric_names::{
    DUPLICATES_TOTAL, LIMITER_FAIL_OPEN_TOTAL, RATE_LIMITED_TOTAL,
};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Duplicate,
    RateLimited {
        scope: &'static str,
        count: u64,
        limit: u64,
    },
}

/// Thresholds in effect. A limit of `0` disables that check.
#[derive(Clone, Debug, PartialEq)]
pub struct LimitConfig {
    pub user_limit: u64,
    pub group_limit: u64,
    pub idempotency_ttl: Duration,
    pub user_overrides: HashMap<String, u64>,
    pub group_overrides: HashMap<String, u64>,
}

impl LimitConfig {
    pub fn from_settings(settings: &LimitSettings) -> Self {
        Self {
            user_limit: settings.user_limit,
            group_limit: settings.group_limit,
            idempotency_ttl: Duration::from_secs(settings.idempotency_ttl_secs),
            user_overrides: HashMap::new(),
            group_overrides: HashMap::new(),
        }
    }

    /// Layer fields from the `ratelimit:config` hash. Unparseable values are
    /// skipped.
    pub fn apply_overrides(&mut self, fields: &HashMap<String, String>) {
        for (field, raw) in fields {
            let Ok(value) = raw.trim().parse::<u64>() else {
                warn!(field, value = %raw, "ignoring non-numeric limit override");
                continue;
            };
            match field.as_str() {
                "user_limit" => self.user_limit = value,
                "group_limit" => self.group_limit = value,
                "idempotency_ttl_secs" => self.idempotency_ttl = Duration::from_secs(value),
                other => {
                    if let Some(id) = other.strip_prefix("user_") {
                        let _ = self.user_overrides.insert(id.to_string(), value);
                    } else if let Some(id) = other.strip_prefix("group_") {
                        let _ = self.group_overrides.insert(id.to_string(), value);
                    }
                }
            }
        }
    }

    pub fn user_limit_for(&self, user_id: &str) -> u64 {
        self.user_overrides
            .get(user_id)
            .copied()
            .unwrap_or(self.user_limit)
    }

    pub fn group_limit_for(&self, group_id: &str) -> u64 {
        self.group_overrides
            .get(group_id)
            .copied()
            .unwrap_or(self.group_limit)
    }
}

pub struct Limiter {
    store: SharedStore,
    base: LimitConfig,
    config: RwLock<Arc<LimitConfig>>,
    hot: DashMap<String, Instant>,
    hot_ttl: Duration,
    window: Duration,
    store_timeout: Duration,
    refresh_interval: Duration,
}

impl Limiter {
    pub fn new(store: SharedStore, settings: &LimitSettings) -> Self {
        let base = LimitConfig::from_settings(settings);
        Self {
            store,
            config: RwLock::new(Arc::new(base.clone())),
            base,
            hot: DashMap::new(),
            hot_ttl: Duration::from_millis(settings.hot_cache_ttl_ms),
            window: Duration::from_secs(settings.window_secs.max(1)),
            store_timeout: Duration::from_millis(settings.store_timeout_ms.max(1)),
            refresh_interval: Duration::from_millis(settings.config_refresh_ms.max(1)),
        }
    }

    pub fn config(&self) -> Arc<LimitConfig> {
        self.config.read().clone()
    }

    pub async fn check(&self, event: &CanonicalEvent) -> Verdict {
        let cfg = self.config();

        if let Some(identity) = event.message_identity() {
            if self.is_duplicate(&identity, &cfg).await {
                counter!(DUPLICATES_TOTAL).increment(1);
                debug!(identity, "duplicate event suppressed");
                return Verdict::Duplicate;
            }
        }

        if !event.user_id.is_empty() {
            let limit = cfg.user_limit_for(&event.user_id);
            if let Some(verdict) = self
                .count_window("user", &keys::rate_user(&event.user_id), limit)
                .await
            {
                return verdict;
            }
        }

        if !event.group_id.is_empty() {
            let limit = cfg.group_limit_for(&event.group_id);
            if let Some(verdict) = self
                .count_window("group", &keys::rate_group(&event.group_id), limit)
                .await
            {
                return verdict;
            }
        }

        Verdict::Allow
    }

    async fn is_duplicate(&self, identity: &str, cfg: &LimitConfig) -> bool {
        if cfg.idempotency_ttl.is_zero() {
            return false;
        }
        let now = Instant::now();
        let hot_hit = self.hot.get(identity).is_some_and(|exp| *exp > now);
        if hot_hit {
            return true;
        }
        let _ = self.hot.insert(identity.to_string(), now + self.hot_ttl);

        let key = keys::idempotency(identity);
        let fresh = self
            .bounded("idempotency", self.store.set_nx(&key, "1", Some(cfg.idempotency_ttl)))
            .await;
        matches!(fresh, Some(false))
    }

    async fn count_window(&self, scope: &'static str, key: &str, limit: u64) -> Option<Verdict> {
        if limit == 0 {
            return None;
        }
        let count = self
            .bounded(scope, self.store.incr_window(key, self.window))
            .await?;
        if count > limit {
            counter!(RATE_LIMITED_TOTAL, "scope" => scope).increment(1);
            debug!(key, count, limit, "rate limited");
            return Some(Verdict::RateLimited {
                scope,
                count,
                limit,
            });
        }
        None
    }

    async fn bounded<T>(
        &self,
        check: &'static str,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Option<T> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(e)) => {
                counter!(LIMITER_FAIL_OPEN_TOTAL, "check" => check).increment(1);
                warn!(check, error = %e, "limiter store call failed, allowing event");
                None
            }
            Err(_) => {
                counter!(LIMITER_FAIL_OPEN_TOTAL, "check" => check).increment(1);
                warn!(check, "limiter store call timed out, allowing event");
                None
            }
        }
    }

    /// Reload thresholds from the store. A failure keeps the current config.
    pub async fn refresh_config(&self) -> bool {
        let Some(fields) = self
            .bounded("config", self.store.hash_get_all(keys::RATELIMIT_CONFIG))
            .await
        else {
            return false;
        };
        let mut next = self.base.clone();
        next.apply_overrides(&fields);
        *self.config.write() = Arc::new(next);
        true
    }

    fn prune_hot_cache(&self) {
        let now = Instant::now();
        self.hot.retain(|_, exp| *exp > now);
    }

    pub async fn run_refresh_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.refresh_interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let _ = self.refresh_config().await;
                    self.prune_hot_cache();
                }
            }
        }
    }
}
