//! Settings types.
//!
//! All sections use `#[serde(rename_all = "camelCase", default)]` so a
//! partial JSON file fills the rest from compiled defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root settings object.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SwitchyardSettings {
    pub server: ServerSettings,
    pub routing: RoutingSettings,
    pub dispatch: DispatchSettings,
    pub correlation: CorrelationSettings,
    pub limits: LimitSettings,
    pub session: SessionSettings,
    pub store: StoreSettings,
    pub telemetry: TelemetrySettings,
}

/// Listener and socket lifecycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Interval between outbound pings.
    pub heartbeat_interval_ms: u64,
    /// A connection silent for this long is closed. Every inbound frame
    /// or pong pushes the deadline out again.
    pub read_timeout_ms: u64,
    /// Per-connection outbound channel depth.
    pub outbound_buffer: usize,
    /// A Worker is healthy while its last heartbeat is within this window.
    pub worker_healthy_window_ms: u64,
    /// Freshly connected Workers are healthy for this long regardless.
    pub worker_grace_ms: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            heartbeat_interval_ms: 30_000,
            read_timeout_ms: 60_000,
            outbound_buffer: 256,
            worker_healthy_window_ms: 60_000,
            worker_grace_ms: 10_000,
        }
    }
}

impl ServerSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoutingSettings {
    /// How often the dynamic rule table is reloaded from the store.
    pub reload_interval_ms: u64,
    /// Text prefix that marks an admin command.
    pub admin_prefix: String,
    /// Static rules, key (exact or `*` wildcard) to Worker id.
    pub static_rules: std::collections::BTreeMap<String, String>,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            reload_interval_ms: 10_000,
            admin_prefix: "#".to_string(),
            static_rules: std::collections::BTreeMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispatchSettings {
    /// Push events onto store queues instead of delivering directly.
    pub queue_enabled: bool,
    pub push_retries: u32,
    pub push_base_delay_ms: u64,
    /// Bounded direct-delivery attempts before the event is cached.
    pub max_delivery_attempts: u32,
    /// Capacity of the undeliverable-event cache. Oldest entries are evicted.
    pub cache_capacity: usize,
    pub pump_interval_ms: u64,
    /// Background side-effect pool size.
    pub pool_permits: usize,
    /// Cap on outstanding dispatched-event timestamps per Worker.
    pub inflight_cap: usize,
    /// Wire version used when rendering events for Workers.
    pub worker_protocol: String,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            queue_enabled: false,
            push_retries: 3,
            push_base_delay_ms: 50,
            max_delivery_attempts: 3,
            cache_capacity: 1000,
            pump_interval_ms: 200,
            pool_permits: 64,
            inflight_cap: 256,
            worker_protocol: "v11".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CorrelationSettings {
    pub timeout_ms: u64,
}

impl Default for CorrelationSettings {
    fn default() -> Self {
        Self { timeout_ms: 30_000 }
    }
}

impl CorrelationSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Idempotency and rate-limit defaults. The store hash `ratelimit:config`
/// overrides these at runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitSettings {
    /// Messages per user per window. `0` disables.
    pub user_limit: u64,
    /// Messages per group per window. `0` disables.
    pub group_limit: u64,
    pub window_secs: u64,
    pub idempotency_ttl_secs: u64,
    pub hot_cache_ttl_ms: u64,
    pub config_refresh_ms: u64,
    /// Store calls slower than this fail open.
    pub store_timeout_ms: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            user_limit: 20,
            group_limit: 100,
            window_secs: 60,
            idempotency_ttl_secs: 60,
            hot_cache_ttl_ms: 5_000,
            config_refresh_ms: 10_000,
            store_timeout_ms: 500,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub history_limit: usize,
    pub ttl_secs: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            history_limit: 5,
            ttl_secs: 1_800,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Sqlite,
}

impl std::str::FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" | "mem" => Ok(Self::Memory),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(format!("unknown store backend: {other}")),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StoreSettings {
    pub backend: StoreBackend,
    /// SQLite file, relative paths resolve under `~/.switchyard`.
    pub path: String,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            path: "switchyard.db".to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TelemetrySettings {
    pub level: String,
    pub json: bool,
    /// Persist WARN and above into the log table of this database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_db: Option<String>,
    pub metrics: bool,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            log_db: None,
            metrics: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_json_gives_defaults() {
        let s: SwitchyardSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(s.server.port, 3001);
        assert_eq!(s.correlation.timeout_ms, 30_000);
        assert_eq!(s.dispatch.cache_capacity, 1000);
        assert_eq!(s.session.history_limit, 5);
        assert_eq!(s.store.backend, StoreBackend::Memory);
    }

    #[test]
    fn json_field_names_are_camel_case() {
        let json = serde_json::to_value(SwitchyardSettings::default()).unwrap();
        assert!(json["server"]["heartbeatIntervalMs"].is_number());
        assert!(json["limits"]["idempotencyTtlSecs"].is_number());
        assert!(json["routing"]["adminPrefix"].is_string());
        assert!(json["telemetry"].get("logDb").is_none());
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let s: SwitchyardSettings =
            serde_json::from_value(serde_json::json!({"limits": {"userLimit": 3}})).unwrap();
        assert_eq!(s.limits.user_limit, 3);
        assert_eq!(s.limits.window_secs, 60);
    }

    #[test]
    fn static_rules_deserialize() {
        let s: SwitchyardSettings = serde_json::from_value(serde_json::json!({
            "routing": {"staticRules": {"user_42": "w1", "group_*": "w2"}}
        }))
        .unwrap();
        assert_eq!(s.routing.static_rules.get("user_42").map(String::as_str), Some("w1"));
    }

    #[test]
    fn store_backend_from_str() {
        assert_eq!("SQLite".parse::<StoreBackend>(), Ok(StoreBackend::Sqlite));
        assert_eq!("memory".parse::<StoreBackend>(), Ok(StoreBackend::Memory));
        assert!("redis".parse::<StoreBackend>().is_err());
    }

    #[test]
    fn durations() {
        let s = SwitchyardSettings::default();
        assert_eq!(s.server.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(s.server.read_timeout(), Duration::from_secs(60));
        assert_eq!(s.correlation.timeout(), Duration::from_secs(30));
    }
}
