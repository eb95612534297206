//! Settings loading with deep merge and environment variable overrides.
//!
//! Loading flow:
//! 1. Start with compiled [`SwitchyardSettings::default()`]
//! 2. If the settings file exists, deep-merge its values over defaults
//! 3. Apply `SWITCHYARD_*` environment overrides (highest priority)
//! 4. Validate
//!
//! Deep merge rules:
//! - Objects are merged recursively (source overrides target per-key)
//! - Arrays and primitives are replaced entirely by source
//! - Null values in source are skipped (preserving target)

use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::debug;

use crate::errors::{Result, SettingsError};
use crate::types::SwitchyardSettings;

pub const ENV_PREFIX: &str = "SWITCHYARD_";

/// `~/.switchyard`.
pub fn settings_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".switchyard")
}

pub fn settings_path() -> PathBuf {
    settings_dir().join("settings.json")
}

/// Resolve a possibly relative data path under [`settings_dir`].
pub fn resolve_data_path(path: &str) -> PathBuf {
    let p = Path::new(path);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        settings_dir().join(p)
    }
}

pub fn load_settings() -> Result<SwitchyardSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings from a specific path with env var overrides.
///
/// A missing file yields defaults. Invalid JSON is an error.
pub fn load_settings_from_path(path: &Path) -> Result<SwitchyardSettings> {
    let mut settings = load_file_layers(path)?;
    apply_env_overrides(&mut settings);
    validate(&settings)?;
    Ok(settings)
}

fn load_file_layers(path: &Path) -> Result<SwitchyardSettings> {
    let defaults = serde_json::to_value(SwitchyardSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    Ok(serde_json::from_value(merged)?)
}

/// Recursive deep merge of two JSON values.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = if let Some(target_val) = target_map.remove(&key) {
                    deep_merge(target_val, source_val)
                } else {
                    source_val
                };
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `SWITCHYARD_*` overrides from the process environment.
pub fn apply_env_overrides(settings: &mut SwitchyardSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply overrides from an arbitrary lookup. Out-of-range or unparsable
/// values are logged and ignored.
pub fn apply_overrides_from(
    settings: &mut SwitchyardSettings,
    lookup: impl Fn(&str) -> Option<String>,
) {
    let env = EnvReader { lookup };

    // ── Server ──────────────────────────────────────────────────────
    if let Some(v) = env.string("HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.u64("PORT", 0, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.u64("HEARTBEAT_INTERVAL_MS", 1_000, 600_000) {
        settings.server.heartbeat_interval_ms = v;
    }
    if let Some(v) = env.u64("READ_TIMEOUT_MS", 1_000, 3_600_000) {
        settings.server.read_timeout_ms = v;
    }

    // ── Routing ─────────────────────────────────────────────────────
    if let Some(v) = env.u64("ROUTING_RELOAD_MS", 100, 3_600_000) {
        settings.routing.reload_interval_ms = v;
    }
    if let Some(v) = env.string("ADMIN_PREFIX") {
        settings.routing.admin_prefix = v;
    }

    // ── Dispatch ────────────────────────────────────────────────────
    if let Some(v) = env.bool("QUEUE_ENABLED") {
        settings.dispatch.queue_enabled = v;
    }
    if let Some(v) = env.u64("CACHE_CAPACITY", 1, 1_000_000) {
        settings.dispatch.cache_capacity = v as usize;
    }
    if let Some(v) = env.u64("POOL_PERMITS", 1, 10_000) {
        settings.dispatch.pool_permits = v as usize;
    }

    // ── Correlation ─────────────────────────────────────────────────
    if let Some(v) = env.u64("CORRELATION_TIMEOUT_MS", 100, 600_000) {
        settings.correlation.timeout_ms = v;
    }

    // ── Limits ──────────────────────────────────────────────────────
    if let Some(v) = env.u64("USER_LIMIT", 0, 1_000_000) {
        settings.limits.user_limit = v;
    }
    if let Some(v) = env.u64("GROUP_LIMIT", 0, 1_000_000) {
        settings.limits.group_limit = v;
    }
    if let Some(v) = env.u64("IDEMPOTENCY_TTL_SECS", 1, 86_400) {
        settings.limits.idempotency_ttl_secs = v;
    }

    // ── Store ───────────────────────────────────────────────────────
    if let Some(v) = env.string("STORE") {
        match v.parse() {
            Ok(backend) => settings.store.backend = backend,
            Err(e) => tracing::warn!(key = "SWITCHYARD_STORE", error = %e, "ignoring env var"),
        }
    }
    if let Some(v) = env.string("STORE_PATH") {
        settings.store.path = v;
    }

    // ── Telemetry ───────────────────────────────────────────────────
    if let Some(v) = env.string("LOG_LEVEL") {
        settings.telemetry.level = v;
    }
    if let Some(v) = env.bool("LOG_JSON") {
        settings.telemetry.json = v;
    }
}

/// Reject settings that would make the gateway unusable.
pub fn validate(settings: &SwitchyardSettings) -> Result<()> {
    if settings.server.host.trim().is_empty() {
        return Err(SettingsError::InvalidValue("server.host is empty".into()));
    }
    if settings.server.read_timeout_ms <= settings.server.heartbeat_interval_ms {
        return Err(SettingsError::InvalidValue(
            "server.readTimeoutMs must exceed server.heartbeatIntervalMs".into(),
        ));
    }
    if settings.server.outbound_buffer == 0 {
        return Err(SettingsError::InvalidValue(
            "server.outboundBuffer must be > 0".into(),
        ));
    }
    if settings.dispatch.cache_capacity == 0 {
        return Err(SettingsError::InvalidValue(
            "dispatch.cacheCapacity must be > 0".into(),
        ));
    }
    if settings.dispatch.pool_permits == 0 {
        return Err(SettingsError::InvalidValue(
            "dispatch.poolPermits must be > 0".into(),
        ));
    }
    if settings.dispatch.max_delivery_attempts == 0 {
        return Err(SettingsError::InvalidValue(
            "dispatch.maxDeliveryAttempts must be > 0".into(),
        ));
    }
    if settings.limits.window_secs == 0 {
        return Err(SettingsError::InvalidValue(
            "limits.windowSecs must be > 0".into(),
        ));
    }
    Ok(())
}

// ── Pure parsing functions ──────────────────────────────────────────────────

/// Accepts (case-insensitive): `true`/`1`/`yes`/`on` or `false`/`0`/`no`/`off`.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn raw(&self, suffix: &str) -> Option<(String, String)> {
        let name = format!("{ENV_PREFIX}{suffix}");
        let val = (self.lookup)(&name)?;
        Some((name, val))
    }

    fn string(&self, suffix: &str) -> Option<String> {
        self.raw(suffix).map(|(_, v)| v).filter(|v| !v.is_empty())
    }

    fn bool(&self, suffix: &str) -> Option<bool> {
        let (name, val) = self.raw(suffix)?;
        let result = parse_bool(&val);
        if result.is_none() {
            tracing::warn!(key = %name, value = %val, "invalid boolean env var, ignoring");
        }
        result
    }

    fn u64(&self, suffix: &str, min: u64, max: u64) -> Option<u64> {
        let (name, val) = self.raw(suffix)?;
        let result = parse_u64_range(&val, min, max);
        if result.is_none() {
            tracing::warn!(key = %name, value = %val, min, max, "invalid integer env var, ignoring");
        }
        result
    }
}
