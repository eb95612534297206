//! Prometheus recorder setup and metric name constants.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Returns the handle used to render `/metrics`. Fails if a recorder is
/// already installed.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

// Connections

/// WebSocket connections accepted (counter, labels: role).
pub const WS_CONNECTIONS_TOTAL: &str = "ws_connections_total";
/// WebSocket disconnections (counter, labels: role).
pub const WS_DISCONNECTIONS_TOTAL: &str = "ws_disconnections_total";
/// Live connections (gauge, labels: role).
pub const WS_CONNECTIONS_ACTIVE: &str = "ws_connections_active";
/// Inbound frames that failed to decode (counter, labels: role, kind).
pub const DECODE_ERRORS_TOTAL: &str = "decode_errors_total";
/// Connections closed for missing the read deadline (counter, labels: role).
pub const READ_TIMEOUTS_TOTAL: &str = "read_timeouts_total";

// Routing and dispatch

/// Routing decisions (counter, labels: strategy).
pub const ROUTE_DECISIONS_TOTAL: &str = "route_decisions_total";
/// Dynamic rule reloads (counter, labels: result).
pub const ROUTING_RELOADS_TOTAL: &str = "routing_reloads_total";
/// Events delivered (counter, labels: path).
pub const EVENTS_DISPATCHED_TOTAL: &str = "events_dispatched_total";
/// Events dropped before dispatch (counter, labels: reason).
pub const EVENTS_SUPPRESSED_TOTAL: &str = "events_suppressed_total";
/// Worker writes that failed (counter).
pub const DELIVERY_FAILURES_TOTAL: &str = "delivery_failures_total";
/// Queue push retries (counter).
pub const QUEUE_PUSH_RETRIES_TOTAL: &str = "queue_push_retries_total";
/// Events parked in the undeliverable cache (counter).
pub const EVENTS_CACHED_TOTAL: &str = "events_cached_total";
/// Cached events evicted by newer ones (counter).
pub const CACHE_EVICTIONS_TOTAL: &str = "cache_evictions_total";
/// Current cache depth (gauge).
pub const CACHE_DEPTH: &str = "cache_depth";

// Correlation

/// Outstanding correlated requests (gauge).
pub const CORRELATION_PENDING: &str = "correlation_pending";
/// Correlated requests that timed out (counter).
pub const CORRELATION_TIMEOUTS_TOTAL: &str = "correlation_timeouts_total";
/// Round-trip time of correlated requests (histogram, labels: role).
pub const CORRELATION_RTT_SECONDS: &str = "correlation_rtt_seconds";

// Limiter

/// Duplicate events suppressed (counter).
pub const DUPLICATES_TOTAL: &str = "duplicates_total";
/// Events rejected by rate limits (counter, labels: scope).
pub const RATE_LIMITED_TOTAL: &str = "rate_limited_total";
/// Limiter store failures that let the event through (counter, labels: check).
pub const LIMITER_FAIL_OPEN_TOTAL: &str = "limiter_fail_open_total";

// Background pool

/// Side effects dropped because the pool was saturated (counter).
pub const POOL_DROPS_TOTAL: &str = "pool_drops_total";
