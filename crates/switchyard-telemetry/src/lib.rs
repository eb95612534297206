mod logging;
pub mod metric_names;

pub use logging::{SqliteLogLayer, SqliteLogSink};
pub use metrics_exporter_prometheus::PrometheusHandle;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::Level;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Clone, Debug)]
pub struct TelemetryConfig {
    /// Default log level. Overridden by `RUST_LOG`.
    pub log_level: Level,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
    /// Persist WARN+ records into this database when set.
    pub log_db_path: Option<PathBuf>,
    /// Install the Prometheus recorder.
    pub metrics_enabled: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            json: false,
            log_db_path: None,
            metrics_enabled: true,
        }
    }
}

impl TelemetryConfig {
    /// Lenient level parse; unknown strings fall back to INFO.
    pub fn parse_level(s: &str) -> Level {
        s.trim().parse().unwrap_or(Level::INFO)
    }
}

/// Handles kept alive for the life of the process.
pub struct TelemetryGuard {
    log_sink: Option<Arc<SqliteLogSink>>,
    prometheus: Option<PrometheusHandle>,
}

impl TelemetryGuard {
    pub fn logs(&self) -> Option<&SqliteLogSink> {
        self.log_sink.as_deref()
    }

    pub fn prometheus(&self) -> Option<PrometheusHandle> {
        self.prometheus.clone()
    }
}

/// Initialize logging and metrics. Call once at startup.
pub fn init_telemetry(config: TelemetryConfig) -> TelemetryGuard {
    let filter_str = config.log_level.to_string().to_lowercase();
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let fmt_layer = if config.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .with_span_list(true)
            .with_filter(env_filter)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_filter(env_filter)
            .boxed()
    };

    let (sqlite_layer, sqlite_sink) = match &config.log_db_path {
        Some(path) => match SqliteLogSink::new(path) {
            Ok(sink) => {
                let sink = Arc::new(sink);
                (Some(SqliteLogLayer::new(sink.clone())), Some(sink))
            }
            Err(e) => {
                eprintln!("switchyard-telemetry: failed to open log DB: {e}");
                (None, None)
            }
        },
        None => (None, None),
    };

    if let Err(e) = tracing_subscriber::registry()
        .with(fmt_layer)
        .with(sqlite_layer)
        .try_init()
    {
        eprintln!("switchyard-telemetry: subscriber already installed: {e}");
    }

    let prometheus = if config.metrics_enabled {
        match metric_names::install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                tracing::warn!(error = %e, "failed to install metrics recorder");
                None
            }
        }
    } else {
        None
    };

    TelemetryGuard {
        log_sink: sqlite_sink,
        prometheus,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_level_falls_back_to_info() {
        assert_eq!(TelemetryConfig::parse_level("debug"), Level::DEBUG);
        assert_eq!(TelemetryConfig::parse_level("WARN"), Level::WARN);
        assert_eq!(TelemetryConfig::parse_level("loud"), Level::INFO);
    }

    #[test]
    fn default_config_has_no_log_db() {
        let config = TelemetryConfig::default();
        assert!(config.log_db_path.is_none());
        assert!(config.metrics_enabled);
    }
}
