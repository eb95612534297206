use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS gateway_logs (
        id        INTEGER PRIMARY KEY AUTOINCREMENT,
        ts        TEXT NOT NULL,
        level     TEXT NOT NULL,
        target    TEXT NOT NULL,
        message   TEXT NOT NULL,
        fields    TEXT,
        self_id   TEXT,
        worker_id TEXT
    );
    CREATE INDEX IF NOT EXISTS gateway_logs_by_level  ON gateway_logs(level);
    CREATE INDEX IF NOT EXISTS gateway_logs_by_bot    ON gateway_logs(self_id);
    CREATE INDEX IF NOT EXISTS gateway_logs_by_worker ON gateway_logs(worker_id);
";

/// SQLite sink for WARN+ records.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &LogInsert) {
        let result = self.conn.lock().execute(
            "INSERT INTO gateway_logs (ts, level, target, message, fields, self_id, worker_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.self_id,
                record.worker_id,
            ],
        );
        if let Err(e) = result {
            // Logging from inside the log layer would recurse.
            eprintln!("switchyard-telemetry: log insert failed: {e}");
        }
    }
}

struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    self_id: Option<String>,
    worker_id: Option<String>,
}

/// `tracing` layer that writes WARN+ events to a [`SqliteLogSink`].
///
/// `self_id` and `worker_id` are lifted from the event, or failing that from
/// the nearest enclosing span that recorded them.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    self_id: Option<String>,
    worker_id: Option<String>,
}

impl FieldVisitor {
    fn put(&mut self, name: &str, val: String) {
        match name {
            "message" => self.message = Some(val),
            "self_id" => self.self_id = Some(val),
            "worker_id" => self.worker_id = Some(val),
            name => {
                let _ = self
                    .fields
                    .insert(name.to_string(), serde_json::Value::String(val));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        let val = if field.name() == "message" {
            val
        } else {
            val.trim_matches('"').to_string()
        };
        self.put(field.name(), val);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        let _ = self
            .fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        let _ = self
            .fields
            .insert(field.name().to_string(), serde_json::Value::Number(value.into()));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            let _ = self
                .fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        let _ = self
            .fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if visitor.self_id.is_none() || visitor.worker_id.is_none() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    let extensions = span.extensions();
                    if let Some(fields) = extensions.get::<SpanIdentity>() {
                        if visitor.self_id.is_none() {
                            visitor.self_id.clone_from(&fields.self_id);
                        }
                        if visitor.worker_id.is_none() {
                            visitor.worker_id.clone_from(&fields.worker_id);
                        }
                    }
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            self_id: visitor.self_id,
            worker_id: visitor.worker_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        if visitor.self_id.is_some() || visitor.worker_id.is_some() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(SpanIdentity {
                    self_id: visitor.self_id,
                    worker_id: visitor.worker_id,
                });
            }
        }
    }
}

/// Connection identity carried on spans so child events inherit it.
struct SpanIdentity {
    self_id: Option<String>,
    worker_id: Option<String>,
}
