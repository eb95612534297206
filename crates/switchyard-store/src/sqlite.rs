use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use crate::database::Database;
use crate::error::StoreError;
use crate::kv::{KvStore, Result};

type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// SQLite-backed [`KvStore`]. Expiry is a unix-millis column checked on read.
///
/// Every trait call runs on the blocking pool.
pub struct SqliteKv {
    db: Database,
    clock: Clock,
}

impl SqliteKv {
    pub fn new(db: Database) -> Self {
        Self {
            db,
            clock: Arc::new(|| chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn open(path: &Path) -> std::result::Result<Self, StoreError> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn in_memory() -> std::result::Result<Self, StoreError> {
        Ok(Self::new(Database::in_memory()?))
    }

    /// Replace the millisecond clock used for expiry checks.
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    fn now(&self) -> i64 {
        (self.clock)()
    }

    fn expiry(&self, ttl: Option<Duration>) -> Option<i64> {
        ttl.map(|d| self.now() + d.as_millis() as i64)
    }

    /// Delete expired strings. Reads already ignore them.
    pub async fn purge_expired(&self) -> std::result::Result<usize, StoreError> {
        let now = self.now();
        self.db
            .run_blocking(move |conn| {
                Ok(conn.execute(
                    "DELETE FROM kv_strings WHERE expires_at IS NOT NULL AND expires_at <= ?1",
                    [now],
                )?)
            })
            .await
    }
}

fn live_value(conn: &Connection, key: &str, now: i64) -> rusqlite::Result<Option<(String, Option<i64>)>> {
    conn.query_row(
        "SELECT value, expires_at FROM kv_strings
         WHERE key = ?1 AND (expires_at IS NULL OR expires_at > ?2)",
        params![key, now],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )
    .optional()
}

#[async_trait]
impl KvStore for SqliteKv {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.now();
        let key = key.to_owned();
        self.db
            .run_blocking(move |conn| Ok(live_value(conn, &key, now)?.map(|(v, _)| v)))
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let expires_at = self.expiry(ttl);
        let (key, value) = (key.to_owned(), value.to_owned());
        self.db
            .run_blocking(move |conn| {
                let _ = conn.execute(
                    "INSERT INTO kv_strings (key, value, expires_at) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_at = excluded.expires_at",
                    params![key, value, expires_at],
                )?;
                Ok(())
            })
            .await
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<bool> {
        let now = self.now();
        let expires_at = self.expiry(ttl);
        let (key, value) = (key.to_owned(), value.to_owned());
        self.db
            .run_blocking(move |conn| {
                let tx = conn.transaction()?;
                if live_value(&tx, &key, now)?.is_some() {
                    return Ok(false);
                }
                let _ = tx.execute(
                    "INSERT OR REPLACE INTO kv_strings (key, value, expires_at) VALUES (?1, ?2, ?3)",
                    params![key, value, expires_at],
                )?;
                tx.commit()?;
                Ok(true)
            })
            .await
    }

    async fn incr_window(&self, key: &str, window: Duration) -> Result<u64> {
        let now = self.now();
        let expires_at = now + window.as_millis() as i64;
        let key = key.to_owned();
        self.db
            .run_blocking(move |conn| {
                let tx = conn.transaction()?;
                let count = match live_value(&tx, &key, now)? {
                    Some((value, _)) => {
                        let next = value.parse::<u64>().unwrap_or(0) + 1;
                        let _ = tx.execute(
                            "UPDATE kv_strings SET value = ?2 WHERE key = ?1",
                            params![key, next.to_string()],
                        )?;
                        next
                    }
                    None => {
                        let _ = tx.execute(
                            "INSERT OR REPLACE INTO kv_strings (key, value, expires_at) VALUES (?1, '1', ?2)",
                            params![key, expires_at],
                        )?;
                        1
                    }
                };
                tx.commit()?;
                Ok(count)
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = key.to_owned();
        self.db
            .run_blocking(move |conn| {
                let strings = conn.execute("DELETE FROM kv_strings WHERE key = ?1", [&key])?;
                let hashes = conn.execute("DELETE FROM kv_hashes WHERE key = ?1", [&key])?;
                let queued = conn.execute("DELETE FROM kv_queues WHERE queue = ?1", [&key])?;
                Ok(strings + hashes + queued > 0)
            })
            .await
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>> {
        let key = key.to_owned();
        self.db
            .run_blocking(move |conn| {
                let mut stmt = conn.prepare("SELECT field, value FROM kv_hashes WHERE key = ?1")?;
                let rows = stmt.query_map([&key], |row| Ok((row.get(0)?, row.get(1)?)))?;
                Ok(rows.collect::<rusqlite::Result<HashMap<String, String>>>()?)
            })
            .await
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let (key, field, value) = (key.to_owned(), field.to_owned(), value.to_owned());
        self.db
            .run_blocking(move |conn| {
                let _ = conn.execute(
                    "INSERT INTO kv_hashes (key, field, value) VALUES (?1, ?2, ?3)
                     ON CONFLICT(key, field) DO UPDATE SET value = excluded.value",
                    params![key, field, value],
                )?;
                Ok(())
            })
            .await
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<bool> {
        let (key, field) = (key.to_owned(), field.to_owned());
        self.db
            .run_blocking(move |conn| {
                let n = conn.execute(
                    "DELETE FROM kv_hashes WHERE key = ?1 AND field = ?2",
                    params![key, field],
                )?;
                Ok(n > 0)
            })
            .await
    }

    async fn push(&self, queue: &str, payload: &str) -> Result<u64> {
        let (queue, payload) = (queue.to_owned(), payload.to_owned());
        self.db
            .run_blocking(move |conn| {
                let _ = conn.execute(
                    "INSERT INTO kv_queues (queue, payload) VALUES (?1, ?2)",
                    params![queue, payload],
                )?;
                let len: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM kv_queues WHERE queue = ?1",
                    [&queue],
                    |row| row.get(0),
                )?;
                Ok(len as u64)
            })
            .await
    }

    async fn pop(&self, queue: &str) -> Result<Option<String>> {
        let queue = queue.to_owned();
        self.db
            .run_blocking(move |conn| {
                let tx = conn.transaction()?;
                let head: Option<(i64, String)> = tx
                    .query_row(
                        "SELECT id, payload FROM kv_queues WHERE queue = ?1 ORDER BY id LIMIT 1",
                        [&queue],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((id, payload)) = head else {
                    return Ok(None);
                };
                let _ = tx.execute("DELETE FROM kv_queues WHERE id = ?1", [id])?;
                tx.commit()?;
                Ok(Some(payload))
            })
            .await
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        let queue = queue.to_owned();
        self.db
            .run_blocking(move |conn| {
                let len: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM kv_queues WHERE queue = ?1",
                    [&queue],
                    |row| row.get(0),
                )?;
                Ok(len as u64)
            })
            .await
    }
}
