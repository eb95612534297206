use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use crate::error::StoreError;
use crate::schema;

/// Thread-safe SQLite connection wrapper.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }

        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        info!(path = %path.display(), "store database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    /// Apply pragmas, then the DDL if `user_version` is behind.
    fn init(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;

        let current: u32 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
        if current < schema::SCHEMA_VERSION {
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(schema::CREATE_TABLES)
                .map_err(|e| StoreError::Database(format!("schema: {e}")))?;
            tx.pragma_update(None, "user_version", schema::SCHEMA_VERSION)?;
            tx.commit()?;
            info!(from = current, to = schema::SCHEMA_VERSION, "store schema migrated");
        }
        Ok(())
    }

    /// Execute a closure with the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock();
        f(&mut conn)
    }

    /// Run `f` on the blocking pool so SQLite work never stalls a runtime
    /// thread.
    pub async fn run_blocking<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.clone();
        tokio::task::spawn_blocking(move || db.with_conn(f))
            .await
            .map_err(|e| StoreError::Unavailable(format!("blocking task failed: {e}")))?
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
