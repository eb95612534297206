pub mod database;
pub mod error;
pub mod keys;
pub mod kv;
pub mod memory;
pub mod schema;
pub mod sqlite;

pub use database::Database;
pub use error::StoreError;
pub use kv::{KvStore, SharedStore};
pub use memory::MemoryKv;
pub use sqlite::SqliteKv;
