#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out")]
    Timeout,
}

impl StoreError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Database(_) => "database",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout => "timeout",
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for StoreError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        StoreError::Timeout
    }
}
