use switchyard_core::events::{RETCODE_NO_ROUTE, RETCODE_TIMEOUT, RETCODE_WRITE_FAILED};
use switchyard_store::StoreError;

/// Errors raised inside the gateway core.
///
/// None of these are fatal; callers turn them into synthetic replies, retries,
/// or fail-open decisions.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no route for {0}")]
    NoRoute(String),

    #[error("write to {0} failed")]
    WriteFailed(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("collaborator error: {0}")]
    Collaborator(String),

    #[error("gateway is shutting down")]
    Closed,
}

impl GatewayError {
    /// Short label for metrics and structured logs.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NoRoute(_) => "no_route",
            Self::WriteFailed(_) => "write_failed",
            Self::Timeout(_) => "timeout",
            Self::Store(_) => "store",
            Self::Collaborator(_) => "collaborator",
            Self::Closed => "closed",
        }
    }

    /// Retcode used when this error becomes a synthetic action response.
    pub fn retcode(&self) -> i64 {
        match self {
            Self::NoRoute(_) => RETCODE_NO_ROUTE,
            Self::WriteFailed(_) => RETCODE_WRITE_FAILED,
            Self::Timeout(_) => RETCODE_TIMEOUT,
            _ => 1500,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
