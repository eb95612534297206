//! Shutdown signalling for background loops and connection tasks.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Owns the root token every loop and socket session derives from.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Token cancelled with the root but also cancellable on its own, for a
    /// single connection.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel everything, then wait up to `timeout` for `handles` to finish.
    pub async fn graceful_shutdown(&self, handles: Vec<JoinHandle<()>>, timeout: Option<Duration>) {
        let timeout = timeout.unwrap_or(DEFAULT_DRAIN_TIMEOUT);
        self.shutdown();
        info!(tasks = handles.len(), timeout_secs = timeout.as_secs(), "draining gateway tasks");

        if tokio::time::timeout(timeout, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!(?timeout, "shutdown drain timed out, abandoning remaining tasks");
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
