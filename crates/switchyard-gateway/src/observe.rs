//! Routing observability stream.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    BotToWorker,
    WorkerToBot,
}

/// One routed message, as seen by observers.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteObservation {
    pub source: String,
    pub target: String,
    pub direction: Direction,
    /// Event kind or action name.
    pub kind: String,
    pub strategy: String,
    pub at: DateTime<Utc>,
}

/// Fan-out of [`RouteObservation`]s. Slow subscribers lag and skip.
pub struct Observer {
    tx: broadcast::Sender<RouteObservation>,
}

impl Observer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn emit(
        &self,
        source: &str,
        target: &str,
        direction: Direction,
        kind: &str,
        strategy: &str,
    ) {
        // No subscribers is the common case.
        let _ = self.tx.send(RouteObservation {
            source: source.to_string(),
            target: target.to_string(),
            direction,
            kind: kind.to_string(),
            strategy: strategy.to_string(),
            at: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouteObservation> {
        self.tx.subscribe()
    }
}

impl Default for Observer {
    fn default() -> Self {
        Self::new(256)
    }
}
