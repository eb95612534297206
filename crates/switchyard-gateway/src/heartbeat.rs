//! Socket writer with periodic pings, and the reader's deadline.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::Message;
use futures::{Sink, SinkExt};
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::connection::Peer;

/// Why the writer task stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    Cancelled,
    /// Every sender for the outbound channel was dropped.
    ChannelClosed,
    SinkFailed,
}

/// Read deadline pushed forward by every inbound frame and pong.
#[derive(Debug, Clone, Copy)]
pub struct ReadDeadline {
    timeout: Duration,
    deadline: Instant,
}

impl ReadDeadline {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            deadline: Instant::now() + timeout,
        }
    }

    pub fn extend(&mut self) {
        self.deadline = Instant::now() + self.timeout;
    }

    pub fn at(&self) -> Instant {
        self.deadline
    }
}

/// Drain `rx` into `sink`, interleaving a ping every `interval`.
///
/// Runs until cancelled, the channel closes, or the sink errors. A close frame
/// is attempted on cancellation.
pub async fn run_writer<S>(
    mut sink: S,
    mut rx: mpsc::Receiver<Arc<String>>,
    interval: Duration,
    peer: Arc<dyn Peer>,
    cancel: CancellationToken,
) -> WriterExit
where
    S: Sink<Message> + Unpin,
{
    let mut ping = time::interval_at(Instant::now() + interval, interval);
    ping.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                return WriterExit::Cancelled;
            }
            msg = rx.recv() => {
                let Some(text) = msg else {
                    return WriterExit::ChannelClosed;
                };
                if sink.send(Message::Text(text.as_str().to_owned().into())).await.is_err() {
                    return WriterExit::SinkFailed;
                }
            }
            _ = ping.tick() => {
                peer.note_ping_sent();
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    return WriterExit::SinkFailed;
                }
                debug!(peer = %peer.peer_id(), "ping sent");
            }
        }
    }
}
