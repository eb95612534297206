//! Echo-based request/response correlation.
//!
//! Every outbound call gets a fresh token in place of the caller's echo. The
//! pending entry is removed exactly once: by the reply, by a write failure, by
//! the timeout, or when the waiter is dropped before any of those.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use switchyard_core::events::RETCODE_WRITE_FAILED;
use switchyard_core::{render_action, ActionResponse, CanonicalAction, ProtocolVersion};
use switchyard_telemetry::metric_names::{
    CORRELATION_PENDING, CORRELATION_RTT_SECONDS, CORRELATION_TIMEOUTS_TOTAL,
};

use crate::connection::Peer;

struct Pending {
    reply: oneshot::Sender<ActionResponse>,
    sent_at: Instant,
    peer: Arc<dyn Peer>,
    original_echo: Option<Value>,
}

type PendingMap = Mutex<HashMap<String, Pending>>;

fn take_from(pending: &PendingMap, token: &str) -> Option<Pending> {
    let mut pending = pending.lock();
    let entry = pending.remove(token);
    gauge!(CORRELATION_PENDING).set(pending.len() as f64);
    entry
}

/// A written request whose reply has not been awaited yet.
///
/// Dropping it releases the pending entry.
pub struct PendingCall {
    token: String,
    rx: oneshot::Receiver<ActionResponse>,
    original_echo: Option<Value>,
    target: String,
    action: String,
    pending: Arc<PendingMap>,
}

impl PendingCall {
    pub fn token(&self) -> &str {
        &self.token
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if take_from(&self.pending, &self.token).is_some() {
            debug!(peer = %self.target, action = %self.action, "waiter dropped, pending entry released");
        }
    }
}

pub struct CorrelationTracker {
    pending: Arc<PendingMap>,
    timeout: Duration,
}

impl CorrelationTracker {
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn mint_token(target: &str) -> String {
        format!("{target}|{}", Uuid::now_v7())
    }

    /// Send `action` to `peer` and wait for its reply.
    ///
    /// Always yields a response: the peer's own, or a synthetic failure for a
    /// write error or timeout. The caller's echo is restored either way.
    pub async fn send(
        &self,
        peer: Arc<dyn Peer>,
        action: CanonicalAction,
        version: ProtocolVersion,
    ) -> ActionResponse {
        match self.start(peer, action, version) {
            Ok(call) => self.wait(call).await,
            Err(failed) => failed,
        }
    }

    /// Register and write without waiting. Callers that must keep per
    /// connection write order call this inline and [`Self::wait`] elsewhere.
    pub fn start(
        &self,
        peer: Arc<dyn Peer>,
        mut action: CanonicalAction,
        version: ProtocolVersion,
    ) -> Result<PendingCall, ActionResponse> {
        let target = peer.peer_id();
        let token = Self::mint_token(&target);
        let original_echo = action.echo.take();
        action.echo = Some(Value::String(token.clone()));

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            let _ = pending.insert(
                token.clone(),
                Pending {
                    reply: tx,
                    sent_at: Instant::now(),
                    peer: peer.clone(),
                    original_echo: original_echo.clone(),
                },
            );
            gauge!(CORRELATION_PENDING).set(pending.len() as f64);
        }

        let payload = render_action(&action, version);
        if !peer.send_json(&payload) {
            let _ = self.take(&token);
            warn!(peer = %target, action = %action.action, "correlated write failed");
            return Err(ActionResponse::failed(
                RETCODE_WRITE_FAILED,
                format!("write to {target} failed"),
                original_echo,
            ));
        }

        Ok(PendingCall {
            token,
            rx,
            original_echo,
            target,
            action: action.action,
            pending: self.pending.clone(),
        })
    }

    /// Wait for the reply to a started call, or time out.
    pub async fn wait(&self, mut call: PendingCall) -> ActionResponse {
        match tokio::time::timeout(self.timeout, &mut call.rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => ActionResponse::timeout(call.original_echo.take()),
            Err(_) => {
                if self.take(&call.token).is_some() {
                    counter!(CORRELATION_TIMEOUTS_TOTAL).increment(1);
                    warn!(peer = %call.target, action = %call.action, "correlated request timed out");
                    ActionResponse::timeout(call.original_echo.take())
                } else {
                    // A reply claimed the entry while the timer fired.
                    match (&mut call.rx).await {
                        Ok(resp) => resp,
                        Err(_) => ActionResponse::timeout(call.original_echo.take()),
                    }
                }
            }
        }
    }

    fn take(&self, token: &str) -> Option<Pending> {
        take_from(&self.pending, token)
    }

    /// Deliver a reply to its waiter. Returns `false` for unknown or late tokens.
    pub fn resolve(&self, mut resp: ActionResponse) -> bool {
        let Some(token) = resp.echo.as_ref().and_then(Value::as_str).map(str::to_owned) else {
            return false;
        };
        let Some(entry) = self.take(&token) else {
            debug!(token, "reply for unknown or expired token");
            return false;
        };
        let rtt = Instant::now().saturating_duration_since(entry.sent_at);
        entry.peer.record_latency(rtt);
        histogram!(CORRELATION_RTT_SECONDS).record(rtt.as_secs_f64());

        resp.echo = entry.original_echo;
        if entry.reply.send(resp).is_err() {
            debug!(token, "waiter dropped before reply arrived");
        }
        true
    }

}
