//! Per-connection lifecycles for Bot and Worker sockets, from upgrade
//! through teardown.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use metrics::{counter, gauge, histogram};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use switchyard_core::{BotFrame, BotIdentity, ProtocolVersion};
use switchyard_telemetry::metric_names::{
    DECODE_ERRORS_TOTAL, READ_TIMEOUTS_TOTAL, WS_CONNECTIONS_ACTIVE, WS_CONNECTIONS_TOTAL,
    WS_DISCONNECTIONS_TOTAL,
};

use crate::connection::{BotConnection, Peer, WorkerConnection};
use crate::gateway::Gateway;
use crate::heartbeat::{run_writer, ReadDeadline};

/// What one inbound socket frame amounts to.
enum Inbound {
    Text(String),
    Pong,
    Skip,
    Close,
}

fn classify(msg: Message, role: &'static str) -> Inbound {
    match msg {
        Message::Text(t) => Inbound::Text(t.to_string()),
        Message::Binary(data) => match std::str::from_utf8(&data) {
            Ok(s) => Inbound::Text(s.to_string()),
            Err(_) => {
                counter!(DECODE_ERRORS_TOTAL, "role" => role, "kind" => "utf8").increment(1);
                Inbound::Skip
            }
        },
        Message::Pong(_) => Inbound::Pong,
        // axum answers pings itself.
        Message::Ping(_) => Inbound::Skip,
        Message::Close(_) => Inbound::Close,
    }
}

fn connected(role: &'static str) -> std::time::Instant {
    counter!(WS_CONNECTIONS_TOTAL, "role" => role).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE, "role" => role).increment(1.0);
    std::time::Instant::now()
}

fn disconnected(role: &'static str, started: std::time::Instant) {
    counter!(WS_DISCONNECTIONS_TOTAL, "role" => role).increment(1);
    gauge!(WS_CONNECTIONS_ACTIVE, "role" => role).decrement(1.0);
    histogram!("ws_connection_duration_seconds", "role" => role)
        .record(started.elapsed().as_secs_f64());
}

/// Run one Bot connection until it closes, times out, or the gateway stops.
#[instrument(skip_all, fields(self_id = %self_id, platform = %platform))]
pub async fn run_bot_session(
    ws: WebSocket,
    gateway: Arc<Gateway>,
    self_id: String,
    platform: String,
    protocol: ProtocolVersion,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::channel(gateway.settings.server.outbound_buffer.max(1));
    let bot = Arc::new(BotConnection::new(self_id, platform, protocol, tx));
    let _ = gateway.bots.register(bot.clone());

    let started = connected("bot");
    info!(conn_id = %bot.conn_id, protocol = protocol.as_str(), "bot connected");

    let cancel = gateway.shutdown.child_token();
    let writer = tokio::spawn(run_writer(
        ws_tx,
        rx,
        gateway.settings.server.heartbeat_interval(),
        bot.clone() as Arc<dyn Peer>,
        cancel.clone(),
    ));

    let mut deadline = ReadDeadline::new(gateway.settings.server.read_timeout());
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = tokio::time::timeout_at(deadline.at(), ws_rx.next()) => next,
        };
        let msg = match next {
            Err(_) => {
                counter!(READ_TIMEOUTS_TOTAL, "role" => "bot").increment(1);
                warn!(self_id = %bot.self_id(), "bot read deadline missed, closing");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(msg))) => msg,
        };
        deadline.extend();

        let text = match classify(msg, "bot") {
            Inbound::Text(text) => text,
            Inbound::Pong => {
                bot.on_pong();
                continue;
            }
            Inbound::Skip => {
                bot.touch();
                continue;
            }
            Inbound::Close => {
                debug!("bot sent close frame");
                break;
            }
        };
        bot.touch();

        let self_id = bot.self_id();
        let identity = BotIdentity {
            platform: &bot.platform,
            self_id: &self_id,
        };
        match gateway.normalizer.decode_bot(&text, bot.protocol, &identity) {
            Ok(BotFrame::Event(event)) => {
                let outcome = gateway.handle_bot_event(&bot, event).await;
                debug!(?outcome, "bot event handled");
            }
            Ok(BotFrame::Response(resp)) => gateway.handle_bot_response(resp),
            Err(e) => {
                counter!(DECODE_ERRORS_TOTAL, "role" => "bot", "kind" => e.error_kind()).increment(1);
                warn!(error = %e, "undecodable bot frame dropped");
            }
        }
    }

    cancel.cancel();
    let _ = gateway.bots.remove(&bot.self_id(), &bot.conn_id);
    if let Ok(exit) = writer.await {
        debug!(?exit, "bot writer stopped");
    }
    disconnected("bot", started);
    info!(
        self_id = %bot.self_id(),
        sent = bot.sent_count(),
        received = bot.received_count(),
        "bot disconnected"
    );
}

/// Run one Worker connection until it closes, times out, or the gateway stops.
#[instrument(skip_all, fields(worker_id = %worker_id))]
pub async fn run_worker_session(
    ws: WebSocket,
    gateway: Arc<Gateway>,
    worker_id: String,
    protocol: ProtocolVersion,
) {
    let (ws_tx, mut ws_rx) = ws.split();
    let (tx, rx) = mpsc::channel(gateway.settings.server.outbound_buffer.max(1));
    let worker = Arc::new(WorkerConnection::new(
        worker_id,
        protocol,
        tx,
        gateway.settings.dispatch.inflight_cap,
    ));
    let _ = gateway.workers.register(worker.clone());

    let started = connected("worker");
    info!(conn_id = %worker.conn_id, protocol = protocol.as_str(), "worker connected");

    let cancel = gateway.shutdown.child_token();
    let writer = tokio::spawn(run_writer(
        ws_tx,
        rx,
        gateway.settings.server.heartbeat_interval(),
        worker.clone() as Arc<dyn Peer>,
        cancel.clone(),
    ));

    gateway.on_worker_connected(&worker).await;

    let mut deadline = ReadDeadline::new(gateway.settings.server.read_timeout());
    loop {
        let next = tokio::select! {
            () = cancel.cancelled() => break,
            next = tokio::time::timeout_at(deadline.at(), ws_rx.next()) => next,
        };
        let msg = match next {
            Err(_) => {
                counter!(READ_TIMEOUTS_TOTAL, "role" => "worker").increment(1);
                warn!("worker read deadline missed, closing");
                break;
            }
            Ok(None) | Ok(Some(Err(_))) => break,
            Ok(Some(Ok(msg))) => msg,
        };
        deadline.extend();

        let text = match classify(msg, "worker") {
            Inbound::Text(text) => text,
            Inbound::Pong => {
                worker.on_pong();
                continue;
            }
            Inbound::Skip => {
                worker.touch();
                continue;
            }
            Inbound::Close => {
                debug!("worker sent close frame");
                break;
            }
        };
        worker.touch();

        match gateway.normalizer.decode_worker(&text) {
            Ok(frame) => gateway.handle_worker_frame(&worker, frame),
            Err(e) => {
                counter!(DECODE_ERRORS_TOTAL, "role" => "worker", "kind" => e.error_kind()).increment(1);
                warn!(error = %e, "undecodable worker frame dropped");
            }
        }
    }

    cancel.cancel();
    let _ = gateway.workers.remove(&worker.worker_id, &worker.conn_id);
    if let Ok(exit) = writer.await {
        debug!(?exit, "worker writer stopped");
    }
    disconnected("worker", started);
    info!(
        worker_id = %worker.worker_id,
        handled = worker.handled_count(),
        sent = worker.sent_count(),
        "worker disconnected"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_utf8_is_text() {
        let inbound = classify(Message::Binary(b"{\"a\":1}".to_vec().into()), "bot");
        assert!(matches!(inbound, Inbound::Text(ref s) if s == "{\"a\":1}"));
    }

    #[test]
    fn binary_garbage_is_skipped() {
        let inbound = classify(Message::Binary(vec![0xff, 0xfe].into()), "worker");
        assert!(matches!(inbound, Inbound::Skip));
    }

    #[test]
    fn control_frames() {
        assert!(matches!(classify(Message::Pong(Vec::new().into()), "bot"), Inbound::Pong));
        assert!(matches!(classify(Message::Ping(Vec::new().into()), "bot"), Inbound::Skip));
        assert!(matches!(classify(Message::Close(None), "bot"), Inbound::Close));
    }
}
