//! End-to-end tests over real WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use switchyard_gateway::{start, Gateway, ServerHandle};
use switchyard_settings::SwitchyardSettings;
use switchyard_store::MemoryKv;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn boot() -> (Arc<Gateway>, ServerHandle) {
    let mut settings = SwitchyardSettings::default();
    settings.server.host = "127.0.0.1".into();
    settings.server.port = 0;
    let gateway = Gateway::new(settings, Arc::new(MemoryKv::new()));
    let handle = start(gateway.clone(), None).await.unwrap();
    (gateway, handle)
}

async fn connect(handle: &ServerHandle, path: &str, headers: &[(&'static str, &'static str)]) -> WsStream {
    let mut req = format!("ws://{}{path}", handle.addr)
        .into_client_request()
        .unwrap();
    for &(name, value) in headers {
        let _ = req
            .headers_mut()
            .insert(name, HeaderValue::from_static(value));
    }
    let (ws, _) = timeout(TIMEOUT, connect_async(req)).await.unwrap().unwrap();
    ws
}

async fn connect_bot(handle: &ServerHandle, self_id: &'static str) -> WsStream {
    connect(handle, "/ws/bots", &[("X-Self-ID", self_id), ("X-Platform", "qq")]).await
}

async fn connect_worker(gateway: &Gateway, handle: &ServerHandle, id: &'static str) -> WsStream {
    let ws = connect(handle, "/ws/workers", &[("X-Worker-ID", id)]).await;
    wait_until(|| gateway.workers.get(id).is_some()).await;
    ws
}

async fn wait_until(mut cond: impl FnMut() -> bool) {
    timeout(TIMEOUT, async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

async fn send(ws: &mut WsStream, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

/// Next text frame as JSON, skipping control frames.
async fn recv(ws: &mut WsStream) -> Value {
    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .unwrap()
}

fn private_message(user_id: u64, text: &str) -> Value {
    json!({
        "post_type": "message",
        "message_type": "private",
        "self_id": 100,
        "user_id": user_id,
        "message": text,
        "time": 1_700_000_000,
    })
}

#[tokio::test]
async fn bot_message_reaches_worker() {
    let (gateway, handle) = boot().await;
    let mut worker = connect_worker(&gateway, &handle, "W1").await;
    let mut bot = connect_bot(&handle, "100").await;

    send(&mut bot, private_message(7, "hello there")).await;

    let event = recv(&mut worker).await;
    assert_eq!(event["post_type"], "message");
    assert_eq!(event["message"], "hello there");
    assert!(event["echo"].as_str().is_some_and(|e| !e.is_empty()));

    wait_until(|| gateway.workers.get("W1").is_some_and(|w| w.handled_count() == 1)).await;
    gateway.shutdown.shutdown();
}

#[tokio::test]
async fn worker_action_is_correlated_through_bot() {
    let (gateway, handle) = boot().await;
    let mut worker = connect_worker(&gateway, &handle, "W1").await;
    let mut bot = connect_bot(&handle, "100").await;
    wait_until(|| gateway.bots.get("100").is_some()).await;

    send(
        &mut worker,
        json!({
            "action": "send_msg",
            "params": { "message_type": "private", "user_id": 7, "message": "pong" },
            "echo": "worker-echo-1",
            "self_id": "100",
        }),
    )
    .await;

    let action = recv(&mut bot).await;
    assert_eq!(action["action"], "send_msg");
    assert_eq!(action["params"]["message"], "pong");
    let token = action["echo"].as_str().unwrap().to_string();
    assert_ne!(token, "worker-echo-1");

    send(
        &mut bot,
        json!({ "status": "ok", "retcode": 0, "data": { "message_id": 55 }, "echo": token }),
    )
    .await;

    let reply = recv(&mut worker).await;
    assert_eq!(reply["status"], "ok");
    assert_eq!(reply["echo"], "worker-echo-1");
    assert_eq!(reply["data"]["message_id"], 55);
    assert_eq!(gateway.correlation.pending_len(), 0);
    gateway.shutdown.shutdown();
}

#[tokio::test]
async fn capability_trigger_picks_registered_worker() {
    let (gateway, handle) = boot().await;
    let _plain = connect_worker(&gateway, &handle, "W1").await;
    let mut weather = connect_worker(&gateway, &handle, "W2").await;

    send(
        &mut weather,
        json!({
            "type": "register_capabilities",
            "capabilities": [{ "name": "weather", "trigger": "^weather" }],
            "metadata": { "version": "1.0" },
        }),
    )
    .await;
    wait_until(|| {
        gateway
            .workers
            .get("W2")
            .is_some_and(|w| w.capabilities().has("weather"))
    })
    .await;

    let mut bot = connect_bot(&handle, "100").await;
    send(&mut bot, private_message(8, "weather in Paris")).await;

    let event = recv(&mut weather).await;
    assert_eq!(event["message"], "weather in Paris");
    gateway.shutdown.shutdown();
}

#[tokio::test]
async fn events_cached_until_a_worker_connects() {
    let (gateway, handle) = boot().await;
    let mut bot = connect_bot(&handle, "100").await;

    send(&mut bot, private_message(9, "anyone home?")).await;
    wait_until(|| gateway.dispatcher.cache().len() == 1).await;

    let mut worker = connect_worker(&gateway, &handle, "W1").await;
    let event = recv(&mut worker).await;
    assert_eq!(event["message"], "anyone home?");
    wait_until(|| gateway.dispatcher.cache().is_empty()).await;
    gateway.shutdown.shutdown();
}

#[tokio::test]
async fn undecodable_frames_do_not_close_the_socket() {
    let (gateway, handle) = boot().await;
    let mut worker = connect_worker(&gateway, &handle, "W1").await;
    let mut bot = connect_bot(&handle, "100").await;

    bot.send(Message::Text("not json".into())).await.unwrap();
    send(&mut bot, json!({ "post_type": "mystery" })).await;
    send(&mut bot, private_message(7, "still here")).await;

    let event = recv(&mut worker).await;
    assert_eq!(event["message"], "still here");
    gateway.shutdown.shutdown();
}
