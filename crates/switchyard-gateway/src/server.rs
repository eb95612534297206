//! Axum HTTP + WebSocket front door.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use switchyard_core::ProtocolVersion;

use crate::gateway::Gateway;
use crate::health::HealthResponse;
use crate::socket::{run_bot_session, run_worker_session};

const SELF_ID_HEADER: &str = "x-self-id";
const PLATFORM_HEADER: &str = "x-platform";
const WORKER_ID_HEADER: &str = "x-worker-id";
const SUBPROTOCOL_HEADER: &str = "sec-websocket-protocol";

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    /// Present when the Prometheus recorder is installed.
    pub prometheus: Option<PrometheusHandle>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws/bots", get(bot_ws_handler))
        .route("/ws/bot", get(bot_ws_handler))
        .route("/ws/workers", get(worker_ws_handler))
        .route("/ws/worker", get(worker_ws_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Handle returned by [`start`].
pub struct ServerHandle {
    pub addr: SocketAddr,
    /// The HTTP server plus every background loop; hand these to
    /// `ShutdownCoordinator::graceful_shutdown`.
    pub tasks: Vec<JoinHandle<()>>,
}

/// Bind, start the background loops, and serve until the gateway shuts down.
pub async fn start(
    gateway: Arc<Gateway>,
    prometheus: Option<PrometheusHandle>,
) -> Result<ServerHandle, std::io::Error> {
    let addr = format!(
        "{}:{}",
        gateway.settings.server.host, gateway.settings.server.port
    );
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    let mut tasks = gateway.spawn_background();
    let router = build_router(AppState {
        gateway: gateway.clone(),
        prometheus,
    });
    let stop = gateway.shutdown.token();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(stop.cancelled_owned())
            .await
        {
            tracing::error!(error = %e, "http server stopped with error");
        }
    }));

    info!(addr = %local_addr, "switchyard gateway listening");
    Ok(ServerHandle {
        addr: local_addr,
        tasks,
    })
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Echo the client's requested subprotocol so the handshake completes.
fn accept_subprotocol(ws: WebSocketUpgrade, requested: Option<&str>) -> WebSocketUpgrade {
    match requested.and_then(|p| p.split(',').map(str::trim).find(|p| !p.is_empty())) {
        Some(p) => ws.protocols([p.to_string()]),
        None => ws,
    }
}

/// GET /ws/bots
async fn bot_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    State(state): State<AppState>,
) -> Response {
    let self_id = header(&headers, SELF_ID_HEADER)
        .map(str::to_string)
        .or_else(|| query.get("self_id").cloned())
        .unwrap_or_else(|| format!("unidentified_{}", Uuid::now_v7()));
    let platform = header(&headers, PLATFORM_HEADER)
        .map(str::to_string)
        .or_else(|| query.get("platform").cloned())
        .unwrap_or_default();
    let requested = header(&headers, SUBPROTOCOL_HEADER);
    let protocol = ProtocolVersion::from_subprotocol(requested);

    let gateway = state.gateway;
    accept_subprotocol(ws, requested)
        .on_upgrade(move |socket| run_bot_session(socket, gateway, self_id, platform, protocol))
        .into_response()
}

/// GET /ws/workers
async fn worker_ws_handler(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let worker_id = header(&headers, WORKER_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| format!("worker_{}", Uuid::now_v7()));
    let requested = header(&headers, SUBPROTOCOL_HEADER);
    let protocol = match requested {
        Some(p) => ProtocolVersion::from_subprotocol(Some(p)),
        None => state.gateway.default_worker_protocol(),
    };

    let gateway = state.gateway;
    accept_subprotocol(ws, requested)
        .on_upgrade(move |socket| run_worker_session(socket, gateway, worker_id, protocol))
        .into_response()
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.gateway.health())
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match &state.prometheus {
        Some(handle) => handle.render().into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use switchyard_settings::SwitchyardSettings;
    use switchyard_store::MemoryKv;
    use tower::ServiceExt;

    use super::*;

    fn app() -> Router {
        let gateway = Gateway::new(SwitchyardSettings::default(), Arc::new(MemoryKv::new()));
        build_router(AppState {
            gateway,
            prometheus: None,
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(resp.into_body(), 10_000).await.unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_reports_degraded_without_workers() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let parsed = body_json(resp).await;
        assert_eq!(parsed["status"], "degraded");
        assert_eq!(parsed["bots"], 0);
        assert_eq!(parsed["workers"], 0);
        assert!(parsed.get("uptime_secs").is_some());
        assert!(parsed.get("pending_correlations").is_some());
    }

    #[tokio::test]
    async fn metrics_without_recorder_is_404() {
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn plain_get_on_ws_route_is_rejected() {
        let req = Request::builder().uri("/ws/bots").body(Body::empty()).unwrap();
        let resp = app().oneshot(req).await.unwrap();
        assert!(resp.status().is_client_error());
    }

    #[tokio::test]
    async fn unknown_route_returns_404() {
        let req = Request::builder().uri("/nonexistent").body(Body::empty()).unwrap();
        let resp = app().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn header_lookup_trims_and_skips_empty() {
        let mut headers = HeaderMap::new();
        let _ = headers.insert("x-self-id", " 42 ".parse().unwrap());
        let _ = headers.insert("x-platform", "".parse().unwrap());
        assert_eq!(header(&headers, SELF_ID_HEADER), Some("42"));
        assert_eq!(header(&headers, PLATFORM_HEADER), None);
        assert_eq!(header(&headers, WORKER_ID_HEADER), None);
    }
}
