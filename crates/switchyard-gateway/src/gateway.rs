//! The gateway: every component wired together, plus the inbound pipelines.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use serde_json::{json, Value};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use switchyard_core::events::RETCODE_NO_ROUTE;
use switchyard_core::{
    render_action, ActionResponse, CanonicalAction, CanonicalEvent, CapabilityRegistration,
    EventKind, Normalizer, ProtocolVersion, RequestScope, WorkerFrame,
};
use switchyard_settings::SwitchyardSettings;
use switchyard_store::{keys, SharedStore};
use switchyard_telemetry::metric_names::EVENTS_SUPPRESSED_TOTAL;

use crate::collaborators::{Collaborators, DispatchContext, EmployeeIdentity};
use crate::connection::{BotConnection, HealthPolicy, Peer, WorkerConnection};
use crate::correlation::CorrelationTracker;
use crate::dispatch::{DispatchOutcome, Dispatcher};
use crate::errors::GatewayError;
use crate::health::{health_check, HealthCounts, HealthResponse};
use crate::limiter::{Limiter, Verdict};
use crate::observe::{Direction, Observer};
use crate::pool::TaskPool;
use crate::registry::{BotRegistry, Rekey, WorkerRegistry};
use crate::routing::{RoutingResolver, RuleTable};
use crate::session_ctx::SessionStore;
use crate::shutdown::ShutdownCoordinator;

/// What happened to one inbound Bot event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Meta events only refresh liveness.
    Ignored,
    Duplicate,
    RateLimited,
    Rejected { reason: String },
    EmployeeReplied,
    Suppressed,
    Dispatched(DispatchOutcome),
}

pub struct Gateway {
    pub settings: SwitchyardSettings,
    pub normalizer: Normalizer,
    pub bots: Arc<BotRegistry>,
    pub workers: Arc<WorkerRegistry>,
    pub store: SharedStore,
    pub resolver: Arc<RoutingResolver>,
    pub dispatcher: Arc<Dispatcher>,
    pub correlation: Arc<CorrelationTracker>,
    pub limiter: Arc<Limiter>,
    pub sessions: Arc<SessionStore>,
    pub observer: Arc<Observer>,
    pub pool: TaskPool,
    pub collaborators: Collaborators,
    pub shutdown: ShutdownCoordinator,
    started_at: std::time::Instant,
    store_timeout: Duration,
}

impl Gateway {
    pub fn new(settings: SwitchyardSettings, store: SharedStore) -> Arc<Self> {
        Self::with_collaborators(settings, store, Collaborators::default())
    }

    pub fn with_collaborators(
        settings: SwitchyardSettings,
        store: SharedStore,
        collaborators: Collaborators,
    ) -> Arc<Self> {
        let policy = HealthPolicy {
            window: Duration::from_millis(settings.server.worker_healthy_window_ms),
            grace: Duration::from_millis(settings.server.worker_grace_ms),
        };
        let bots = Arc::new(BotRegistry::new());
        let workers = Arc::new(WorkerRegistry::new(policy));
        let pool = TaskPool::new(settings.dispatch.pool_permits);
        let observer = Arc::new(Observer::default());
        let store_timeout = Duration::from_millis(settings.limits.store_timeout_ms.max(1));

        let resolver = Arc::new(RoutingResolver::new(
            workers.clone(),
            bots.clone(),
            store.clone(),
            RuleTable::from_rules(&settings.routing.static_rules),
            Duration::from_millis(settings.routing.reload_interval_ms.max(1)),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            workers.clone(),
            resolver.clone(),
            store.clone(),
            pool.clone(),
            observer.clone(),
            settings.dispatch.clone(),
            store_timeout,
        ));
        let sessions = Arc::new(SessionStore::new(
            store.clone(),
            pool.clone(),
            settings.session.history_limit,
            Duration::from_secs(settings.session.ttl_secs),
            store_timeout,
        ));

        Arc::new(Self {
            normalizer: Normalizer::new(settings.routing.admin_prefix.clone()),
            correlation: Arc::new(CorrelationTracker::new(settings.correlation.timeout())),
            limiter: Arc::new(Limiter::new(store.clone(), &settings.limits)),
            bots,
            workers,
            store,
            resolver,
            dispatcher,
            sessions,
            observer,
            pool,
            collaborators,
            shutdown: ShutdownCoordinator::new(),
            started_at: std::time::Instant::now(),
            store_timeout,
            settings,
        })
    }

    /// Wire version for a Worker that did not ask for one.
    pub fn default_worker_protocol(&self) -> ProtocolVersion {
        ProtocolVersion::parse(&self.settings.dispatch.worker_protocol)
    }

    pub fn health(&self) -> HealthResponse {
        health_check(
            self.started_at,
            HealthCounts {
                bots: self.bots.len(),
                workers: self.workers.len(),
                healthy_workers: self.workers.list_healthy().len(),
                pending_correlations: self.correlation.pending_len(),
                cached_events: self.dispatcher.cache().len(),
            },
        )
    }

    // ── Bot side ────────────────────────────────────────────────────────────

    /// Run one Bot event through admission and into dispatch.
    #[instrument(skip_all, fields(self_id = %bot.self_id(), kind = event.kind.as_str()))]
    pub async fn handle_bot_event(
        &self,
        bot: &Arc<BotConnection>,
        mut event: CanonicalEvent,
    ) -> PipelineOutcome {
        let current = bot.self_id();
        if event.self_id.is_empty() {
            event.self_id = current;
        } else if event.self_id != current
            && self.bots.rekey(&current, &event.self_id) == Rekey::Taken
        {
            // Keep replies flowing to this connection, not the live holder.
            event.self_id = current;
        }
        if event.platform.is_empty() {
            event.platform = bot.platform.clone();
        }

        if event.kind == EventKind::Meta {
            return PipelineOutcome::Ignored;
        }

        if event.is_group() {
            self.bots.note_group(&event.group_id, &event.self_id);
        }

        match self.limiter.check(&event).await {
            Verdict::Allow => {}
            Verdict::Duplicate => {
                counter!(EVENTS_SUPPRESSED_TOTAL, "reason" => "duplicate").increment(1);
                return PipelineOutcome::Duplicate;
            }
            Verdict::RateLimited { scope, .. } => {
                counter!(EVENTS_SUPPRESSED_TOTAL, "reason" => "rate_limited").increment(1);
                debug!(scope, user_id = %event.user_id, "event rate limited");
                return PipelineOutcome::RateLimited;
            }
        }

        let scope = RequestScope::from_event(&event);

        match self.collaborators.admission.process_message(&event, &scope).await {
            Ok(admission) if !admission.allowed => {
                if admission.is_system_closed() && event.is_admin_command() {
                    debug!(request_id = %scope.request_id, "system closed, admitting admin command");
                } else {
                    counter!(EVENTS_SUPPRESSED_TOTAL, "reason" => "rejected").increment(1);
                    return PipelineOutcome::Rejected {
                        reason: admission.reason,
                    };
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!(request_id = %scope.request_id, error = %e, "admission check failed, admitting");
            }
        }

        let session = if event.user_id.is_empty() {
            None
        } else {
            Some(
                self.sessions
                    .update(&event.platform, &event.user_id, &event)
                    .await,
            )
        };

        if event.is_message() {
            let who = EmployeeIdentity::from_scope(&scope);
            match self.collaborators.employee.chat_with_employee(&who, &event).await {
                Ok(Some(reply)) if !reply.trim().is_empty() => {
                    self.reply_to_bot(bot, &event, &reply);
                    return PipelineOutcome::EmployeeReplied;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(request_id = %scope.request_id, error = %e, "employee responder failed");
                }
            }
        }

        let _ = event.ensure_echo();
        let route = self.resolver.resolve(&event);
        let ctx = DispatchContext {
            event: &event,
            scope: &scope,
            session: session.as_ref(),
            route: &route,
        };
        if !self.collaborators.interceptor.process_before_dispatch(&ctx).await {
            counter!(EVENTS_SUPPRESSED_TOTAL, "reason" => "intercepted").increment(1);
            return PipelineOutcome::Suppressed;
        }

        PipelineOutcome::Dispatched(self.dispatcher.dispatch_routed(event, route).await)
    }

    fn reply_to_bot(&self, bot: &BotConnection, event: &CanonicalEvent, text: &str) {
        let params = if event.is_group() {
            json!({ "message_type": "group", "group_id": event.group_id, "message": text })
        } else {
            json!({ "message_type": "private", "user_id": event.user_id, "message": text })
        };
        let action = CanonicalAction {
            action: "send_msg".into(),
            params,
            self_id: event.self_id.clone(),
            platform: event.platform.clone(),
            ..Default::default()
        };
        if !bot.send_json(&render_action(&action, bot.protocol)) {
            warn!(self_id = %event.self_id, "employee reply could not be written");
        }
    }

    pub fn handle_bot_response(&self, resp: ActionResponse) {
        if !self.correlation.resolve(resp) {
            debug!("bot response matched no pending request");
        }
    }

    // ── Worker side ─────────────────────────────────────────────────────────

    /// Restore a capability snapshot if needed, then flush parked events.
    pub async fn on_worker_connected(&self, worker: &Arc<WorkerConnection>) {
        if worker.capabilities().is_empty() {
            self.restore_capabilities(worker).await;
        }
        let flushed = self.dispatcher.flush_cache().await;
        if flushed > 0 {
            info!(worker_id = %worker.worker_id, flushed, "cached events delivered");
        }
    }

    async fn restore_capabilities(&self, worker: &WorkerConnection) {
        let key = keys::worker_caps(&worker.worker_id);
        let raw = match tokio::time::timeout(self.store_timeout, self.store.get(&key)).await {
            Ok(Ok(Some(raw))) => raw,
            Ok(Ok(None)) => return,
            Ok(Err(e)) => {
                warn!(worker_id = %worker.worker_id, error = %e, "capability snapshot read failed");
                return;
            }
            Err(_) => {
                warn!(worker_id = %worker.worker_id, "capability snapshot read timed out");
                return;
            }
        };
        match serde_json::from_str::<CapabilityRegistration>(&raw) {
            Ok(reg) => {
                let restored = worker.set_capabilities(reg);
                info!(
                    worker_id = %worker.worker_id,
                    capabilities = restored.registration.capabilities.len(),
                    "capabilities restored from snapshot"
                );
            }
            Err(e) => warn!(worker_id = %worker.worker_id, error = %e, "capability snapshot unreadable"),
        }
    }

    pub fn handle_worker_frame(&self, worker: &Arc<WorkerConnection>, frame: WorkerFrame) {
        match frame {
            WorkerFrame::Action(action) => self.forward_action(worker, action),
            WorkerFrame::Capabilities(reg) => self.register_capabilities(worker, reg),
            WorkerFrame::Response(resp) => {
                if !self.correlation.resolve(resp) {
                    debug!(worker_id = %worker.worker_id, "worker response matched no pending request");
                }
            }
            WorkerFrame::Heartbeat => worker.touch(),
        }
    }

    fn register_capabilities(&self, worker: &WorkerConnection, reg: CapabilityRegistration) {
        let snapshot = serde_json::to_string(&reg);
        let set = worker.set_capabilities(reg);
        info!(
            worker_id = %worker.worker_id,
            capabilities = ?set.registration.names(),
            "capabilities registered"
        );
        let Ok(snapshot) = snapshot else {
            return;
        };
        let store = self.store.clone();
        let key = keys::worker_caps(&worker.worker_id);
        let limit = self.store_timeout;
        self.pool.spawn_queued("capability_snapshot", async move {
            match tokio::time::timeout(limit, store.set(&key, &snapshot, None)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(key, error = %e, "capability snapshot write failed"),
                Err(_) => error!(key, "capability snapshot write timed out"),
            }
        });
    }

    /// Write a Worker's action to its Bot now, and await the reply off the
    /// read loop so later frames are not held up.
    fn forward_action(&self, worker: &Arc<WorkerConnection>, action: CanonicalAction) {
        if let Some(reply_to) = action.reply_to.as_deref() {
            if let Some(elapsed) = worker.complete(reply_to) {
                debug!(worker_id = %worker.worker_id, elapsed_ms = elapsed.as_millis() as u64, "process time recorded");
            }
        }

        let Some(bot) = self.resolver.resolve_bot(&action) else {
            let err = GatewayError::NoRoute(action.action.clone());
            warn!(worker_id = %worker.worker_id, error = %err, "no bot for worker action");
            let resp = ActionResponse::failed(err.retcode(), err.to_string(), action.echo);
            let _ = worker.send_json(&response_value(&resp));
            return;
        };

        self.observer.emit(
            &worker.worker_id,
            &bot.self_id(),
            Direction::WorkerToBot,
            &action.action,
            "action",
        );

        let protocol = bot.protocol;
        let started = self.correlation.start(bot, action, protocol);
        let correlation = self.correlation.clone();
        let worker = worker.clone();
        drop(tokio::spawn(async move {
            let resp = match started {
                Ok(call) => correlation.wait(call).await,
                Err(failed) => failed,
            };
            if !worker.send_json(&response_value(&resp)) {
                debug!(worker_id = %worker.worker_id, "worker gone before action reply");
            }
        }));
    }

    /// Send an action to a Worker and wait for its reply.
    pub async fn call_worker(&self, worker_id: &str, action: CanonicalAction) -> ActionResponse {
        match self.workers.get(worker_id) {
            Some(worker) => {
                let protocol = worker.protocol;
                self.correlation.send(worker, action, protocol).await
            }
            None => ActionResponse::failed(
                RETCODE_NO_ROUTE,
                GatewayError::NoRoute(worker_id.to_string()).to_string(),
                action.echo,
            ),
        }
    }

    // ── Background ──────────────────────────────────────────────────────────

    /// Start the reload, refresh, prune, and (when enabled) queue-pump loops.
    pub fn spawn_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            tokio::spawn(self.resolver.clone().run_reload_loop(self.shutdown.token())),
            tokio::spawn(self.limiter.clone().run_refresh_loop(self.shutdown.token())),
        ];

        let sessions = self.sessions.clone();
        let cancel = self.shutdown.token();
        let every = Duration::from_millis(self.settings.limits.config_refresh_ms.max(1));
        handles.push(tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let _ = sessions.prune_expired();
                    }
                }
            }
        }));

        if self.settings.dispatch.queue_enabled {
            handles.push(tokio::spawn(
                self.dispatcher.clone().run_queue_pump(self.shutdown.token()),
            ));
        }
        info!(tasks = handles.len(), "background loops started");
        handles
    }
}

fn response_value(resp: &ActionResponse) -> Value {
    serde_json::to_value(resp).unwrap_or_else(|_| json!({ "status": "failed", "retcode": 1500 }))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use switchyard_core::{Capability, Extension, Segment};
    use switchyard_store::{KvStore, MemoryKv};
    use tokio::sync::{mpsc, oneshot};

    use super::*;
    use crate::collaborators::{Admission, AdmissionPolicy, EmployeeResponder, Interceptor, SYSTEM_CLOSED};
    use crate::errors::Result as GatewayResult;
    use crate::test_helpers::StalledReads;

    struct Closed;

    #[async_trait]
    impl AdmissionPolicy for Closed {
        async fn process_message(&self, _: &CanonicalEvent, _: &RequestScope) -> GatewayResult<Admission> {
            Ok(Admission::deny(SYSTEM_CLOSED))
        }
    }

    struct Broken;

    #[async_trait]
    impl AdmissionPolicy for Broken {
        async fn process_message(&self, _: &CanonicalEvent, _: &RequestScope) -> GatewayResult<Admission> {
            Err(GatewayError::Collaborator("policy offline".into()))
        }
    }

    struct Echoer;

    #[async_trait]
    impl EmployeeResponder for Echoer {
        async fn chat_with_employee(
            &self,
            _: &EmployeeIdentity,
            event: &CanonicalEvent,
        ) -> GatewayResult<Option<String>> {
            Ok(Some(format!("you said {}", event.text)))
        }
    }

    struct BlockAll;

    #[async_trait]
    impl Interceptor for BlockAll {
        async fn process_before_dispatch(&self, _: &DispatchContext<'_>) -> bool {
            false
        }
    }

    fn gateway_with(collaborators: Collaborators) -> (Arc<Gateway>, Arc<MemoryKv>) {
        let store = Arc::new(MemoryKv::new());
        let gw = Gateway::with_collaborators(SwitchyardSettings::default(), store.clone(), collaborators);
        (gw, store)
    }

    fn bot(gw: &Gateway, self_id: &str) -> (Arc<BotConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(BotConnection::new(self_id, "qq", ProtocolVersion::V11, tx));
        let _ = gw.bots.register(conn.clone());
        (conn, rx)
    }

    fn worker(gw: &Gateway, id: &str) -> (Arc<WorkerConnection>, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(16);
        let conn = Arc::new(WorkerConnection::new(id, ProtocolVersion::V11, tx, 16));
        let _ = gw.workers.register(conn.clone());
        (conn, rx)
    }

    fn msg(self_id: &str, user: &str, text: &str) -> CanonicalEvent {
        CanonicalEvent {
            kind: EventKind::Message,
            detail_type: "private".into(),
            platform: "qq".into(),
            self_id: self_id.into(),
            user_id: user.into(),
            text: text.into(),
            segments: vec![Segment::text(text)],
            ..Default::default()
        }
    }

    fn weather_registration() -> CapabilityRegistration {
        CapabilityRegistration {
            capabilities: vec![Capability {
                name: "weather".into(),
                trigger: Some("^weather".into()),
                ..Default::default()
            }],
            metadata: json!({"version": 2}),
        }
    }

    fn next_json(rx: &mut mpsc::Receiver<Arc<String>>) -> Value {
        serde_json::from_str(&rx.try_recv().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn message_reaches_idle_worker() {
        let (gw, _store) = gateway_with(Collaborators::default());
        let (b, _brx) = bot(&gw, "100");
        let (w, mut wrx) = worker(&gw, "W1");

        let outcome = gw.handle_bot_event(&b, msg("100", "u1", "hello")).await;
        assert!(matches!(
            outcome,
            PipelineOutcome::Dispatched(DispatchOutcome::Delivered { ref worker_id, .. }) if worker_id == "W1"
        ));
        assert_eq!(w.handled_count(), 1);
        assert_eq!(next_json(&mut wrx)["message"], "hello");
        assert_eq!(gw.sessions.get("qq", "u1").await.unwrap().history.len(), 1);
    }

    #[tokio::test]
    async fn meta_events_rekey_but_do_not_dispatch() {
        let (gw, _store) = gateway_with(Collaborators::default());
        let (b, _brx) = bot(&gw, "pending");
        let (w, _wrx) = worker(&gw, "W1");

        let meta = CanonicalEvent {
            kind: EventKind::Meta,
            detail_type: "lifecycle".into(),
            self_id: "555".into(),
            ..Default::default()
        };
        assert_eq!(gw.handle_bot_event(&b, meta).await, PipelineOutcome::Ignored);
        assert!(gw.bots.get("555").is_some());
        assert!(gw.bots.get("pending").is_none());
        assert_eq!(w.handled_count(), 0);
    }

    #[tokio::test]
    async fn rekey_onto_live_bot_keeps_both_connections() {
        let (gw, _store) = gateway_with(Collaborators::default());
        let (live, _lrx) = bot(&gw, "555");
        let (b, _brx) = bot(&gw, "unidentified_1");
        let (_w, mut wrx) = worker(&gw, "W1");

        let outcome = gw.handle_bot_event(&b, msg("555", "u1", "who am i")).await;
        assert!(matches!(outcome, PipelineOutcome::Dispatched(_)));
        assert_eq!(gw.bots.get("555").unwrap().conn_id, live.conn_id);
        assert_eq!(b.self_id(), "unidentified_1");
        assert_eq!(next_json(&mut wrx)["self_id"], "unidentified_1");
    }

    #[tokio::test]
    async fn duplicate_message_id_suppressed() {
        let (gw, _store) = gateway_with(Collaborators::default());
        let (b, _brx) = bot(&gw, "100");
        let _w = worker(&gw, "W1");
        let mut ev = msg("100", "u1", "hi");
        ev.message_id = "m-1".into();
        assert!(matches!(gw.handle_bot_event(&b, ev.clone()).await, PipelineOutcome::Dispatched(_)));
        assert_eq!(gw.handle_bot_event(&b, ev).await, PipelineOutcome::Duplicate);
    }

    #[tokio::test]
    async fn system_closed_admits_only_admin_commands() {
        let collaborators = Collaborators {
            admission: Arc::new(Closed),
            ..Default::default()
        };
        let (gw, _store) = gateway_with(collaborators);
        let (b, _brx) = bot(&gw, "100");
        let _w = worker(&gw, "W1");

        assert_eq!(
            gw.handle_bot_event(&b, msg("100", "u1", "hello")).await,
            PipelineOutcome::Rejected {
                reason: SYSTEM_CLOSED.into()
            }
        );

        let mut admin = msg("100", "u1", "#reload");
        admin.push_extension(Extension::AdminCommand);
        assert!(matches!(gw.handle_bot_event(&b, admin).await, PipelineOutcome::Dispatched(_)));
    }

    #[tokio::test]
    async fn admission_errors_fail_open() {
        let collaborators = Collaborators {
            admission: Arc::new(Broken),
            ..Default::default()
        };
        let (gw, _store) = gateway_with(collaborators);
        let (b, _brx) = bot(&gw, "100");
        let _w = worker(&gw, "W1");
        assert!(matches!(
            gw.handle_bot_event(&b, msg("100", "u1", "hello")).await,
            PipelineOutcome::Dispatched(_)
        ));
    }

    #[tokio::test]
    async fn employee_reply_short_circuits() {
        let collaborators = Collaborators {
            employee: Arc::new(Echoer),
            ..Default::default()
        };
        let (gw, _store) = gateway_with(collaborators);
        let (b, mut brx) = bot(&gw, "100");
        let (w, _wrx) = worker(&gw, "W1");

        assert_eq!(
            gw.handle_bot_event(&b, msg("100", "u1", "ping")).await,
            PipelineOutcome::EmployeeReplied
        );
        let reply = next_json(&mut brx);
        assert_eq!(reply["action"], "send_msg");
        assert_eq!(reply["params"]["message"], "you said ping");
        assert_eq!(reply["params"]["user_id"], "u1");
        assert_eq!(w.handled_count(), 0);
    }

    #[tokio::test]
    async fn interceptor_can_suppress() {
        let collaborators = Collaborators {
            interceptor: Arc::new(BlockAll),
            ..Default::default()
        };
        let (gw, _store) = gateway_with(collaborators);
        let (b, _brx) = bot(&gw, "100");
        let (w, _wrx) = worker(&gw, "W1");
        assert_eq!(
            gw.handle_bot_event(&b, msg("100", "u1", "hello")).await,
            PipelineOutcome::Suppressed
        );
        assert_eq!(w.handled_count(), 0);
    }

    #[tokio::test]
    async fn worker_action_round_trips_through_bot() {
        let (gw, _store) = gateway_with(Collaborators::default());
        let (_b, mut brx) = bot(&gw, "100");
        let (w, mut wrx) = worker(&gw, "W1");

        let action = CanonicalAction {
            action: "send_msg".into(),
            params: json!({"user_id": "u1", "message": "hi"}),
            echo: Some(json!("w-echo-1")),
            self_id: "100".into(),
            ..Default::default()
        };
        gw.handle_worker_frame(&w, WorkerFrame::Action(action));

        let forwarded = next_json(&mut brx);
        let token = forwarded["echo"].as_str().unwrap().to_string();
        assert!(token.starts_with("100|"));

        gw.handle_bot_response(ActionResponse::ok(json!({"message_id": 7}), Some(json!(token))));

        let reply = loop {
            if let Ok(text) = wrx.try_recv() {
                break serde_json::from_str::<Value>(&text).unwrap();
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(reply["echo"], "w-echo-1");
        assert_eq!(reply["data"]["message_id"], 7);
        assert_eq!(gw.correlation.pending_len(), 0);
    }

    #[tokio::test]
    async fn worker_action_without_bot_gets_no_route() {
        let (gw, _store) = gateway_with(Collaborators::default());
        let (w, mut wrx) = worker(&gw, "W1");
        let action = CanonicalAction {
            action: "send_msg".into(),
            echo: Some(json!(3)),
            ..Default::default()
        };
        gw.handle_worker_frame(&w, WorkerFrame::Action(action));
        let reply = next_json(&mut wrx);
        assert_eq!(reply["retcode"], RETCODE_NO_ROUTE);
        assert_eq!(reply["echo"], 3);
    }

    #[tokio::test]
    async fn reply_to_records_process_time() {
        let (gw, _store) = gateway_with(Collaborators::default());
        let (b, _brx) = bot(&gw, "100");
        let (w, mut wrx) = worker(&gw, "W1");
        let _ = gw.handle_bot_event(&b, msg("100", "u1", "hello")).await;
        let echo = next_json(&mut wrx)["echo"].as_str().unwrap().to_string();

        let action = CanonicalAction {
            action: "send_msg".into(),
            reply_to: Some(echo),
            ..Default::default()
        };
        gw.handle_worker_frame(&w, WorkerFrame::Action(action));
        assert!(w.avg_process_time().is_some());
        assert_eq!(w.inflight_len(), 0);
    }

    #[tokio::test]
    async fn capabilities_snapshot_restored_on_reconnect() {
        let (gw, store) = gateway_with(Collaborators::default());
        let (w, _wrx) = worker(&gw, "W1");
        gw.handle_worker_frame(&w, WorkerFrame::Capabilities(weather_registration()));
        assert!(w.capabilities().has("weather"));

        let key = keys::worker_caps("W1");
        while store.get(&key).await.unwrap().is_none() {
            tokio::task::yield_now().await;
        }

        let (again, _rx) = worker(&gw, "W1");
        assert!(again.capabilities().is_empty());
        gw.on_worker_connected(&again).await;
        assert!(again.capabilities().has("weather"));
        assert_eq!(again.capabilities().trigger_match("weather now"), Some("weather"));
    }

    #[tokio::test]
    async fn worker_connect_flushes_cached_events() {
        let (gw, _store) = gateway_with(Collaborators::default());
        let (b, _brx) = bot(&gw, "100");
        assert_eq!(
            gw.handle_bot_event(&b, msg("100", "u1", "early")).await,
            PipelineOutcome::Dispatched(DispatchOutcome::Cached)
        );
        assert_eq!(gw.health().cached_events, 1);

        let (w, mut wrx) = worker(&gw, "W1");
        gw.on_worker_connected(&w).await;
        assert_eq!(next_json(&mut wrx)["message"], "early");
        assert_eq!(gw.health().cached_events, 0);
        assert_eq!(gw.health().status, "ok");
    }

    #[tokio::test]
    async fn call_worker_unknown_is_no_route() {
        let (gw, _store) = gateway_with(Collaborators::default());
        let resp = gw
            .call_worker("ghost", CanonicalAction {
                action: "status".into(),
                ..Default::default()
            })
            .await;
        assert_eq!(resp.retcode, RETCODE_NO_ROUTE);
    }

    #[tokio::test]
    async fn capability_snapshot_waits_out_saturated_pool() {
        let mut settings = SwitchyardSettings::default();
        settings.dispatch.pool_permits = 1;
        let store = Arc::new(MemoryKv::new());
        let gw = Gateway::new(settings, store.clone());
        let (w, _wrx) = worker(&gw, "W1");

        let (release_tx, release_rx) = oneshot::channel::<()>();
        assert!(gw.pool.spawn("hold", async move {
            let _ = release_rx.await;
        }));
        gw.handle_worker_frame(&w, WorkerFrame::Capabilities(weather_registration()));
        assert!(w.capabilities().has("weather"));

        let key = keys::worker_caps("W1");
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(store.get(&key).await.unwrap().is_none());

        release_tx.send(()).unwrap();
        while store.get(&key).await.unwrap().is_none() {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_store_reads_do_not_block_the_pipeline() {
        let gw = Gateway::new(SwitchyardSettings::default(), Arc::new(StalledReads::default()));
        let (b, _brx) = bot(&gw, "100");
        let (w, mut wrx) = worker(&gw, "W1");

        tokio::time::timeout(Duration::from_secs(120), gw.on_worker_connected(&w))
            .await
            .unwrap();
        assert!(w.capabilities().is_empty());

        let outcome = tokio::time::timeout(
            Duration::from_secs(120),
            gw.handle_bot_event(&b, msg("100", "u1", "hello")),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, PipelineOutcome::Dispatched(_)));
        assert_eq!(w.handled_count(), 1);
        assert_eq!(next_json(&mut wrx)["message"], "hello");
        assert_eq!(gw.sessions.get("qq", "u1").await.unwrap().history.len(), 1);
    }
}
