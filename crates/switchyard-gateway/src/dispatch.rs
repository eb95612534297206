//! Event delivery: store queues, direct delivery with bounded retries, and
//! the undeliverable-event cache.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use switchyard_core::{render_event, CanonicalEvent};
use switchyard_settings::DispatchSettings;
use switchyard_store::{keys, SharedStore, StoreError};
use switchyard_telemetry::metric_names::{
    CACHE_DEPTH, CACHE_EVICTIONS_TOTAL, DELIVERY_FAILURES_TOTAL, EVENTS_CACHED_TOTAL,
    EVENTS_DISPATCHED_TOTAL, QUEUE_PUSH_RETRIES_TOTAL,
};

use crate::balancer::LoadBalancer;
use crate::connection::{Peer, WorkerConnection};
use crate::observe::{Direction, Observer};
use crate::pool::TaskPool;
use crate::registry::WorkerRegistry;
use crate::routing::{RouteDecision, RoutingResolver};

/// Events popped from one queue per pump tick.
const PUMP_BATCH: usize = 64;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Queued { queue: String },
    Delivered { worker_id: String, attempts: u32 },
    /// No Worker could take it; parked until one connects.
    Cached,
}

/// Bounded FIFO of events that found no Worker.
pub struct EventCache {
    entries: Mutex<VecDeque<CanonicalEvent>>,
    capacity: usize,
}

impl EventCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Park an event. Returns `true` if the oldest entry was evicted for it.
    pub fn push(&self, event: CanonicalEvent) -> bool {
        let mut entries = self.entries.lock();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front().is_some()
        } else {
            false
        };
        entries.push_back(event);
        gauge!(CACHE_DEPTH).set(entries.len() as f64);
        evicted
    }

    /// Take every parked event, oldest first.
    pub fn drain(&self) -> Vec<CanonicalEvent> {
        let mut entries = self.entries.lock();
        gauge!(CACHE_DEPTH).set(0.0);
        entries.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

pub struct Dispatcher {
    workers: Arc<WorkerRegistry>,
    resolver: Arc<RoutingResolver>,
    balancer: LoadBalancer,
    store: SharedStore,
    pool: TaskPool,
    observer: Arc<Observer>,
    cache: EventCache,
    settings: DispatchSettings,
    store_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        workers: Arc<WorkerRegistry>,
        resolver: Arc<RoutingResolver>,
        store: SharedStore,
        pool: TaskPool,
        observer: Arc<Observer>,
        settings: DispatchSettings,
        store_timeout: Duration,
    ) -> Self {
        Self {
            workers,
            resolver,
            balancer: LoadBalancer::new(),
            store,
            pool,
            observer,
            cache: EventCache::new(settings.cache_capacity),
            settings,
            store_timeout,
        }
    }

    pub fn cache(&self) -> &EventCache {
        &self.cache
    }

    /// Resolve and deliver.
    pub async fn dispatch(&self, mut event: CanonicalEvent) -> DispatchOutcome {
        let _ = event.ensure_echo();
        let decision = self.resolver.resolve(&event);
        self.dispatch_routed(event, decision).await
    }

    /// Deliver with a routing decision already made.
    #[instrument(skip_all, fields(echo = event.echo.as_deref().unwrap_or(""), strategy = decision.strategy()))]
    pub async fn dispatch_routed(
        &self,
        mut event: CanonicalEvent,
        decision: RouteDecision,
    ) -> DispatchOutcome {
        let _ = event.ensure_echo();

        if let Some(target) = event.shadow_target().map(str::to_owned) {
            self.spawn_shadow(&event, target);
        }

        if self.settings.queue_enabled {
            let queue = decision
                .worker_id()
                .map_or_else(|| keys::DEFAULT_QUEUE.to_string(), keys::worker_queue);
            if self.push_with_backoff(&queue, &event).await {
                counter!(EVENTS_DISPATCHED_TOTAL, "path" => "queue").increment(1);
                self.observer.emit(
                    &event.self_id,
                    keys::queue_worker_id(&queue).unwrap_or(&queue),
                    Direction::BotToWorker,
                    event.kind.as_str(),
                    decision.strategy(),
                );
                return DispatchOutcome::Queued { queue };
            }
            warn!(queue, "queue push exhausted, falling back to direct delivery");
        }

        self.deliver_direct(event, decision).await
    }

    async fn store_call<T>(
        &self,
        fut: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.store_timeout, fut).await?
    }

    async fn push_with_backoff(&self, queue: &str, event: &CanonicalEvent) -> bool {
        let payload = match serde_json::to_string(event) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "event serialization failed");
                return false;
            }
        };
        let attempts = self.settings.push_retries.max(1);
        for attempt in 0..attempts {
            match self.store_call(self.store.push(queue, &payload)).await {
                Ok(depth) => {
                    debug!(queue, depth, "event queued");
                    return true;
                }
                Err(e) => {
                    counter!(QUEUE_PUSH_RETRIES_TOTAL).increment(1);
                    warn!(queue, attempt, error = %e, "queue push failed");
                    if attempt + 1 < attempts {
                        let delay = self.settings.push_base_delay_ms.saturating_mul(1 << attempt.min(16));
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                    }
                }
            }
        }
        false
    }

    /// Bounded retry loop. Each failed write evicts that Worker and resolves
    /// again; exhausting the attempts parks the event in the cache.
    async fn deliver_direct(&self, event: CanonicalEvent, decision: RouteDecision) -> DispatchOutcome {
        let max_attempts = self.settings.max_delivery_attempts.max(1);
        let mut strategy = decision.strategy();
        let mut preferred = decision.worker_id().map(str::to_owned);

        for attempt in 1..=max_attempts {
            let named = preferred.take().and_then(|id| {
                let found = self.workers.get(&id);
                if found.is_none() {
                    debug!(worker_id = %id, "routed worker not connected, balancing");
                }
                found
            });
            let target = match named {
                Some(worker) => worker,
                None => {
                    strategy = "balanced";
                    match self.balancer.select(&self.workers.list_healthy()) {
                        Some(worker) => worker,
                        None => break,
                    }
                }
            };

            if self.send_event(&target, &event, strategy) {
                counter!(EVENTS_DISPATCHED_TOTAL, "path" => "direct").increment(1);
                return DispatchOutcome::Delivered {
                    worker_id: target.worker_id.clone(),
                    attempts: attempt,
                };
            }

            counter!(DELIVERY_FAILURES_TOTAL).increment(1);
            warn!(worker_id = %target.worker_id, attempt, "delivery failed, evicting worker");
            let _ = self.workers.remove(&target.worker_id, &target.conn_id);

            let retry = self.resolver.resolve(&event);
            strategy = retry.strategy();
            preferred = retry.worker_id().map(str::to_owned);
        }

        self.park(event);
        DispatchOutcome::Cached
    }

    fn send_event(&self, worker: &WorkerConnection, event: &CanonicalEvent, strategy: &str) -> bool {
        let payload = render_event(event, worker.protocol);
        if !worker.send_json(&payload) {
            return false;
        }
        worker.increment_handled();
        if let Some(echo) = event.echo.as_deref() {
            worker.mark_dispatched(echo);
        }
        self.observer.emit(
            &event.self_id,
            &worker.worker_id,
            Direction::BotToWorker,
            event.kind.as_str(),
            strategy,
        );
        true
    }

    fn park(&self, event: CanonicalEvent) {
        counter!(EVENTS_CACHED_TOTAL).increment(1);
        warn!(echo = event.echo.as_deref().unwrap_or(""), "no worker available, event cached");
        if self.cache.push(event) {
            counter!(CACHE_EVICTIONS_TOTAL).increment(1);
            warn!("event cache full, oldest event evicted");
        }
    }

    fn spawn_shadow(&self, event: &CanonicalEvent, target: String) {
        let workers = self.workers.clone();
        let store = self.store.clone();
        let queue_enabled = self.settings.queue_enabled;
        let event = event.clone();
        let _ = self.pool.spawn("shadow", async move {
            if queue_enabled {
                let Ok(payload) = serde_json::to_string(&event) else {
                    return;
                };
                if let Err(e) = store.push(&keys::worker_queue(&target), &payload).await {
                    warn!(shadow = %target, error = %e, "shadow push failed");
                }
                return;
            }
            match workers.get(&target) {
                Some(worker) => {
                    if !worker.send_json(&render_event(&event, worker.protocol)) {
                        warn!(shadow = %target, "shadow delivery failed");
                    }
                }
                None => debug!(shadow = %target, "shadow target not connected"),
            }
        });
    }

    /// Redeliver every cached event. Each is taken out exactly once; ones that
    /// still find no Worker are parked again.
    pub async fn flush_cache(&self) -> usize {
        let parked = self.cache.drain();
        if parked.is_empty() {
            return 0;
        }
        info!(count = parked.len(), "flushing cached events");
        let mut delivered = 0;
        for event in parked {
            let decision = self.resolver.resolve(&event);
            if matches!(
                self.deliver_direct(event, decision).await,
                DispatchOutcome::Delivered { .. }
            ) {
                delivered += 1;
            }
        }
        delivered
    }

    /// Move queued events to WebSocket-connected Workers.
    pub async fn pump_once(&self) -> usize {
        let mut moved = 0;
        for worker in self.workers.list_healthy() {
            let queue = keys::worker_queue(&worker.worker_id);
            moved += self.drain_queue(&queue, |_| Some(worker.clone())).await;
        }
        moved += self
            .drain_queue(keys::DEFAULT_QUEUE, |_| {
                self.balancer.select(&self.workers.list_healthy())
            })
            .await;
        moved
    }

    async fn drain_queue<F>(&self, queue: &str, mut pick: F) -> usize
    where
        F: FnMut(&CanonicalEvent) -> Option<Arc<WorkerConnection>>,
    {
        let mut moved = 0;
        for _ in 0..PUMP_BATCH {
            let payload = match self.store_call(self.store.pop(queue)).await {
                Ok(Some(p)) => p,
                Ok(None) => break,
                Err(e) => {
                    warn!(queue, error = %e, "queue pop failed");
                    break;
                }
            };
            let event: CanonicalEvent = match serde_json::from_str(&payload) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(queue, error = %e, "dropping unreadable queued event");
                    continue;
                }
            };
            let delivered = pick(&event).is_some_and(|w| self.send_event(&w, &event, "queue"));
            if !delivered {
                if let Err(e) = self.store_call(self.store.push(queue, &payload)).await {
                    warn!(queue, error = %e, "requeue failed, event lost");
                }
                break;
            }
            counter!(EVENTS_DISPATCHED_TOTAL, "path" => "pump").increment(1);
            moved += 1;
        }
        moved
    }

    pub async fn run_queue_pump(self: Arc<Self>, cancel: CancellationToken) {
        let period = Duration::from_millis(self.settings.pump_interval_ms.max(1));
        let mut tick = tokio::time::interval(period);
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let moved = self.pump_once().await;
                    if moved > 0 {
                        debug!(moved, "queue pump delivered events");
                    }
                }
            }
        }
    }
}
