//! Live Bot and Worker connection state.
//!
//! Each connection owns a bounded outbound channel drained by its socket
//! writer task. A failed `try_send` (channel full or closed) is what the rest
//! of the gateway calls a write failure.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use regex::Regex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::warn;

use switchyard_core::{CapabilityRegistration, ConnId, ProtocolVersion};

/// Rolling sample windows hold at most this many entries.
pub const SAMPLE_CAP: usize = 20;

/// Fixed-capacity window of duration samples; oldest dropped first.
#[derive(Debug)]
pub struct SampleWindow {
    samples: VecDeque<Duration>,
    cap: usize,
}

impl Default for SampleWindow {
    fn default() -> Self {
        Self::new(SAMPLE_CAP)
    }
}

impl SampleWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(cap),
            cap: cap.max(1),
        }
    }

    pub fn push(&mut self, sample: Duration) {
        if self.samples.len() == self.cap {
            let _ = self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn average(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        Some(total / self.samples.len() as u32)
    }
}

/// What correlation and the socket writer need from either kind of
/// connection.
pub trait Peer: Send + Sync {
    fn peer_id(&self) -> String;

    /// Queue a text frame. `false` means the write failed.
    fn send_text(&self, text: Arc<String>) -> bool;

    fn record_latency(&self, rtt: Duration);

    fn note_ping_sent(&self);

    fn on_pong(&self);

    fn send_json(&self, value: &Value) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.send_text(Arc::new(json)),
            Err(_) => false,
        }
    }
}

/// Timestamps and counters shared by both connection kinds.
#[derive(Debug)]
struct Link {
    tx: mpsc::Sender<Arc<String>>,
    connected_at: Instant,
    last_seen: Mutex<Instant>,
    ping_sent_at: Mutex<Option<Instant>>,
    sent: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
    latency: Mutex<SampleWindow>,
}

impl Link {
    fn new(tx: mpsc::Sender<Arc<String>>) -> Self {
        let now = Instant::now();
        Self {
            tx,
            connected_at: now,
            last_seen: Mutex::new(now),
            ping_sent_at: Mutex::new(None),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            latency: Mutex::new(SampleWindow::default()),
        }
    }

    fn send(&self, text: Arc<String>) -> bool {
        if self.tx.try_send(text).is_ok() {
            let _ = self.sent.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    fn touch(&self) {
        let _ = self.received.fetch_add(1, Ordering::Relaxed);
        *self.last_seen.lock() = Instant::now();
    }

    fn silent_for(&self) -> Duration {
        Instant::now().saturating_duration_since(*self.last_seen.lock())
    }

    fn age(&self) -> Duration {
        Instant::now().saturating_duration_since(self.connected_at)
    }

    fn on_pong(&self) -> Option<Duration> {
        *self.last_seen.lock() = Instant::now();
        let sent = self.ping_sent_at.lock().take()?;
        Some(Instant::now().saturating_duration_since(sent))
    }
}

/// Liveness rule: heard from within `window`, or connected within `grace`.
#[derive(Clone, Copy, Debug)]
pub struct HealthPolicy {
    pub window: Duration,
    pub grace: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            grace: Duration::from_secs(10),
        }
    }
}

// ── Bot ─────────────────────────────────────────────────────────────────────

/// A front-end chat adapter.
#[derive(Debug)]
pub struct BotConnection {
    pub conn_id: ConnId,
    self_id: RwLock<String>,
    pub platform: String,
    pub protocol: ProtocolVersion,
    link: Link,
}

impl BotConnection {
    pub fn new(
        self_id: impl Into<String>,
        platform: impl Into<String>,
        protocol: ProtocolVersion,
        tx: mpsc::Sender<Arc<String>>,
    ) -> Self {
        Self {
            conn_id: ConnId::new(),
            self_id: RwLock::new(self_id.into()),
            platform: platform.into(),
            protocol,
            link: Link::new(tx),
        }
    }

    pub fn self_id(&self) -> String {
        self.self_id.read().clone()
    }

    /// Only the registry calls this, while holding its table lock.
    pub(crate) fn set_self_id(&self, self_id: &str) {
        *self.self_id.write() = self_id.to_string();
    }

    pub fn touch(&self) {
        self.link.touch();
    }

    pub fn silent_for(&self) -> Duration {
        self.link.silent_for()
    }

    pub fn age(&self) -> Duration {
        self.link.age()
    }

    pub fn is_healthy(&self, policy: &HealthPolicy) -> bool {
        self.silent_for() <= policy.window || self.age() <= policy.grace
    }

    pub fn sent_count(&self) -> u64 {
        self.link.sent.load(Ordering::Relaxed)
    }

    pub fn received_count(&self) -> u64 {
        self.link.received.load(Ordering::Relaxed)
    }

    pub fn avg_latency(&self) -> Option<Duration> {
        self.link.latency.lock().average()
    }
}

impl Peer for BotConnection {
    fn peer_id(&self) -> String {
        self.self_id()
    }

    fn send_text(&self, text: Arc<String>) -> bool {
        self.link.send(text)
    }

    fn record_latency(&self, rtt: Duration) {
        self.link.latency.lock().push(rtt);
    }

    fn note_ping_sent(&self) {
        *self.link.ping_sent_at.lock() = Some(Instant::now());
    }

    fn on_pong(&self) {
        if let Some(rtt) = self.link.on_pong() {
            self.record_latency(rtt);
        }
    }
}

// ── Worker ──────────────────────────────────────────────────────────────────

/// Capability list with compiled trigger patterns.
#[derive(Debug, Default)]
pub struct CapabilitySet {
    pub registration: CapabilityRegistration,
    triggers: Vec<(String, Regex)>,
}

impl CapabilitySet {
    pub fn compile(registration: CapabilityRegistration, worker_id: &str) -> Self {
        let mut triggers = Vec::new();
        for cap in &registration.capabilities {
            let Some(pattern) = cap.trigger.as_deref().filter(|p| !p.is_empty()) else {
                continue;
            };
            match Regex::new(pattern) {
                Ok(re) => triggers.push((cap.name.clone(), re)),
                Err(e) => warn!(
                    worker_id,
                    capability = %cap.name,
                    error = %e,
                    "invalid trigger pattern, capability kept without trigger"
                ),
            }
        }
        Self {
            registration,
            triggers,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.registration.capabilities.is_empty()
    }

    pub fn has(&self, name: &str) -> bool {
        self.registration.capabilities.iter().any(|c| c.name == name)
    }

    /// Name of the first capability whose trigger matches `text`.
    pub fn trigger_match(&self, text: &str) -> Option<&str> {
        self.triggers
            .iter()
            .find(|(_, re)| re.is_match(text))
            .map(|(name, _)| name.as_str())
    }
}

/// Dispatched-event echoes awaiting a reply, for process-time sampling.
#[derive(Debug)]
struct Inflight {
    entries: VecDeque<(String, Instant)>,
    cap: usize,
}

impl Inflight {
    fn insert(&mut self, echo: String) {
        if self.entries.len() == self.cap {
            let _ = self.entries.pop_front();
        }
        self.entries.push_back((echo, Instant::now()));
    }

    fn take(&mut self, echo: &str) -> Option<Instant> {
        let pos = self.entries.iter().position(|(e, _)| e == echo)?;
        self.entries.remove(pos).map(|(_, at)| at)
    }
}

/// A back-end skill processor.
#[derive(Debug)]
pub struct WorkerConnection {
    pub conn_id: ConnId,
    pub worker_id: String,
    pub protocol: ProtocolVersion,
    link: Link,
    capabilities: RwLock<Arc<CapabilitySet>>,
    process: Mutex<SampleWindow>,
    handled: AtomicU64,
    inflight: Mutex<Inflight>,
}

impl WorkerConnection {
    pub fn new(
        worker_id: impl Into<String>,
        protocol: ProtocolVersion,
        tx: mpsc::Sender<Arc<String>>,
        inflight_cap: usize,
    ) -> Self {
        Self {
            conn_id: ConnId::new(),
            worker_id: worker_id.into(),
            protocol,
            link: Link::new(tx),
            capabilities: RwLock::new(Arc::new(CapabilitySet::default())),
            process: Mutex::new(SampleWindow::default()),
            handled: AtomicU64::new(0),
            inflight: Mutex::new(Inflight {
                entries: VecDeque::new(),
                cap: inflight_cap.max(1),
            }),
        }
    }

    pub fn touch(&self) {
        self.link.touch();
    }

    pub fn silent_for(&self) -> Duration {
        self.link.silent_for()
    }

    pub fn age(&self) -> Duration {
        self.link.age()
    }

    pub fn is_healthy(&self, policy: &HealthPolicy) -> bool {
        self.silent_for() <= policy.window || self.age() <= policy.grace
    }

    /// Replace the capability list wholesale.
    pub fn set_capabilities(&self, registration: CapabilityRegistration) -> Arc<CapabilitySet> {
        let set = Arc::new(CapabilitySet::compile(registration, &self.worker_id));
        *self.capabilities.write() = set.clone();
        set
    }

    pub fn capabilities(&self) -> Arc<CapabilitySet> {
        self.capabilities.read().clone()
    }

    pub fn handled_count(&self) -> u64 {
        self.handled.load(Ordering::Relaxed)
    }

    pub fn increment_handled(&self) {
        let _ = self.handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_rtt(&self) -> Option<Duration> {
        self.link.latency.lock().average()
    }

    pub fn rtt_samples(&self) -> usize {
        self.link.latency.lock().len()
    }

    pub fn record_process_time(&self, d: Duration) {
        self.process.lock().push(d);
    }

    pub fn avg_process_time(&self) -> Option<Duration> {
        self.process.lock().average()
    }

    pub fn mark_dispatched(&self, echo: &str) {
        self.inflight.lock().insert(echo.to_string());
    }

    /// Close out a dispatched event; records and returns its process time.
    pub fn complete(&self, echo: &str) -> Option<Duration> {
        let started = self.inflight.lock().take(echo)?;
        let elapsed = Instant::now().saturating_duration_since(started);
        self.record_process_time(elapsed);
        Some(elapsed)
    }

    pub fn inflight_len(&self) -> usize {
        self.inflight.lock().entries.len()
    }

    pub fn sent_count(&self) -> u64 {
        self.link.sent.load(Ordering::Relaxed)
    }
}

impl Peer for WorkerConnection {
    fn peer_id(&self) -> String {
        self.worker_id.clone()
    }

    fn send_text(&self, text: Arc<String>) -> bool {
        self.link.send(text)
    }

    fn record_latency(&self, rtt: Duration) {
        self.link.latency.lock().push(rtt);
    }

    fn note_ping_sent(&self) {
        *self.link.ping_sent_at.lock() = Some(Instant::now());
    }

    fn on_pong(&self) {
        if let Some(rtt) = self.link.on_pong() {
            self.record_latency(rtt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use switchyard_core::Capability;

    fn worker(id: &str) -> (WorkerConnection, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(4);
        (WorkerConnection::new(id, ProtocolVersion::V11, tx, 3), rx)
    }

    #[test]
    fn window_caps_and_averages() {
        let mut w = SampleWindow::default();
        for ms in 1..=25u64 {
            w.push(Duration::from_millis(ms));
        }
        assert_eq!(w.len(), SAMPLE_CAP);
        // Remaining samples are 6..=25, mean 15.5ms.
        assert_eq!(w.average(), Some(Duration::from_micros(15_500)));
    }

    #[test]
    fn empty_window_has_no_average() {
        assert_eq!(SampleWindow::default().average(), None);
    }

    #[tokio::test]
    async fn send_counts_and_fails_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let bot = BotConnection::new("100", "qq", ProtocolVersion::V11, tx);
        assert!(bot.send_text(Arc::new("a".into())));
        assert!(!bot.send_text(Arc::new("b".into())));
        assert_eq!(bot.sent_count(), 1);
        assert_eq!(rx.recv().await.unwrap().as_str(), "a");
    }

    #[tokio::test]
    async fn send_to_closed_channel_fails() {
        let (w, rx) = worker("w1");
        drop(rx);
        assert!(!w.send_json(&json!({"x": 1})));
    }

    #[tokio::test(start_paused = true)]
    async fn health_window_and_grace() {
        let (w, _rx) = worker("w1");
        let policy = HealthPolicy {
            window: Duration::from_secs(60),
            grace: Duration::from_secs(10),
        };
        assert!(w.is_healthy(&policy));
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!w.is_healthy(&policy));
        w.touch();
        assert!(w.is_healthy(&policy));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_records_latency() {
        let (w, _rx) = worker("w1");
        w.on_pong();
        assert_eq!(w.rtt_samples(), 0);
        w.note_ping_sent();
        tokio::time::advance(Duration::from_millis(40)).await;
        w.on_pong();
        assert_eq!(w.avg_rtt(), Some(Duration::from_millis(40)));
    }

    #[tokio::test(start_paused = true)]
    async fn inflight_completion_records_process_time() {
        let (w, _rx) = worker("w1");
        w.mark_dispatched("e1");
        tokio::time::advance(Duration::from_millis(250)).await;
        assert_eq!(w.complete("e1"), Some(Duration::from_millis(250)));
        assert_eq!(w.complete("e1"), None);
        assert_eq!(w.avg_process_time(), Some(Duration::from_millis(250)));
    }

    #[test]
    fn inflight_is_bounded() {
        let (w, _rx) = worker("w1");
        for i in 0..5 {
            w.mark_dispatched(&format!("e{i}"));
        }
        assert_eq!(w.inflight_len(), 3);
        assert!(w.complete("e0").is_none());
        assert!(w.complete("e4").is_some());
    }

    #[test]
    fn capabilities_replace_and_compile_triggers() {
        let (w, _rx) = worker("w1");
        let reg = CapabilityRegistration {
            capabilities: vec![
                Capability {
                    name: "weather".into(),
                    trigger: Some("^weather".into()),
                    ..Default::default()
                },
                Capability {
                    name: "broken".into(),
                    trigger: Some("([".into()),
                    ..Default::default()
                },
            ],
            metadata: Value::Null,
        };
        let set = w.set_capabilities(reg);
        assert!(set.has("broken"));
        assert_eq!(set.trigger_match("weather in paris"), Some("weather"));
        assert_eq!(set.trigger_match("hello"), None);

        let _ = w.set_capabilities(CapabilityRegistration::default());
        assert!(w.capabilities().is_empty());
        assert!(!w.capabilities().has("weather"));
    }
}
