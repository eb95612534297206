//! Routing resolution for Bot→Worker events and Worker→Bot actions.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use parking_lot::RwLock;
use rand::seq::IndexedRandom;
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use switchyard_core::{CanonicalAction, CanonicalEvent};
use switchyard_store::{keys, SharedStore, StoreError};
use switchyard_telemetry::metric_names::{ROUTE_DECISIONS_TOTAL, ROUTING_RELOADS_TOTAL};

use crate::connection::{BotConnection, WorkerConnection};
use crate::registry::{BotRegistry, WorkerRegistry};

/// Outcome of resolving one event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RouteDecision {
    Capability { worker_id: String, capability: String },
    Hint { worker_id: String },
    Exact { worker_id: String, key: String },
    Wildcard { worker_id: String, pattern: String },
    /// Hand off to the load balancer.
    Unresolved,
}

impl RouteDecision {
    pub fn strategy(&self) -> &'static str {
        match self {
            Self::Capability { .. } => "capability",
            Self::Hint { .. } => "hint",
            Self::Exact { .. } => "exact",
            Self::Wildcard { .. } => "wildcard",
            Self::Unresolved => "balanced",
        }
    }

    pub fn worker_id(&self) -> Option<&str> {
        match self {
            Self::Capability { worker_id, .. }
            | Self::Hint { worker_id }
            | Self::Exact { worker_id, .. }
            | Self::Wildcard { worker_id, .. } => Some(worker_id),
            Self::Unresolved => None,
        }
    }
}

#[derive(Debug, Clone)]
struct WildcardRule {
    pattern: String,
    regex: Regex,
    target: String,
    literal_len: usize,
}

impl WildcardRule {
    fn new(pattern: &str, target: &str) -> Option<Self> {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{body}$")).ok()?;
        Some(Self {
            pattern: pattern.to_string(),
            regex,
            target: target.to_string(),
            literal_len: pattern.chars().filter(|c| *c != '*').count(),
        })
    }
}

/// One rule table: exact keys plus `*` patterns in specificity order.
#[derive(Debug, Clone, Default)]
pub struct RuleTable {
    exact: HashMap<String, String>,
    wildcards: Vec<WildcardRule>,
}

impl RuleTable {
    pub fn from_rules<I, K, V>(rules: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut table = Self::default();
        for (key, target) in rules {
            table.insert_unsorted(key.as_ref(), target.as_ref());
        }
        table.sort();
        table
    }

    fn insert_unsorted(&mut self, key: &str, target: &str) {
        if key.contains('*') {
            self.wildcards.retain(|w| w.pattern != key);
            match WildcardRule::new(key, target) {
                Some(rule) => self.wildcards.push(rule),
                None => warn!(pattern = key, "unusable wildcard rule skipped"),
            }
        } else {
            let _ = self.exact.insert(key.to_string(), target.to_string());
        }
    }

    fn sort(&mut self) {
        self.wildcards.sort_by(|a, b| {
            b.literal_len
                .cmp(&a.literal_len)
                .then_with(|| a.pattern.cmp(&b.pattern))
        });
    }

    pub fn insert(&mut self, key: &str, target: &str) {
        self.insert_unsorted(key, target);
        self.sort();
    }

    pub fn remove(&mut self, key: &str) -> bool {
        if key.contains('*') {
            let before = self.wildcards.len();
            self.wildcards.retain(|w| w.pattern != key);
            before != self.wildcards.len()
        } else {
            self.exact.remove(key).is_some()
        }
    }

    pub fn exact(&self, key: &str) -> Option<&str> {
        self.exact.get(key).map(String::as_str)
    }

    /// Most specific pattern matching `key`, as `(pattern, target)`.
    pub fn wildcard(&self, key: &str) -> Option<(&str, &str)> {
        self.wildcards
            .iter()
            .find(|w| w.regex.is_match(key))
            .map(|w| (w.pattern.as_str(), w.target.as_str()))
    }

    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcards.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Keys tried for an event: user, group, bot; prefixed before bare.
pub fn candidate_keys(event: &CanonicalEvent) -> Vec<String> {
    let mut keys = Vec::with_capacity(6);
    for (prefix, id) in [
        ("user_", &event.user_id),
        ("group_", &event.group_id),
        ("bot_", &event.self_id),
    ] {
        if id.is_empty() {
            continue;
        }
        keys.push(format!("{prefix}{id}"));
        keys.push(id.clone());
    }
    keys
}

pub struct RoutingResolver {
    workers: Arc<WorkerRegistry>,
    bots: Arc<BotRegistry>,
    store: SharedStore,
    static_rules: RwLock<RuleTable>,
    dynamic_rules: RwLock<RuleTable>,
    reload_interval: Duration,
}

impl RoutingResolver {
    pub fn new(
        workers: Arc<WorkerRegistry>,
        bots: Arc<BotRegistry>,
        store: SharedStore,
        static_rules: RuleTable,
        reload_interval: Duration,
    ) -> Self {
        Self {
            workers,
            bots,
            store,
            static_rules: RwLock::new(static_rules),
            dynamic_rules: RwLock::new(RuleTable::default()),
            reload_interval,
        }
    }

    /// Pick the Worker for a Bot event. First match wins.
    pub fn resolve(&self, event: &CanonicalEvent) -> RouteDecision {
        let decision = self.resolve_inner(event);
        counter!(ROUTE_DECISIONS_TOTAL, "strategy" => decision.strategy()).increment(1);
        debug!(
            strategy = decision.strategy(),
            worker_id = decision.worker_id().unwrap_or("-"),
            "route resolved"
        );
        decision
    }

    fn resolve_inner(&self, event: &CanonicalEvent) -> RouteDecision {
        let healthy = self.workers.list_healthy();

        if !event.text.is_empty() {
            // A trigger names the capability; any Worker advertising it qualifies.
            let mut triggered: Vec<String> = Vec::new();
            for worker in &healthy {
                if let Some(name) = worker.capabilities().trigger_match(&event.text) {
                    if !triggered.iter().any(|t| t == name) {
                        triggered.push(name.to_string());
                    }
                }
            }
            let matched: Vec<(&Arc<WorkerConnection>, &String)> = healthy
                .iter()
                .filter_map(|w| {
                    let caps = w.capabilities();
                    let name = triggered.iter().find(|name| caps.has(name))?;
                    Some((w, name))
                })
                .collect();
            if let Some((worker, capability)) = matched.choose(&mut rand::rng()) {
                return RouteDecision::Capability {
                    worker_id: worker.worker_id.clone(),
                    capability: (*capability).clone(),
                };
            }
        }

        if let Some(hint) = event.route_hint().filter(|h| !h.is_empty()) {
            let capable: Vec<&Arc<WorkerConnection>> = healthy
                .iter()
                .filter(|w| w.capabilities().has(hint))
                .collect();
            let worker_id = match capable.choose(&mut rand::rng()) {
                Some(worker) => worker.worker_id.clone(),
                None => hint.to_string(),
            };
            return RouteDecision::Hint { worker_id };
        }

        let keys = candidate_keys(event);

        for key in &keys {
            let target = self
                .lookup_exact(&self.dynamic_rules, key)
                .or_else(|| self.lookup_exact(&self.static_rules, key));
            if let Some(worker_id) = target {
                return RouteDecision::Exact {
                    worker_id,
                    key: key.clone(),
                };
            }
        }

        for key in &keys {
            let hit = self
                .lookup_wildcard(&self.dynamic_rules, key)
                .or_else(|| self.lookup_wildcard(&self.static_rules, key));
            if let Some((pattern, worker_id)) = hit {
                return RouteDecision::Wildcard { worker_id, pattern };
            }
        }

        RouteDecision::Unresolved
    }

    fn lookup_exact(&self, table: &RwLock<RuleTable>, key: &str) -> Option<String> {
        table.read().exact(key).map(str::to_owned)
    }

    fn lookup_wildcard(&self, table: &RwLock<RuleTable>, key: &str) -> Option<(String, String)> {
        table
            .read()
            .wildcard(key)
            .map(|(p, t)| (p.to_owned(), t.to_owned()))
    }

    /// Pick the Bot for a Worker action: explicit self-id, then the group's
    /// owning Bot, then any connected Bot.
    pub fn resolve_bot(&self, action: &CanonicalAction) -> Option<Arc<BotConnection>> {
        if !action.self_id.is_empty() {
            if let Some(bot) = self.bots.get(&action.self_id) {
                return Some(bot);
            }
            debug!(self_id = %action.self_id, "requested bot not connected");
        }
        if let Some(group_id) = action.group_id() {
            if let Some(bot) = self.bots.owner_of(&group_id).and_then(|o| self.bots.get(&o)) {
                return Some(bot);
            }
        }
        let fallback = self.bots.first()?;
        warn!(
            action = %action.action,
            self_id = %fallback.self_id(),
            "no bot matched action, falling back to first connected bot"
        );
        Some(fallback)
    }

    pub fn set_static(&self, key: &str, target: &str) {
        self.static_rules.write().insert(key, target);
    }

    pub fn remove_static(&self, key: &str) -> bool {
        self.static_rules.write().remove(key)
    }

    /// Write-through: store first, then the local table.
    pub async fn set_dynamic(&self, key: &str, target: &str) -> Result<(), StoreError> {
        self.store.hash_set(keys::ROUTING_RULES, key, target).await?;
        self.dynamic_rules.write().insert(key, target);
        Ok(())
    }

    pub async fn remove_dynamic(&self, key: &str) -> Result<bool, StoreError> {
        let removed = self.store.hash_delete(keys::ROUTING_RULES, key).await?;
        let _ = self.dynamic_rules.write().remove(key);
        Ok(removed)
    }

    /// Replace the dynamic table from the store. A failure keeps the old one.
    pub async fn reload(&self) -> Result<usize, StoreError> {
        match self.store.hash_get_all(keys::ROUTING_RULES).await {
            Ok(rules) => {
                let table = RuleTable::from_rules(rules);
                let count = table.len();
                *self.dynamic_rules.write() = table;
                counter!(ROUTING_RELOADS_TOTAL, "result" => "ok").increment(1);
                Ok(count)
            }
            Err(e) => {
                counter!(ROUTING_RELOADS_TOTAL, "result" => "error").increment(1);
                warn!(error = %e, "routing reload failed, keeping previous rules");
                Err(e)
            }
        }
    }

    pub fn dynamic_len(&self) -> usize {
        self.dynamic_rules.read().len()
    }

    pub async fn run_reload_loop(self: Arc<Self>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.reload_interval);
        info!(interval_ms = self.reload_interval.as_millis() as u64, "routing reload loop started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = tick.tick() => {
                    let _ = self.reload().await;
                }
            }
        }
    }
}
