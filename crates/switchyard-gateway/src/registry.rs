//! Live connection registries.
//!
//! Each map sits behind its own reader/writer lock. No method holds more than
//! one of these locks at a time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use switchyard_core::ConnId;

use crate::connection::{BotConnection, HealthPolicy, WorkerConnection};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rekey {
    Moved,
    Unchanged,
    NotRegistered,
    /// Another live connection already holds the new self-id.
    Taken,
}

/// Connected Bots keyed by self-id, plus the group → owning-Bot cache.
#[derive(Default)]
pub struct BotRegistry {
    bots: RwLock<HashMap<String, Arc<BotConnection>>>,
    group_owner: RwLock<HashMap<String, String>>,
}

impl BotRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a Bot, returning the connection it displaced, if any.
    pub fn register(&self, conn: Arc<BotConnection>) -> Option<Arc<BotConnection>> {
        let self_id = conn.self_id();
        let replaced = self.bots.write().insert(self_id.clone(), conn);
        if let Some(old) = &replaced {
            warn!(self_id, old_conn = %old.conn_id, "bot re-registered, replacing previous connection");
        }
        replaced
    }

    /// Move a Bot from `old` to `new` once its real self-id is known.
    ///
    /// A `new` id already held by a different connection is left alone.
    pub fn rekey(&self, old: &str, new: &str) -> Rekey {
        if old == new {
            return if self.bots.read().contains_key(old) {
                Rekey::Unchanged
            } else {
                Rekey::NotRegistered
            };
        }
        {
            let mut bots = self.bots.write();
            if let Some(holder) = bots.get(new) {
                warn!(self_id = new, holder = %holder.conn_id, "rekey refused, self-id held by another bot");
                return Rekey::Taken;
            }
            let Some(conn) = bots.remove(old) else {
                return Rekey::NotRegistered;
            };
            conn.set_self_id(new);
            let _ = bots.insert(new.to_string(), conn);
        }
        let mut owners = self.group_owner.write();
        for owner in owners.values_mut().filter(|o| o.as_str() == old) {
            *owner = new.to_string();
        }
        info!(old, new, "bot rekeyed");
        Rekey::Moved
    }

    /// Remove `self_id` only if it still maps to connection `conn_id`.
    pub fn remove(&self, self_id: &str, conn_id: &ConnId) -> bool {
        let mut bots = self.bots.write();
        match bots.get(self_id) {
            Some(existing) if &existing.conn_id == conn_id => {
                let _ = bots.remove(self_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, self_id: &str) -> Option<Arc<BotConnection>> {
        self.bots.read().get(self_id).cloned()
    }

    /// Lowest self-id among connected Bots.
    pub fn first(&self) -> Option<Arc<BotConnection>> {
        self.bots
            .read()
            .iter()
            .min_by(|a, b| a.0.cmp(b.0))
            .map(|(_, conn)| conn.clone())
    }

    pub fn note_group(&self, group_id: &str, self_id: &str) {
        if group_id.is_empty() || self_id.is_empty() {
            return;
        }
        let mut owners = self.group_owner.write();
        if owners.get(group_id).map(String::as_str) != Some(self_id) {
            let _ = owners.insert(group_id.to_string(), self_id.to_string());
        }
    }

    pub fn owner_of(&self, group_id: &str) -> Option<String> {
        self.group_owner.read().get(group_id).cloned()
    }

    pub fn list_healthy(&self, policy: &HealthPolicy) -> Vec<Arc<BotConnection>> {
        let mut bots: Vec<_> = self
            .bots
            .read()
            .values()
            .filter(|b| b.is_healthy(policy))
            .cloned()
            .collect();
        bots.sort_by_key(|b| b.self_id());
        bots
    }

    pub fn len(&self) -> usize {
        self.bots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.read().is_empty()
    }
}

/// Connected Workers keyed by worker id.
#[derive(Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<String, Arc<WorkerConnection>>>,
    policy: HealthPolicy,
}

impl WorkerRegistry {
    pub fn new(policy: HealthPolicy) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            policy,
        }
    }

    pub fn policy(&self) -> &HealthPolicy {
        &self.policy
    }

    pub fn register(&self, conn: Arc<WorkerConnection>) -> Option<Arc<WorkerConnection>> {
        let worker_id = conn.worker_id.clone();
        let replaced = self.workers.write().insert(worker_id.clone(), conn);
        if let Some(old) = &replaced {
            warn!(worker_id, old_conn = %old.conn_id, "worker re-registered, replacing previous connection");
        }
        replaced
    }

    /// Remove `worker_id` only if it still maps to connection `conn_id`.
    pub fn remove(&self, worker_id: &str, conn_id: &ConnId) -> bool {
        let mut workers = self.workers.write();
        match workers.get(worker_id) {
            Some(existing) if &existing.conn_id == conn_id => {
                let _ = workers.remove(worker_id);
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, worker_id: &str) -> Option<Arc<WorkerConnection>> {
        self.workers.read().get(worker_id).cloned()
    }

    /// Healthy Workers ordered by id.
    pub fn list_healthy(&self) -> Vec<Arc<WorkerConnection>> {
        let mut workers: Vec<_> = self
            .workers
            .read()
            .values()
            .filter(|w| w.is_healthy(&self.policy))
            .cloned()
            .collect();
        workers.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        workers
    }

    pub fn len(&self) -> usize {
        self.workers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.read().is_empty()
    }
}
