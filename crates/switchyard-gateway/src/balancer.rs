use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::connection::WorkerConnection;

/// Picks a Worker when no rule named one.
///
/// Order of preference: a Worker that has handled nothing yet (round-robin
/// among them), lowest average process time, lowest average RTT, then plain
/// round-robin.
#[derive(Debug, Default)]
pub struct LoadBalancer {
    cursor: AtomicUsize,
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self::default()
    }

    fn round_robin<'a>(&self, pool: &[&'a Arc<WorkerConnection>]) -> &'a Arc<WorkerConnection> {
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % pool.len();
        pool[i]
    }

    pub fn select(&self, candidates: &[Arc<WorkerConnection>]) -> Option<Arc<WorkerConnection>> {
        let mut sorted: Vec<&Arc<WorkerConnection>> = candidates.iter().collect();
        sorted.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));

        match sorted.len() {
            0 => return None,
            1 => return Some(sorted[0].clone()),
            _ => {}
        }

        let idle: Vec<_> = sorted
            .iter()
            .copied()
            .filter(|w| w.handled_count() == 0)
            .collect();
        if !idle.is_empty() {
            return Some(self.round_robin(&idle).clone());
        }

        if let Some(fastest) = sorted
            .iter()
            .filter_map(|w| w.avg_process_time().map(|d| (d, *w)))
            .min_by_key(|(d, _)| *d)
        {
            return Some(fastest.1.clone());
        }

        if let Some(nearest) = sorted
            .iter()
            .filter_map(|w| w.avg_rtt().map(|d| (d, *w)))
            .min_by_key(|(d, _)| *d)
        {
            return Some(nearest.1.clone());
        }

        Some(self.round_robin(&sorted).clone())
    }
}
