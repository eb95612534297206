use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use switchyard_telemetry::metric_names::POOL_DROPS_TOTAL;

/// Bounded spawner for fire-and-forget side effects.
///
/// When every permit is taken, [`TaskPool::spawn`] drops the task and
/// [`TaskPool::spawn_queued`] parks it until a permit frees up.
#[derive(Clone)]
pub struct TaskPool {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl TaskPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Spawn `fut` if a permit is free. Returns `false` when it was dropped.
    pub fn spawn<F>(&self, label: &'static str, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            counter!(POOL_DROPS_TOTAL, "task" => label).increment(1);
            warn!(task = label, capacity = self.capacity, "background pool saturated, dropping task");
            return false;
        };
        drop(tokio::spawn(async move {
            fut.await;
            drop(permit);
        }));
        true
    }

    /// Spawn `fut` as soon as a permit is free. For rare writes that must
    /// not be lost.
    pub fn spawn_queued<F>(&self, label: &'static str, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = self.permits.clone();
        drop(tokio::spawn(async move {
            let permit = match permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => {
                    debug!(task = label, "background pool saturated, waiting for a permit");
                    match permits.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            warn!(task = label, "background pool closed, task abandoned");
                            return;
                        }
                    }
                }
            };
            fut.await;
            drop(permit);
        }));
    }

    pub fn in_use(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn saturated_pool_drops() {
        let pool = TaskPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        assert!(pool.spawn("hold", async move {
            let _ = release_rx.await;
        }));
        assert_eq!(pool.in_use(), 1);
        assert!(!pool.spawn("dropped", async {}));

        release_tx.send(()).unwrap();
        while pool.in_use() > 0 {
            tokio::task::yield_now().await;
        }
        assert!(pool.spawn("after", async {}));
    }

    #[tokio::test]
    async fn queued_task_waits_for_permit() {
        let pool = TaskPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        assert!(pool.spawn("hold", async move {
            let _ = release_rx.await;
        }));

        let (done_tx, mut done_rx) = oneshot::channel();
        pool.spawn_queued("queued", async move {
            let _ = done_tx.send(());
        });
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(done_rx.try_recv().is_err());

        release_tx.send(()).unwrap();
        done_rx.await.unwrap();
    }

    #[tokio::test]
    async fn tasks_run() {
        let pool = TaskPool::new(4);
        let hits = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = oneshot::channel();
        let h = hits.clone();
        assert!(pool.spawn("count", async move {
            let _ = h.fetch_add(1, Ordering::SeqCst);
            let _ = done_tx.send(());
        }));
        done_rx.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
