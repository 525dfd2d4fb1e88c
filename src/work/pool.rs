//! Dynamically sized pool of workers draining the work queue.

use super::{CheckUnit, WorkQueue};

use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs one check unit to completion (or to suspension).
pub trait UnitHandler: Send + Sync + 'static {
    fn handle(&self, unit: CheckUnit) -> BoxFuture<'_, ()>;
}

struct PoolWorker {
    id: usize,
    handle: JoinHandle<()>,
    stop: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
}

impl PoolWorker {
    fn spawn(id: usize, queue: Arc<WorkQueue>, handler: Arc<dyn UnitHandler>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let busy = Arc::new(AtomicBool::new(false));
        let completed = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn(run_worker(
            id,
            queue,
            handler,
            stop.clone(),
            busy.clone(),
            completed.clone(),
        ));

        Self {
            id,
            handle,
            stop,
            busy,
            completed,
        }
    }
}

async fn run_worker(
    id: usize,
    queue: Arc<WorkQueue>,
    handler: Arc<dyn UnitHandler>,
    stop: Arc<AtomicBool>,
    busy: Arc<AtomicBool>,
    completed: Arc<AtomicU64>,
) {
    tracing::debug!("Worker {}: started", id);
    while let Some(unit) = queue.take(&stop).await {
        busy.store(true, Ordering::SeqCst);
        handler.handle(unit).await;
        completed.fetch_add(1, Ordering::Relaxed);
        busy.store(false, Ordering::SeqCst);
    }
    tracing::debug!(
        "Worker {}: exiting after {} units",
        id,
        completed.load(Ordering::Relaxed)
    );
}

/// A resizable set of workers.
pub struct WorkerPool {
    queue: Arc<WorkQueue>,
    handler: Arc<dyn UnitHandler>,
    workers: Mutex<Vec<PoolWorker>>,
    next_id: AtomicUsize,
}

impl WorkerPool {
    pub fn new(queue: Arc<WorkQueue>, handler: Arc<dyn UnitHandler>) -> Self {
        Self {
            queue,
            handler,
            workers: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        }
    }

    fn spawn_worker(&self) -> PoolWorker {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        PoolWorker::spawn(id, self.queue.clone(), self.handler.clone())
    }

    pub fn size(&self) -> usize {
        self.workers.lock().len()
    }

    /// Workers blocked waiting for work rather than executing a unit.
    pub fn count_idle(&self) -> usize {
        self.workers
            .lock()
            .iter()
            .filter(|w| !w.busy.load(Ordering::SeqCst))
            .count()
    }

    /// Units completed by the current workers. Recycled workers' counts are gone.
    pub fn completed(&self) -> u64 {
        self.workers
            .lock()
            .iter()
            .map(|w| w.completed.load(Ordering::Relaxed))
            .sum()
    }

    /// Grow or shrink to `target` workers.
    ///
    /// Shrinking waits for the removed workers to finish their current unit.
    pub async fn resize(&self, target: usize) {
        let (before, removed) = {
            let mut workers = self.workers.lock();
            let before = workers.len();
            if target >= before {
                for _ in before..target {
                    let worker = self.spawn_worker();
                    workers.push(worker);
                }
                (before, Vec::new())
            } else {
                (before, workers.split_off(target))
            }
        };

        if before != target {
            tracing::info!("WorkerPool: resizing from {} to {} workers", before, target);
        }
        self.retire(removed).await;
    }

    async fn retire(&self, workers: Vec<PoolWorker>) {
        if workers.is_empty() {
            return;
        }
        for worker in &workers {
            worker.stop.store(true, Ordering::SeqCst);
        }
        self.queue.cycle();
        for worker in workers {
            if let Err(e) = worker.handle.await {
                tracing::error!("WorkerPool: worker {} failed: {}", worker.id, e);
            }
        }
    }

    /// Replace workers that have completed at least `threshold` units.
    ///
    /// Returns how many were replaced.
    pub async fn recycle(&self, threshold: u64) -> usize {
        let old = {
            let mut workers = self.workers.lock();
            let mut old = Vec::new();
            for i in 0..workers.len() {
                if workers[i].completed.load(Ordering::Relaxed) >= threshold {
                    let fresh = self.spawn_worker();
                    old.push(std::mem::replace(&mut workers[i], fresh));
                }
            }
            old
        };

        let count = old.len();
        if count > 0 {
            tracing::info!("WorkerPool: recycling {} workers", count);
        }
        self.retire(old).await;
        count
    }

    /// Stop every worker. The queue should already be shut down.
    pub async fn shutdown(&self) {
        let all = std::mem::take(&mut *self.workers.lock());
        self.retire(all).await;
    }
}
