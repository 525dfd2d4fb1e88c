//! Scheduler module: owns the engine, its worker pool and timer loop, and the
//! background tasks that persist results.

mod checks;
mod engine;
mod event_loop;
mod slot;
mod snapshot;
mod writer;

pub use checks::*;
pub use engine::*;
pub use event_loop::*;
pub use slot::*;
pub use snapshot::*;
pub use writer::*;

use crate::clock::Timestamp;
use crate::config::EngineConfig;
use crate::db::{DbError, Store, Target};
use crate::dns::{AddressFamily, ResolutionKind};
use crate::probe::{ProbeSet, RemoteReport};
use crate::work::{run_monitor, MonitorSettings, WorkQueue, WorkerPool};

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Point-in-time counters for the running engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    pub generation: u64,
    pub targets: usize,
    pub lookups: usize,
    pub workers: usize,
    pub idle_workers: usize,
    /// Units completed by the current workers
    pub completed: u64,
    pub queued: usize,
    pub suspended: usize,
    pub waiting: usize,
    pub timers: usize,
    pub off_schedule: u64,
    pub residence: Duration,
}

/// The main scheduler that orchestrates probe execution.
pub struct Scheduler {
    store: Arc<Store>,
    cfg: EngineConfig,
    engine: Arc<Engine>,
    queue: Arc<WorkQueue>,
    timers: Arc<EventLoop>,
    pool: Arc<WorkerPool>,
    stop_tx: broadcast::Sender<()>,
    writer_stop: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
    reload_lock: Mutex<()>,
}

impl Scheduler {
    /// Create a new scheduler with the given store.
    ///
    /// Spawns the batch writer, so this must run inside a tokio runtime.
    pub fn new(store: Arc<Store>, cfg: EngineConfig, probes: ProbeSet) -> Self {
        let (tx, rx) = mpsc::channel(1000);
        let (stop_tx, _) = broadcast::channel(1);
        let (writer_stop, writer_rx) = broadcast::channel(1);

        let queue = Arc::new(WorkQueue::new(cfg.ttl_threshold_percent));
        let timers = EventLoop::new(cfg.empty_poll_interval);
        let engine = Arc::new(Engine::new(cfg.clone(), queue.clone(), timers.clone(), probes, tx));
        let pool = Arc::new(WorkerPool::new(queue.clone(), engine.clone()));

        // Start batch writer in a separate task
        let writer = tokio::spawn(run_batch_writer(rx, store.clone(), writer_rx));

        Self {
            store,
            cfg,
            engine,
            queue,
            timers,
            pool,
            stop_tx,
            writer_stop,
            tasks: Mutex::new(Vec::new()),
            writer: Mutex::new(Some(writer)),
            reload_lock: Mutex::new(()),
        }
    }

    /// Start the scheduler and begin monitoring all targets.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let targets = self.store.get_targets()?;

        tracing::info!("Starting scheduler with {} targets", targets.len());

        self.pool.resize(self.cfg.initial_workers).await;
        self.timers.start(self.engine.clone());

        let snapshot = Snapshot::build(1, &targets, None, &self.cfg);
        match self.seed(&snapshot) {
            Ok(0) => {}
            Ok(n) => tracing::info!("Scheduler: restored {} lookups from the store", n),
            Err(e) => tracing::warn!("Scheduler: could not restore lookups: {}", e),
        }
        self.engine.install(snapshot);

        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(run_monitor(
            self.pool.clone(),
            self.queue.clone(),
            MonitorSettings::from_config(&self.cfg),
            self.stop_tx.subscribe(),
        )));
        if !self.cfg.result_retention.is_zero() {
            tasks.push(tokio::spawn(run_retention(
                self.store.clone(),
                self.cfg.result_retention,
                self.stop_tx.subscribe(),
            )));
        }

        Ok(())
    }

    /// Prime the cache with the last persisted result per lookup, so a
    /// restart does not re-resolve everything at once.
    fn seed(&self, snapshot: &Snapshot) -> Result<usize, DbError> {
        let keys = snapshot.cache.keys();
        if keys.is_empty() {
            return Ok(0);
        }

        let mut seeded = 0;
        for record in self.store.latest_dns_results()? {
            let Some(family) = AddressFamily::parse(&record.family) else {
                continue;
            };
            let kind = ResolutionKind::parse(&record.resolver);
            let addresses = if record.addresses.is_empty() {
                vec![family.unspecified()]
            } else {
                record.addresses.clone()
            };
            let result_time = Timestamp::from_utc(record.time);

            for key in keys
                .iter()
                .filter(|k| k.hostname == record.hostname && k.family == family && k.kind == kind)
            {
                if snapshot
                    .cache
                    .seed(key, addresses.iter().copied(), result_time, record.success)
                {
                    seeded += 1;
                }
            }
        }
        Ok(seeded)
    }

    /// Re-read targets from the store and publish them as a new generation.
    pub fn reload(&self) -> Result<u64, DbError> {
        let targets = self.store.get_targets()?;
        Ok(self.reload_targets(&targets))
    }

    /// Publish `targets` as the next generation. Returns its number.
    pub fn reload_targets(&self, targets: &[Target]) -> u64 {
        let _guard = self.reload_lock.lock();
        let previous = self.engine.snapshot();
        let generation = previous.generation + 1;
        let next = Snapshot::build(generation, targets, Some(&previous), &self.cfg);
        let installed = self.engine.install(next);
        tracing::info!(
            "Scheduler: loaded generation {} with {} targets",
            generation,
            installed.target_count()
        );
        generation
    }

    /// Accept a result reported by a remote check group.
    pub fn report_remote(&self, target_id: i64, report: RemoteReport) {
        self.engine.report_remote(target_id, report);
    }

    pub fn stats(&self) -> SchedulerStats {
        let snap = self.engine.snapshot();
        SchedulerStats {
            generation: snap.generation,
            targets: snap.target_count(),
            lookups: snap.cache.len(),
            workers: self.pool.size(),
            idle_workers: self.pool.count_idle(),
            completed: self.pool.completed(),
            queued: self.queue.len(),
            suspended: self.queue.suspended_len(),
            waiting: snap.checks.waiting_len(),
            timers: self.timers.len(),
            off_schedule: self.queue.off_schedule(),
            residence: self.queue.average_residence(),
        }
    }

    /// Stop scheduling, drain the workers and flush pending results.
    pub async fn shutdown(&self) {
        tracing::info!("Scheduler: shutting down");
        self.timers.shutdown().await;
        self.queue.shutdown();

        let _ = self.stop_tx.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                tracing::error!("Scheduler: background task failed: {}", e);
            }
        }

        self.pool.shutdown().await;

        let _ = self.writer_stop.send(());
        let writer = self.writer.lock().take();
        if let Some(writer) = writer {
            if let Err(e) = writer.await {
                tracing::error!("Scheduler: batch writer failed: {}", e);
            }
        }
    }
}
