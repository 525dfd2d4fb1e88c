//! Work queue feeding the worker pool.
//!
//! Ready units wait in a FIFO. Units blocked on an asynchronous callback sit
//! in a separate continuation table until the callback resumes them.

use super::{CheckUnit, UnitId};
use crate::clock::Timestamp;

use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

struct Queued {
    unit: CheckUnit,
    enqueued: Timestamp,
}

#[derive(Default)]
struct Continuations {
    suspended: HashMap<UnitId, CheckUnit>,
    /// Resumes that arrived before the unit was suspended.
    early: HashSet<UnitId>,
}

pub struct WorkQueue {
    ready: Mutex<VecDeque<Queued>>,
    continuations: Mutex<Continuations>,
    available: Notify,
    shutdown: AtomicBool,
    off_schedule: AtomicU64,
    /// Rolling average of time spent in the ready FIFO, in milliseconds.
    residence_ms: AtomicU64,
    ttl_threshold_percent: u32,
}

impl WorkQueue {
    pub fn new(ttl_threshold_percent: u32) -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            continuations: Mutex::new(Continuations::default()),
            available: Notify::new(),
            shutdown: AtomicBool::new(false),
            off_schedule: AtomicU64::new(0),
            residence_ms: AtomicU64::new(0),
            ttl_threshold_percent,
        }
    }

    /// Push a unit onto the ready FIFO and wake one consumer.
    pub fn insert(&self, unit: CheckUnit) {
        if self.is_shutdown() {
            tracing::debug!("WorkQueue: dropping unit {} after shutdown", unit.id());
            return;
        }
        self.ready.lock().push_back(Queued {
            unit,
            enqueued: Timestamp::now(),
        });
        self.available.notify_one();
    }

    /// Park a unit until `resume` is called with its id.
    pub fn suspend(&self, unit: CheckUnit) {
        let mut cont = self.continuations.lock();
        if cont.early.remove(&unit.id()) {
            drop(cont);
            self.insert(unit);
            return;
        }
        cont.suspended.insert(unit.id(), unit);
    }

    /// Move a suspended unit back onto the ready FIFO.
    ///
    /// A resume that beats its suspend is remembered, so the unit is
    /// re-queued exactly once either way.
    pub fn resume(&self, id: UnitId) {
        let mut cont = self.continuations.lock();
        match cont.suspended.remove(&id) {
            Some(unit) => {
                drop(cont);
                self.insert(unit);
            }
            None => {
                cont.early.insert(id);
            }
        }
    }

    /// Drop any remembered early resume for a unit that has finished.
    pub fn forget(&self, id: UnitId) {
        self.continuations.lock().early.remove(&id);
    }

    /// Wait for the next ready unit.
    ///
    /// Returns `None` once the queue shuts down or `cancel` is set.
    pub async fn take(&self, cancel: &AtomicBool) -> Option<CheckUnit> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            // Register before checking state so a wakeup in between is not lost
            notified.as_mut().enable();

            if self.is_shutdown() || cancel.load(Ordering::SeqCst) {
                return None;
            }

            let next = self.ready.lock().pop_front();
            if let Some(queued) = next {
                self.record_exit(&queued);
                return Some(queued.unit);
            }

            notified.await;
        }
    }

    fn record_exit(&self, queued: &Queued) {
        let now = Timestamp::now();
        let residence = (now - queued.enqueued).as_millis() as u64;
        let _ = self
            .residence_ms
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |avg| {
                Some((avg * 7 + residence) / 8)
            });

        if queued.unit.is_off_schedule(now, self.ttl_threshold_percent) {
            self.off_schedule.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Wake every blocked consumer without adding work.
    pub fn cycle(&self) {
        self.available.notify_waiters();
    }

    /// Release all consumers for good.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.available.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.ready.lock().len()
    }

    pub fn suspended_len(&self) -> usize {
        self.continuations.lock().suspended.len()
    }

    pub fn off_schedule(&self) -> u64 {
        self.off_schedule.load(Ordering::Relaxed)
    }

    /// Read and reset the off-schedule counter.
    pub fn take_off_schedule(&self) -> u64 {
        self.off_schedule.swap(0, Ordering::Relaxed)
    }

    pub fn average_residence(&self) -> Duration {
        Duration::from_millis(self.residence_ms.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{UnitTarget, WorkKind};
    use std::sync::Arc;

    fn unit(target_id: i64) -> CheckUnit {
        CheckUnit::new(
            WorkKind::HealthCheck,
            UnitTarget::Check { target_id, addresses: vec![] },
            1,
            Timestamp::now(),
            Duration::from_secs(10),
        )
    }

    fn target_of(unit: &CheckUnit) -> i64 {
        match unit.target() {
            UnitTarget::Check { target_id, .. } => *target_id,
            UnitTarget::Lookup(_) => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = WorkQueue::new(10);
        let cancel = AtomicBool::new(false);
        for id in [1, 2, 3] {
            queue.insert(unit(id));
        }
        assert_eq!(queue.len(), 3);
        for id in [1, 2, 3] {
            let taken = queue.take(&cancel).await.unwrap();
            assert_eq!(target_of(&taken), id);
        }
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test]
    async fn test_suspend_resume_delivers_once() {
        let queue = WorkQueue::new(10);
        let cancel = AtomicBool::new(false);
        let parked = unit(9);
        let id = parked.id();

        queue.suspend(parked);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.suspended_len(), 1);

        queue.resume(id);
        queue.resume(id);
        assert_eq!(queue.suspended_len(), 0);
        assert_eq!(queue.len(), 1);

        let taken = queue.take(&cancel).await.unwrap();
        assert_eq!(taken.id(), id);
        assert_eq!(queue.len(), 0);

        // The duplicate resume is dropped once the unit finishes
        queue.forget(id);
        queue.suspend(taken);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.suspended_len(), 1);
    }

    #[tokio::test]
    async fn test_resume_before_suspend() {
        let queue = WorkQueue::new(10);
        let parked = unit(4);
        let id = parked.id();

        queue.resume(id);
        queue.suspend(parked);
        assert_eq!(queue.suspended_len(), 0);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_forget_clears_unmatched_resume() {
        let queue = WorkQueue::new(10);
        let parked = unit(6);
        let id = parked.id();

        queue.resume(id);
        queue.forget(id);
        queue.suspend(parked);
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.suspended_len(), 1);
    }

    #[tokio::test]
    async fn test_take_wakes_on_insert() {
        let queue = Arc::new(WorkQueue::new(10));
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move {
                let cancel = AtomicBool::new(false);
                queue.take(&cancel).await.map(|u| target_of(&u))
            })
        };
        tokio::task::yield_now().await;
        queue.insert(unit(5));
        assert_eq!(consumer.await.unwrap(), Some(5));
    }

    #[tokio::test]
    async fn test_cycle_releases_cancelled_consumer() {
        let queue = Arc::new(WorkQueue::new(10));
        let cancel = Arc::new(AtomicBool::new(false));
        let consumer = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.take(&cancel).await.is_none() })
        };
        tokio::task::yield_now().await;
        cancel.store(true, Ordering::SeqCst);
        queue.cycle();
        assert!(consumer.await.unwrap());
    }

    #[tokio::test]
    async fn test_shutdown_releases_everyone() {
        let queue = Arc::new(WorkQueue::new(10));
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let cancel = AtomicBool::new(false);
                    queue.take(&cancel).await.is_none()
                })
            })
            .collect();
        tokio::task::yield_now().await;
        queue.shutdown();
        for consumer in consumers {
            assert!(consumer.await.unwrap());
        }

        queue.insert(unit(1));
        let cancel = AtomicBool::new(false);
        assert!(queue.take(&cancel).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_off_schedule_counted_on_exit() {
        let queue = WorkQueue::new(10);
        let cancel = AtomicBool::new(false);
        queue.insert(unit(1));
        queue.insert(unit(2));

        queue.take(&cancel).await.unwrap();
        assert_eq!(queue.off_schedule(), 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        queue.take(&cancel).await.unwrap();
        assert_eq!(queue.take_off_schedule(), 1);
        assert_eq!(queue.off_schedule(), 0);
        assert!(queue.average_residence() > Duration::ZERO);
    }
}
