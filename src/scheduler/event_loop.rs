//! Timer loop: a min-heap of future checks, dispatched when they fall due.

use crate::clock::Timestamp;
use crate::dns::LookupKey;

use parking_lot::Mutex;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// What a timer re-evaluates when it fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventTarget {
    Dns(LookupKey),
    Check(i64),
}

#[derive(Debug, Clone)]
pub struct TimerEvent {
    pub fire: Timestamp,
    seq: u64,
    pub target: EventTarget,
}

impl PartialEq for TimerEvent {
    fn eq(&self, other: &Self) -> bool {
        self.fire == other.fire && self.seq == other.seq
    }
}

impl Eq for TimerEvent {}

impl PartialOrd for TimerEvent {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEvent {
    // Ties fire in arming order
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.fire
            .cmp(&other.fire)
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

/// Receives timers as they fire.
pub trait Dispatch: Send + Sync + 'static {
    fn dispatch(&self, fired: Timestamp, target: EventTarget);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Dispatching,
    Stopped,
}

pub struct EventLoop {
    heap: Mutex<BinaryHeap<Reverse<TimerEvent>>>,
    seq: AtomicU64,
    wake: Notify,
    stop: AtomicBool,
    state: Mutex<LoopState>,
    empty_poll: Duration,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    pub fn new(empty_poll: Duration) -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(BinaryHeap::new()),
            seq: AtomicU64::new(0),
            wake: Notify::new(),
            stop: AtomicBool::new(false),
            state: Mutex::new(LoopState::Idle),
            empty_poll,
            handle: Mutex::new(None),
        })
    }

    pub fn start(self: &Arc<Self>, dispatcher: Arc<dyn Dispatch>) {
        let this = self.clone();
        let handle = tokio::spawn(async move { this.run(dispatcher).await });
        *self.handle.lock() = Some(handle);
    }

    /// Schedule `target` for re-evaluation at `fire`.
    ///
    /// Wakes the loop if the new timer is now the earliest.
    pub fn arm(&self, fire: Timestamp, target: EventTarget) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let preempt = {
            let mut heap = self.heap.lock();
            let earliest = heap.peek().map(|Reverse(top)| top.fire);
            heap.push(Reverse(TimerEvent { fire, seq, target }));
            earliest.map_or(true, |top| fire < top)
        };
        if preempt {
            self.wake.notify_one();
        }
    }

    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    pub fn next_fire(&self) -> Option<Timestamp> {
        self.heap.lock().peek().map(|Reverse(top)| top.fire)
    }

    pub fn state(&self) -> LoopState {
        *self.state.lock()
    }

    fn set_state(&self, state: LoopState) {
        *self.state.lock() = state;
    }

    fn pop_due(&self, now: Timestamp) -> Option<TimerEvent> {
        let mut heap = self.heap.lock();
        match heap.peek() {
            Some(Reverse(top)) if top.fire <= now => heap.pop().map(|Reverse(event)| event),
            _ => None,
        }
    }

    async fn run(&self, dispatcher: Arc<dyn Dispatch>) {
        tracing::debug!("EventLoop: started");
        while !self.stop.load(Ordering::SeqCst) {
            self.set_state(LoopState::Idle);
            let now = Timestamp::now();
            let idle_until = now + self.empty_poll;
            let deadline = self.next_fire().map_or(idle_until, |next| next.min(idle_until));

            tokio::select! {
                _ = tokio::time::sleep_until(deadline.to_instant()) => {}
                _ = self.wake.notified() => {}
            }
            if self.stop.load(Ordering::SeqCst) {
                break;
            }

            self.set_state(LoopState::Dispatching);
            let now = Timestamp::now();
            // The heap lock is released before each dispatch, which may re-arm
            while let Some(event) = self.pop_due(now) {
                dispatcher.dispatch(event.fire, event.target);
            }
        }
        self.set_state(LoopState::Stopped);
        tracing::debug!("EventLoop: stopped with {} timers pending", self.len());
    }

    /// Stop the loop and wait for it to exit.
    pub async fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_one();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("EventLoop: task failed: {}", e);
            }
        }
        self.set_state(LoopState::Stopped);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        fired: Mutex<Vec<(Timestamp, EventTarget)>>,
    }

    impl Dispatch for Recorder {
        fn dispatch(&self, fired: Timestamp, target: EventTarget) {
            self.fired.lock().push((fired, target));
        }
    }

    fn ids(recorder: &Recorder) -> Vec<i64> {
        recorder
            .fired
            .lock()
            .iter()
            .filter_map(|(_, target)| match target {
                EventTarget::Check(id) => Some(*id),
                EventTarget::Dns(_) => None,
            })
            .collect()
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fires_in_time_order() {
        let timers = EventLoop::new(Duration::from_secs(60));
        let recorder = Arc::new(Recorder::default());
        timers.start(recorder.clone());

        let now = Timestamp::now();
        timers.arm(now + Duration::from_secs(3), EventTarget::Check(3));
        timers.arm(now + Duration::from_secs(1), EventTarget::Check(1));
        timers.arm(now + Duration::from_secs(2), EventTarget::Check(2));
        assert_eq!(timers.len(), 3);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        settle().await;
        assert_eq!(ids(&recorder), vec![1]);

        tokio::time::sleep(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(ids(&recorder), vec![1, 2, 3]);
        assert_eq!(timers.len(), 0);

        // Each event is dispatched with the time it was armed for
        let fired = recorder.fired.lock()[0].0;
        assert_eq!(fired, now + Duration::from_secs(1));

        timers.shutdown().await;
        assert_eq!(timers.state(), LoopState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sooner_timer_preempts_sleep() {
        let timers = EventLoop::new(Duration::from_secs(60));
        let recorder = Arc::new(Recorder::default());
        timers.start(recorder.clone());

        let now = Timestamp::now();
        timers.arm(now + Duration::from_secs(30), EventTarget::Check(30));
        settle().await;
        assert_eq!(timers.state(), LoopState::Idle);

        // The loop is asleep until +30s; a +1s timer must still fire on time
        timers.arm(now + Duration::from_secs(1), EventTarget::Check(1));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        settle().await;
        assert_eq!(ids(&recorder), vec![1]);
        assert_eq!(timers.next_fire(), Some(now + Duration::from_secs(30)));

        timers.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_past_due_fires_immediately() {
        let timers = EventLoop::new(Duration::from_secs(60));
        let recorder = Arc::new(Recorder::default());
        timers.start(recorder.clone());
        settle().await;

        let key = LookupKey::new(
            "svc.example.com",
            crate::dns::ResolutionKind::System,
            crate::dns::AddressFamily::V4,
            "tcp",
        );
        timers.arm(Timestamp::now(), EventTarget::Dns(key.clone()));
        settle().await;
        assert_eq!(recorder.fired.lock().len(), 1);
        assert_eq!(recorder.fired.lock()[0].1, EventTarget::Dns(key));

        timers.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_wakes_idle_loop() {
        let timers = EventLoop::new(Duration::from_secs(3600));
        timers.start(Arc::new(Recorder::default()));
        settle().await;
        timers.shutdown().await;
        assert_eq!(timers.state(), LoopState::Stopped);
    }
}
