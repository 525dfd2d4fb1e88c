//! Pool monitor: grows the pool on backlog, shrinks it after sustained idleness.

use super::{WorkQueue, WorkerPool};
use crate::config::EngineConfig;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Tuning for the monitor's control loop.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub min_workers: usize,
    pub max_workers: usize,
    pub frequency: Duration,
    pub stride_percent: usize,
    pub confirm_ticks: u32,
    pub work_per_thread: u64,
    /// Recycle workers after this many units; 0 disables recycling.
    pub recycle_after: u64,
    pub recycle_every_ticks: u64,
}

impl MonitorSettings {
    pub fn from_config(cfg: &EngineConfig) -> Self {
        Self {
            min_workers: cfg.min_workers,
            max_workers: cfg.max_workers.max(cfg.min_workers),
            frequency: cfg.monitor_frequency.max(Duration::from_millis(1)),
            stride_percent: cfg.stride_percent,
            confirm_ticks: cfg.shrink_confirm_ticks.max(1),
            work_per_thread: cfg.work_per_thread.max(1),
            recycle_after: cfg.recycle_after_checks,
            recycle_every_ticks: cfg.recycle_every_ticks.max(1),
        }
    }
}

/// What the control loop wants done this tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    Hold,
    Grow(usize),
    Shrink(usize),
}

/// Grow immediately on backlog; shrink only after `confirm_ticks`
/// consecutive idle ticks.
#[derive(Debug)]
pub struct Hysteresis {
    settings: MonitorSettings,
    idle_streak: u32,
}

impl Hysteresis {
    pub fn new(settings: MonitorSettings) -> Self {
        Self {
            settings,
            idle_streak: 0,
        }
    }

    pub fn tick(&mut self, backlog: u64, idle: usize, size: usize) -> Adjustment {
        let s = &self.settings;

        if backlog > 0 {
            self.idle_streak = 0;
            let wanted = backlog.div_ceil(s.work_per_thread) as usize;
            let target = size.saturating_add(wanted).min(s.max_workers);
            return if target > size {
                Adjustment::Grow(target)
            } else {
                Adjustment::Hold
            };
        }

        let idle_threshold = size * s.stride_percent / 100;
        if size > s.min_workers && idle > idle_threshold {
            self.idle_streak += 1;
            if self.idle_streak >= s.confirm_ticks {
                self.idle_streak = 0;
                let step = (size * s.stride_percent / 100).max(1);
                let target = size.saturating_sub(step).max(s.min_workers);
                return Adjustment::Shrink(target);
            }
            return Adjustment::Hold;
        }

        self.idle_streak = 0;
        Adjustment::Hold
    }
}

/// Run the monitor until `stop` fires.
pub async fn run_monitor(
    pool: Arc<WorkerPool>,
    queue: Arc<WorkQueue>,
    settings: MonitorSettings,
    mut stop: broadcast::Receiver<()>,
) {
    let recycle_after = settings.recycle_after;
    let recycle_every = settings.recycle_every_ticks;
    let mut interval = tokio::time::interval(settings.frequency);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut control = Hysteresis::new(settings);
    let mut ticks: u64 = 0;

    loop {
        tokio::select! {
            _ = stop.recv() => break,
            _ = interval.tick() => {
                ticks += 1;
                let backlog = queue.take_off_schedule() + queue.len() as u64;
                let idle = pool.count_idle();
                let size = pool.size();

                match control.tick(backlog, idle, size) {
                    Adjustment::Grow(target) => {
                        tracing::info!(
                            "PoolMonitor: backlog of {} with {} workers, growing to {}",
                            backlog, size, target
                        );
                        pool.resize(target).await;
                    }
                    Adjustment::Shrink(target) => {
                        tracing::info!(
                            "PoolMonitor: {} of {} workers idle, shrinking to {}",
                            idle, size, target
                        );
                        pool.resize(target).await;
                    }
                    Adjustment::Hold => {}
                }

                if recycle_after > 0 && ticks % recycle_every == 0 {
                    pool.recycle(recycle_after).await;
                }
            }
        }
    }
    tracing::debug!("PoolMonitor: stopped");
}
