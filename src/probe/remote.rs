//! Results reported by remote check groups.

use crate::clock::Timestamp;

use dashmap::DashMap;

/// One result a remote check group reported for a target.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteReport {
    pub group: String,
    pub time: Timestamp,
    pub success: bool,
    /// Latency in nanoseconds, or -1.0 for timeout
    pub latency: f64,
    pub reason: Option<String>,
}

/// Latest report per target, waiting for the target's next remote check.
#[derive(Debug, Default)]
pub struct RemoteInbox {
    reports: DashMap<i64, RemoteReport>,
}

impl RemoteInbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a report, replacing any older unconsumed one.
    pub fn deposit(&self, target_id: i64, report: RemoteReport) {
        self.reports
            .entry(target_id)
            .and_modify(|existing| {
                if report.time >= existing.time {
                    *existing = report.clone();
                }
            })
            .or_insert_with(|| report.clone());
    }

    pub fn take(&self, target_id: i64) -> Option<RemoteReport> {
        self.reports.remove(&target_id).map(|(_, report)| report)
    }

    pub fn len(&self) -> usize {
        self.reports.len()
    }
}
