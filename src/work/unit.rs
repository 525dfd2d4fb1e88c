//! Check units: the schedulable work items moved between queue, continuation
//! table and workers.

use crate::clock::Timestamp;
use crate::dns::LookupKey;
use crate::probe::{ProbeError, RemoteReport};
use crate::scheduler::QueryRefused;

use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::oneshot::{self, error::TryRecvError};

static NEXT_UNIT_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of a check unit, used to key the continuation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitId(u64);

impl UnitId {
    fn next() -> Self {
        UnitId(NEXT_UNIT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkKind {
    DnsLookup,
    HealthCheck,
    RemoteCheck,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStatus {
    Idle,
    InProgress,
    Complete,
    CompleteRemote,
}

/// What a unit works on.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitTarget {
    Lookup(LookupKey),
    Check {
        target_id: i64,
        addresses: Vec<IpAddr>,
    },
}

/// Result of probing one address.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressOutcome {
    pub address: IpAddr,
    /// Latency in nanoseconds.
    pub result: Result<f64, ProbeError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum UnitOutcome {
    Resolved(Result<Vec<IpAddr>, ProbeError>),
    Probed(Vec<AddressOutcome>),
    Reported(Option<RemoteReport>),
    /// The unit never ran: the owning slot refused to start it.
    Refused(QueryRefused),
    /// Completed without probing, e.g. its hostname did not resolve.
    Failed(String),
}

/// A unit of schedulable work. Not `Clone`: exactly one owner at a time.
#[derive(Debug)]
pub struct CheckUnit {
    id: UnitId,
    kind: WorkKind,
    target: UnitTarget,
    version: u64,
    scheduled_start: Timestamp,
    scheduled_end: Timestamp,
    status: UnitStatus,
    pending: Option<oneshot::Receiver<UnitOutcome>>,
    outcome: Option<UnitOutcome>,
}

impl CheckUnit {
    pub fn new(
        kind: WorkKind,
        target: UnitTarget,
        version: u64,
        scheduled_start: Timestamp,
        window: Duration,
    ) -> Self {
        Self {
            id: UnitId::next(),
            kind,
            target,
            version,
            scheduled_start,
            scheduled_end: scheduled_start + window,
            status: UnitStatus::Idle,
            pending: None,
            outcome: None,
        }
    }

    pub fn lookup(key: LookupKey, version: u64, window: Duration) -> Self {
        Self::new(
            WorkKind::DnsLookup,
            UnitTarget::Lookup(key),
            version,
            Timestamp::now(),
            window,
        )
    }

    pub fn id(&self) -> UnitId {
        self.id
    }

    pub fn kind(&self) -> WorkKind {
        self.kind
    }

    pub fn target(&self) -> &UnitTarget {
        &self.target
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn scheduled_start(&self) -> Timestamp {
        self.scheduled_start
    }

    pub fn scheduled_end(&self) -> Timestamp {
        self.scheduled_end
    }

    pub fn status(&self) -> UnitStatus {
        self.status
    }

    /// Whether the unit started later than `threshold_percent` of its window.
    pub fn is_off_schedule(&self, now: Timestamp, threshold_percent: u32) -> bool {
        let window = self.scheduled_end - self.scheduled_start;
        let grace = window.mul_f64(f64::from(threshold_percent) / 100.0);
        now > self.scheduled_start + grace
    }

    /// Hand the unit's work to an asynchronous operation that will deliver
    /// its outcome through `rx`.
    pub fn await_outcome(&mut self, rx: oneshot::Receiver<UnitOutcome>) {
        self.status = UnitStatus::InProgress;
        self.pending = Some(rx);
    }

    pub fn complete(&mut self, outcome: UnitOutcome) {
        self.pending = None;
        self.status = match self.kind {
            WorkKind::RemoteCheck => UnitStatus::CompleteRemote,
            _ => UnitStatus::Complete,
        };
        self.outcome = Some(outcome);
    }

    /// Re-check an in-progress unit without restarting its work.
    pub fn poll(&mut self) -> UnitStatus {
        let Some(rx) = self.pending.as_mut() else {
            return self.status;
        };
        match rx.try_recv() {
            Ok(outcome) => self.complete(outcome),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Closed) => {
                self.complete(UnitOutcome::Failed("probe task ended without a result".to_string()))
            }
        }
        self.status
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.status, UnitStatus::Complete | UnitStatus::CompleteRemote)
    }

    pub fn take_outcome(&mut self) -> Option<UnitOutcome> {
        self.outcome.take()
    }
}
