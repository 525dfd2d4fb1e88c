//! Health-check slots and the wait-list of checks blocked on DNS.

use super::{QueryDecision, QueryRefused, QueryState, ScheduleSlot};
use crate::clock::Timestamp;
use crate::work::AddressOutcome;

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Duration;

/// Last known outcome for one address of a target.
#[derive(Debug, Clone, PartialEq)]
pub struct AddressState {
    pub time: Timestamp,
    pub success: bool,
    /// Latency in nanoseconds, or -1.0 for failure
    pub latency: f64,
}

#[derive(Debug, Clone)]
struct CheckEntry {
    slot: ScheduleSlot,
    addresses: BTreeMap<IpAddr, AddressState>,
}

/// Health-check state for one configuration generation.
#[derive(Debug)]
pub struct CheckList {
    generation: u64,
    entries: DashMap<i64, CheckEntry>,
    /// Checks parked until their hostname resolves, keyed by hostname.
    waiting: Mutex<HashMap<String, BTreeSet<i64>>>,
}

impl CheckList {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            entries: DashMap::new(),
            waiting: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn ids(&self) -> Vec<i64> {
        self.entries.iter().map(|e| *e.key()).collect()
    }

    pub fn insert(&self, target_id: i64, interval: Duration, timeout: Duration) {
        self.entries
            .entry(target_id)
            .and_modify(|e| e.slot.narrow(interval, timeout))
            .or_insert_with(|| CheckEntry {
                slot: ScheduleSlot::new(interval, timeout, self.generation),
                addresses: BTreeMap::new(),
            });
    }

    /// Carry schedule history and address state over from the previous generation.
    pub fn inherit(&self, previous: &CheckList) {
        for mut entry in self.entries.iter_mut() {
            if let Some(old) = previous.entries.get(entry.key()) {
                let generation = self.generation;
                let entry = entry.value_mut();
                entry.slot.inherit(&old.slot, generation);
                entry.addresses = old.addresses.clone();
            }
        }
    }

    pub fn state(&self, target_id: i64) -> Option<QueryState> {
        self.entries.get(&target_id).map(|e| e.slot.state())
    }

    pub fn slot(&self, target_id: i64) -> Option<ScheduleSlot> {
        self.entries.get(&target_id).map(|e| e.slot.clone())
    }

    pub fn query_needed(&self, target_id: i64) -> QueryDecision {
        let now = Timestamp::now();
        match self.entries.get_mut(&target_id) {
            Some(mut entry) => entry.slot.query_needed(now, self.generation),
            None => QueryDecision::Ignore,
        }
    }

    pub fn release_event(&self, target_id: i64, fired: Timestamp) {
        if let Some(mut entry) = self.entries.get_mut(&target_id) {
            entry.slot.release_event(fired);
        }
    }

    /// Mark a check in progress. Unknown targets count as stale.
    pub fn start(&self, target_id: i64, expected_version: u64) -> Result<Timestamp, QueryRefused> {
        let stale = QueryRefused::Stale {
            expected: expected_version,
            current: self.generation,
        };
        if expected_version != self.generation {
            return Err(stale);
        }
        match self.entries.get_mut(&target_id) {
            Some(mut entry) => entry.slot.start(Timestamp::now(), self.generation),
            None => Err(stale),
        }
    }

    /// Record a finished check and return when the next is due.
    pub fn finish(&self, target_id: i64, success: bool) -> Option<Timestamp> {
        let now = Timestamp::now();
        self.entries
            .get_mut(&target_id)
            .map(|mut e| e.slot.finish(now, success, self.generation))
    }

    /// Store per-address outcomes, discarding those for expired addresses.
    ///
    /// Returns the outcomes that were kept.
    pub fn record(
        &self,
        target_id: i64,
        outcomes: Vec<AddressOutcome>,
        expired: &BTreeSet<IpAddr>,
    ) -> Vec<AddressOutcome> {
        let Some(mut entry) = self.entries.get_mut(&target_id) else {
            return Vec::new();
        };
        let now = Timestamp::now();
        let kept: Vec<AddressOutcome> = outcomes
            .into_iter()
            .filter(|o| !expired.contains(&o.address))
            .collect();
        for outcome in &kept {
            let state = match &outcome.result {
                Ok(latency) => AddressState {
                    time: now,
                    success: true,
                    latency: *latency,
                },
                Err(_) => AddressState {
                    time: now,
                    success: false,
                    latency: -1.0,
                },
            };
            entry.addresses.insert(outcome.address, state);
        }
        kept
    }

    /// Drop stored state for addresses that no longer resolve.
    pub fn invalidate_addresses(&self, target_id: i64, expired: &BTreeSet<IpAddr>) -> usize {
        match self.entries.get_mut(&target_id) {
            Some(mut entry) => {
                let before = entry.addresses.len();
                entry.addresses.retain(|ip, _| !expired.contains(ip));
                before - entry.addresses.len()
            }
            None => 0,
        }
    }

    pub fn address_states(&self, target_id: i64) -> Vec<(IpAddr, AddressState)> {
        self.entries
            .get(&target_id)
            .map(|e| e.addresses.iter().map(|(ip, s)| (*ip, s.clone())).collect())
            .unwrap_or_default()
    }

    /// Park a check until `hostname` resolves.
    pub fn park(&self, hostname: &str, target_id: i64) {
        self.waiting
            .lock()
            .entry(hostname.to_string())
            .or_default()
            .insert(target_id);
    }

    /// Remove and return every check parked on `hostname`.
    pub fn take_waiters(&self, hostname: &str) -> Vec<i64> {
        self.waiting
            .lock()
            .remove(hostname)
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default()
    }

    pub fn waiting_len(&self) -> usize {
        self.waiting.lock().values().map(BTreeSet::len).sum()
    }
}
