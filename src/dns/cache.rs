//! Resolution cache: one state machine and address set per lookup key.

use super::result::usable;
use super::{DualstackMask, LookupKey, ResolutionResult, StaticOverrides};
use crate::clock::Timestamp;
use crate::scheduler::{QueryDecision, QueryRefused, QueryState, ScheduleSlot};

use dashmap::DashMap;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

/// Resolution cache for one configuration generation.
///
/// Entries are locked per shard, so work on different keys does not
/// serialize. The cache is replaced, not mutated, when configuration reloads.
#[derive(Debug)]
pub struct ResolutionCache {
    generation: u64,
    entries: DashMap<LookupKey, ResolutionResult>,
    statics: StaticOverrides,
    default_ttl: Duration,
    default_timeout: Duration,
}

impl ResolutionCache {
    pub fn new(generation: u64, default_ttl: Duration, default_timeout: Duration) -> Self {
        Self {
            generation,
            entries: DashMap::new(),
            statics: StaticOverrides::new(),
            default_ttl,
            default_timeout,
        }
    }

    pub fn statics(&self) -> &StaticOverrides {
        &self.statics
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn keys(&self) -> Vec<LookupKey> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of one entry.
    pub fn get(&self, key: &LookupKey) -> Option<ResolutionResult> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    pub fn state(&self, key: &LookupKey) -> Option<QueryState> {
        self.entries.get(key).map(|e| e.slot.state())
    }

    fn or_default(&self, value: Duration, default: Duration) -> Duration {
        if value.is_zero() {
            default
        } else {
            value
        }
    }

    fn new_entry(&self) -> ResolutionResult {
        ResolutionResult::new(ScheduleSlot::new(
            self.default_ttl,
            self.default_timeout,
            self.generation,
        ))
    }

    /// Create a slot, or narrow the TTL and timeout of an existing one.
    ///
    /// Zero means "use the default", never "expire immediately".
    pub fn insert(&self, key: LookupKey, ttl: Duration, timeout: Duration) {
        let ttl = self.or_default(ttl, self.default_ttl);
        let timeout = self.or_default(timeout, self.default_timeout);
        self.entries
            .entry(key)
            .and_modify(|e| e.slot.narrow(ttl, timeout))
            .or_insert_with(|| {
                ResolutionResult::new(ScheduleSlot::new(ttl, timeout, self.generation))
            });
    }

    /// Carry addresses and schedule history over from the previous generation
    /// for every key this cache already holds.
    pub fn inherit(&self, previous: &ResolutionCache) {
        for mut entry in self.entries.iter_mut() {
            if let Some(old) = previous.entries.get(entry.key()) {
                let generation = self.generation;
                let entry = entry.value_mut();
                entry.slot.inherit(&old.slot, generation);
                entry.addresses = old.addresses.clone();
                entry.expired = old.expired.clone();
            }
        }
    }

    /// Seed an inserted key with a result recorded before startup.
    ///
    /// Keys the current target set does not use are skipped.
    pub fn seed(
        &self,
        key: &LookupKey,
        addresses: impl IntoIterator<Item = IpAddr>,
        result_time: Timestamp,
        success: bool,
    ) -> bool {
        match self.entries.get_mut(key) {
            Some(mut entry) => {
                entry.slot.restore(result_time, success);
                entry.replace_addresses(addresses.into_iter().collect());
                entry.expired.clear();
                true
            }
            None => false,
        }
    }

    /// Replace the address set of a key. The previous set minus the new one
    /// becomes the expired set.
    pub fn update(&self, key: &LookupKey, addresses: impl IntoIterator<Item = IpAddr>) {
        let addresses: BTreeSet<IpAddr> = addresses.into_iter().collect();
        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| self.new_entry());
        entry.replace_addresses(addresses);
    }

    /// Mark the in-flight query finished and return when the next is due.
    pub fn finish(&self, key: &LookupKey, success: bool) -> Timestamp {
        let now = Timestamp::now();
        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| self.new_entry());
        entry.slot.finish(now, success, self.generation)
    }

    /// Move a key to in-progress, returning the query deadline.
    ///
    /// Refused when `expected_version` is not this cache's generation or a
    /// query is already running.
    pub fn start_query(
        &self,
        key: &LookupKey,
        expected_version: u64,
    ) -> Result<Timestamp, QueryRefused> {
        if expected_version != self.generation {
            return Err(QueryRefused::Stale {
                expected: expected_version,
                current: self.generation,
            });
        }
        let now = Timestamp::now();
        let mut entry = self
            .entries
            .entry(key.clone())
            .or_insert_with(|| self.new_entry());
        entry.slot.start(now, self.generation)
    }

    /// The single decision point for whether a key needs a lookup.
    ///
    /// Unknown keys need nothing.
    pub fn query_needed(&self, key: &LookupKey) -> QueryDecision {
        let now = Timestamp::now();
        match self.entries.get_mut(key) {
            Some(mut entry) => entry.slot.query_needed(now, self.generation),
            None => QueryDecision::Ignore,
        }
    }

    /// Forget the pending timer for `key` if it is the one that fired.
    pub fn release_event(&self, key: &LookupKey, fired: Timestamp) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.slot.release_event(fired);
        }
    }

    pub fn next_query_time(&self, key: &LookupKey) -> Timestamp {
        let now = Timestamp::now();
        self.entries
            .get(key)
            .map(|e| e.slot.next_query_time(now, self.generation))
            .unwrap_or(now)
    }

    fn collect(
        &self,
        key: &LookupKey,
        mask: DualstackMask,
        pick: fn(&ResolutionResult) -> &BTreeSet<IpAddr>,
    ) -> Option<BTreeSet<IpAddr>> {
        let mut found = BTreeSet::new();
        for family in mask.families() {
            // One shard lock at a time
            if let Some(entry) = self.entries.get(&key.with_family(*family)) {
                found.extend(usable(pick(entry.value()), mask));
            }
        }
        (!found.is_empty()).then_some(found)
    }

    /// Current usable addresses for the key's hostname across `mask`.
    ///
    /// The key's own family is ignored; the mask selects families.
    pub fn get_addresses(&self, key: &LookupKey, mask: DualstackMask) -> Option<BTreeSet<IpAddr>> {
        self.collect(key, mask, |e| &e.addresses)
    }

    /// Addresses dropped by the latest update across `mask`.
    pub fn get_expired_addresses(
        &self,
        key: &LookupKey,
        mask: DualstackMask,
    ) -> Option<BTreeSet<IpAddr>> {
        self.collect(key, mask, |e| &e.expired)
    }
}
