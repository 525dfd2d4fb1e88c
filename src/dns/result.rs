//! Per-key resolution state.

use super::DualstackMask;
use crate::scheduler::ScheduleSlot;

use std::collections::BTreeSet;
use std::net::IpAddr;

/// Resolution state and address cache for one lookup key.
#[derive(Debug, Clone)]
pub struct ResolutionResult {
    pub(super) slot: ScheduleSlot,
    pub(super) addresses: BTreeSet<IpAddr>,
    /// Addresses dropped by the most recent update.
    pub(super) expired: BTreeSet<IpAddr>,
}

impl ResolutionResult {
    pub(super) fn new(slot: ScheduleSlot) -> Self {
        Self {
            slot,
            addresses: BTreeSet::new(),
            expired: BTreeSet::new(),
        }
    }

    pub fn slot(&self) -> &ScheduleSlot {
        &self.slot
    }

    /// Every stored address, sentinels included.
    pub fn raw_addresses(&self) -> &BTreeSet<IpAddr> {
        &self.addresses
    }

    pub fn raw_expired(&self) -> &BTreeSet<IpAddr> {
        &self.expired
    }

    /// Replace the address set. What disappeared becomes the expired set.
    pub(super) fn replace_addresses(&mut self, new: BTreeSet<IpAddr>) {
        self.expired = self.addresses.difference(&new).copied().collect();
        self.addresses = new;
    }
}

/// Addresses a caller may use: matching the mask and not a sentinel.
pub(super) fn usable<'a>(
    set: &'a BTreeSet<IpAddr>,
    mask: DualstackMask,
) -> impl Iterator<Item = IpAddr> + 'a {
    set.iter()
        .filter(move |ip| !ip.is_unspecified() && mask.accepts(ip))
        .copied()
}
