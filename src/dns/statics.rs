//! Statically pinned addresses, bypassing resolution entirely.

use super::DualstackMask;

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

#[derive(Debug, Default)]
pub struct StaticOverrides {
    map: RwLock<HashMap<(String, bool), BTreeSet<IpAddr>>>,
}

impl StaticOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `name` to `addresses` for one family, replacing any previous pin.
    pub fn set(&self, name: &str, is_v6: bool, addresses: impl IntoIterator<Item = IpAddr>) {
        let addresses: BTreeSet<IpAddr> = addresses
            .into_iter()
            .filter(|ip| ip.is_ipv6() == is_v6)
            .collect();
        let mut map = self.map.write();
        if addresses.is_empty() {
            map.remove(&(name.to_string(), is_v6));
        } else {
            map.insert((name.to_string(), is_v6), addresses);
        }
    }

    /// Pin a mixed list of addresses, split by family.
    pub fn pin(&self, name: &str, addresses: &[IpAddr]) {
        self.set(name, false, addresses.iter().copied());
        self.set(name, true, addresses.iter().copied());
    }

    pub fn contains(&self, name: &str) -> bool {
        let map = self.map.read();
        map.contains_key(&(name.to_string(), false)) || map.contains_key(&(name.to_string(), true))
    }

    pub fn get(&self, name: &str, mask: DualstackMask) -> Option<BTreeSet<IpAddr>> {
        let map = self.map.read();
        let found: BTreeSet<IpAddr> = mask
            .families()
            .iter()
            .filter_map(|family| map.get(&(name.to_string(), family.is_v6())))
            .flatten()
            .copied()
            .collect();
        (!found.is_empty()).then_some(found)
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }
}
