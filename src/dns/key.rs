//! Lookup keys and address-family filters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Address family of a single resolution slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn is_v6(self) -> bool {
        self == AddressFamily::V6
    }

    /// The all-zero address, used as a "no usable address" sentinel.
    pub fn unspecified(self) -> IpAddr {
        match self {
            AddressFamily::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            AddressFamily::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AddressFamily::V4 => "v4",
            AddressFamily::V6 => "v6",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "v4" => Some(AddressFamily::V4),
            "v6" => Some(AddressFamily::V6),
            _ => None,
        }
    }
}

/// Which families a caller wants back from the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DualstackMask {
    V4Only,
    V6Only,
    Both,
}

impl DualstackMask {
    pub fn families(self) -> &'static [AddressFamily] {
        match self {
            DualstackMask::V4Only => &[AddressFamily::V4],
            DualstackMask::V6Only => &[AddressFamily::V6],
            DualstackMask::Both => &[AddressFamily::V4, AddressFamily::V6],
        }
    }

    /// The mask selecting exactly one family.
    pub fn only(family: AddressFamily) -> Self {
        match family {
            AddressFamily::V4 => DualstackMask::V4Only,
            AddressFamily::V6 => DualstackMask::V6Only,
        }
    }

    pub fn accepts(self, ip: &IpAddr) -> bool {
        self.families().contains(&AddressFamily::of(ip))
    }

    /// Parse the `dualstack` column of a target. Unknown values mean both.
    pub fn parse(s: &str) -> Self {
        match s {
            "v4" => DualstackMask::V4Only,
            "v6" => DualstackMask::V6Only,
            _ => DualstackMask::Both,
        }
    }
}

/// Which resolver collaborator performs the lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResolutionKind {
    /// Query the configured nameserver directly.
    Nameserver,
    /// Use the operating system resolver.
    System,
}

impl ResolutionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResolutionKind::Nameserver => "nameserver",
            ResolutionKind::System => "system",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "system" => ResolutionKind::System,
            _ => ResolutionKind::Nameserver,
        }
    }
}

/// Identity of one DNS resolution slot.
///
/// Field order defines the lexicographic ordering.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LookupKey {
    pub hostname: String,
    pub kind: ResolutionKind,
    pub family: AddressFamily,
    pub plugin: String,
    pub remote_group: Option<String>,
}

impl LookupKey {
    pub fn new(
        hostname: impl Into<String>,
        kind: ResolutionKind,
        family: AddressFamily,
        plugin: impl Into<String>,
    ) -> Self {
        Self {
            hostname: hostname.into(),
            kind,
            family,
            plugin: plugin.into(),
            remote_group: None,
        }
    }

    pub fn with_remote_group(mut self, group: Option<String>) -> Self {
        self.remote_group = group;
        self
    }

    /// The same slot identity for another address family.
    pub fn with_family(&self, family: AddressFamily) -> Self {
        Self {
            family,
            ..self.clone()
        }
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.hostname, self.family.as_str(), self.plugin)?;
        if let Some(group) = &self.remote_group {
            write!(f, "@{}", group)?;
        }
        Ok(())
    }
}
