//! Database model types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A monitored target configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub hostname: String,
    /// "tcp", "http" or "remote"
    pub probe_type: String,
    /// JSON probe options (port, path, expect_status, tls)
    pub probe_config: String,
    /// Seconds between checks
    pub probe_interval: f64,
    /// Seconds before a check times out
    pub timeout: f64,
    /// Seconds a resolution stays fresh; 0 uses the engine default
    pub dns_ttl: f64,
    /// "v4", "v6" or "both"
    pub dualstack: String,
    /// "nameserver" or "system"
    pub resolver: String,
    pub remote_group: Option<String>,
    /// JSON list of pinned addresses
    pub static_addresses: String,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            hostname: String::new(),
            probe_type: "tcp".to_string(),
            probe_config: String::new(),
            probe_interval: 10.0,
            timeout: 5.0,
            dns_ttl: 0.0,
            dualstack: "both".to_string(),
            resolver: "nameserver".to_string(),
            remote_group: None,
            static_addresses: "[]".to_string(),
        }
    }
}

/// Outcome of probing one address of a target.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckRecord {
    pub time: DateTime<Utc>,
    pub target_id: i64,
    /// The probed address, or the hostname when no address was usable
    pub address: String,
    pub success: bool,
    /// Latency in nanoseconds, or -1.0 for failure
    pub latency: f64,
    pub reason: Option<String>,
    pub remote_group: Option<String>,
}

/// Outcome of one finished resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsRecord {
    pub time: DateTime<Utc>,
    pub hostname: String,
    /// "v4" or "v6"
    pub family: String,
    pub resolver: String,
    pub success: bool,
    pub addresses: Vec<IpAddr>,
}

/// Anything the batch writer persists.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreRecord {
    Check(CheckRecord),
    Dns(DnsRecord),
}
