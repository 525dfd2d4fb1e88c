//! Probe module for health checking.
//!
//! Supports TCP and HTTP checks, DNS resolution through a nameserver or the
//! system resolver, and results reported by remote check groups.

mod dns;
mod http;
mod remote;
mod tcp;

pub use dns::*;
pub use http::*;
pub use remote::*;
pub use tcp::*;

use crate::dns::{AddressFamily, ResolutionKind};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Probe error types.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("protocol error: {0}")]
    Protocol(String),
}

pub type ProbeFuture<T> = Pin<Box<dyn Future<Output = Result<T, ProbeError>> + Send>>;

/// Per-target probe options, stored as JSON in the target row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProbeOptions {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub expect_status: Option<u16>,
    #[serde(default)]
    pub tls: bool,
}

impl ProbeOptions {
    /// Parse the `probe_config` column. Empty means defaults.
    pub fn parse(json: &str) -> Result<Self, ProbeError> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(json).map_err(|e| ProbeError::Config(e.to_string()))
    }
}

/// Probe configuration.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub probe_type: String,
    pub hostname: String,
    pub port: u16,
    pub path: String,
    pub expect_status: Option<u16>,
    pub tls: bool,
    pub timeout: Duration,
}

impl ProbeConfig {
    pub fn new(probe_type: &str, hostname: &str, timeout: Duration) -> Self {
        Self {
            probe_type: probe_type.to_string(),
            hostname: hostname.to_string(),
            port: 80,
            path: "/".to_string(),
            expect_status: None,
            tls: false,
            timeout,
        }
    }

    pub fn with_options(mut self, options: &ProbeOptions) -> Self {
        self.tls = options.tls;
        self.port = options.port.unwrap_or(if options.tls { 443 } else { 80 });
        if let Some(path) = &options.path {
            self.path = path.clone();
        }
        self.expect_status = options.expect_status;
        self
    }
}

/// A health check against one address.
pub trait Probe: Send + Sync {
    /// Returns latency in nanoseconds.
    fn probe(&self, config: &ProbeConfig, address: IpAddr) -> ProbeFuture<f64>;
}

/// Resolves a hostname for one address family.
pub trait Resolver: Send + Sync {
    fn resolve(&self, hostname: &str, family: AddressFamily, timeout: Duration)
        -> ProbeFuture<Vec<IpAddr>>;
}

/// The probe and resolver implementations available to workers.
#[derive(Clone)]
pub struct ProbeSet {
    probes: HashMap<String, Arc<dyn Probe>>,
    nameserver: Option<Arc<dyn Resolver>>,
    system: Arc<dyn Resolver>,
    remote: Arc<RemoteInbox>,
}

impl ProbeSet {
    /// Built-in probes, resolving through `nameserver` when one is configured.
    pub fn standard(nameserver: Option<std::net::SocketAddr>) -> Self {
        let mut set = Self::empty(Arc::new(SystemResolver));
        set.register("tcp", Arc::new(TcpProbe));
        set.register("http", Arc::new(HttpProbe));
        match nameserver {
            Some(addr) => set.with_nameserver(Arc::new(UdpResolver::new(addr))),
            None => set,
        }
    }

    pub fn empty(system: Arc<dyn Resolver>) -> Self {
        Self {
            probes: HashMap::new(),
            nameserver: None,
            system,
            remote: Arc::new(RemoteInbox::new()),
        }
    }

    pub fn register(&mut self, probe_type: &str, probe: Arc<dyn Probe>) {
        self.probes.insert(probe_type.to_string(), probe);
    }

    pub fn with_nameserver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.nameserver = Some(resolver);
        self
    }

    pub fn probe(&self, probe_type: &str) -> Option<Arc<dyn Probe>> {
        self.probes.get(probe_type).cloned()
    }

    /// Nameserver lookups fall back to the system resolver when no
    /// nameserver is configured.
    pub fn resolver(&self, kind: ResolutionKind) -> Arc<dyn Resolver> {
        match (kind, &self.nameserver) {
            (ResolutionKind::Nameserver, Some(resolver)) => resolver.clone(),
            _ => self.system.clone(),
        }
    }

    pub fn remote(&self) -> &Arc<RemoteInbox> {
        &self.remote
    }
}

/// Run a probe with the given configuration against one address.
///
/// Returns latency in nanoseconds on success.
pub async fn run_probe(
    probe: Arc<dyn Probe>,
    config: ProbeConfig,
    address: IpAddr,
) -> Result<f64, ProbeError> {
    // Add jitter to avoid thundering herd
    let jitter = rand::random::<u64>() % 100;
    tokio::time::sleep(Duration::from_millis(jitter)).await;

    let result = match tokio::time::timeout(config.timeout, probe.probe(&config, address)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(config.timeout)),
    };

    // Enforce timeout check
    if let Ok(latency) = &result {
        if *latency >= config.timeout.as_nanos() as f64 {
            return Err(ProbeError::Timeout(config.timeout));
        }
    }

    result
}

/// Resolve `hostname` with a deadline.
pub async fn run_resolve(
    resolver: Arc<dyn Resolver>,
    hostname: String,
    family: AddressFamily,
    timeout: Duration,
) -> Result<Vec<IpAddr>, ProbeError> {
    match tokio::time::timeout(timeout, resolver.resolve(&hostname, family, timeout)).await {
        Ok(result) => result,
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}
