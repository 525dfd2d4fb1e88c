//! Generation-stamped view of the target set and its scheduling state.
//!
//! A snapshot is built once per configuration load and never mutated
//! structurally afterwards; reloads publish a new one.

use super::{CheckList, QueryState};
use crate::config::EngineConfig;
use crate::db::Target;
use crate::dns::{DualstackMask, LookupKey, ResolutionCache, ResolutionKind};
use crate::probe::{ProbeConfig, ProbeError, ProbeOptions};
use crate::work::WorkKind;

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::time::Duration;

/// A target as the engine schedules it.
#[derive(Debug, Clone)]
pub struct TargetSpec {
    pub id: i64,
    pub name: String,
    pub hostname: String,
    pub kind: WorkKind,
    pub probe: ProbeConfig,
    pub interval: Duration,
    pub timeout: Duration,
    /// Zero uses the cache default
    pub dns_ttl: Duration,
    pub mask: DualstackMask,
    pub resolver: ResolutionKind,
    pub remote_group: Option<String>,
    /// Addresses that bypass resolution
    pub pinned: Vec<IpAddr>,
}

fn seconds(value: f64, fallback: Duration) -> Duration {
    if value > 0.0 {
        Duration::try_from_secs_f64(value).unwrap_or(fallback)
    } else {
        fallback
    }
}

impl TargetSpec {
    pub fn from_target(target: &Target, default_timeout: Duration) -> Result<Self, ProbeError> {
        let hostname = target.hostname.trim().to_string();
        if hostname.is_empty() {
            return Err(ProbeError::Config("empty hostname".to_string()));
        }

        let kind = match target.probe_type.as_str() {
            "remote" => WorkKind::RemoteCheck,
            _ => WorkKind::HealthCheck,
        };
        let timeout = seconds(target.timeout, default_timeout);
        let options = ProbeOptions::parse(&target.probe_config)?;

        let mut pinned: Vec<IpAddr> = if target.static_addresses.trim().is_empty() {
            Vec::new()
        } else {
            serde_json::from_str(&target.static_addresses)
                .map_err(|e| ProbeError::Config(format!("static_addresses: {}", e)))?
        };
        if let Ok(literal) = hostname.parse::<IpAddr>() {
            pinned.push(literal);
        }

        Ok(Self {
            id: target.id,
            name: target.name.clone(),
            probe: ProbeConfig::new(&target.probe_type, &hostname, timeout).with_options(&options),
            hostname,
            kind,
            interval: seconds(target.probe_interval, Duration::from_secs(10)),
            timeout,
            dns_ttl: seconds(target.dns_ttl, Duration::ZERO),
            mask: DualstackMask::parse(&target.dualstack),
            resolver: ResolutionKind::parse(&target.resolver),
            remote_group: target.remote_group.clone(),
            pinned,
        })
    }

    pub fn is_pinned(&self) -> bool {
        !self.pinned.is_empty()
    }

    /// The resolution slots this target depends on, one per family.
    pub fn lookup_keys(&self) -> Vec<LookupKey> {
        if self.kind == WorkKind::RemoteCheck || self.is_pinned() {
            return Vec::new();
        }
        self.mask
            .families()
            .iter()
            .map(|family| {
                LookupKey::new(&self.hostname, self.resolver, *family, &self.probe.probe_type)
                    .with_remote_group(self.remote_group.clone())
            })
            .collect()
    }
}

/// The engine's current state for one generation.
#[derive(Debug)]
pub struct Snapshot {
    pub generation: u64,
    targets: HashMap<i64, TargetSpec>,
    by_host: HashMap<String, Vec<i64>>,
    pub cache: ResolutionCache,
    pub checks: CheckList,
}

impl Snapshot {
    pub fn empty(generation: u64, cfg: &EngineConfig) -> Self {
        Self {
            generation,
            targets: HashMap::new(),
            by_host: HashMap::new(),
            cache: ResolutionCache::new(generation, cfg.default_ttl, cfg.default_timeout),
            checks: CheckList::new(generation),
        }
    }

    /// Build generation `generation` from `targets`, inheriting history from
    /// `previous` where slots carry over.
    pub fn build(
        generation: u64,
        targets: &[Target],
        previous: Option<&Snapshot>,
        cfg: &EngineConfig,
    ) -> Self {
        let mut snapshot = Self::empty(generation, cfg);

        for target in targets {
            let spec = match TargetSpec::from_target(target, cfg.default_timeout) {
                Ok(spec) => spec,
                Err(e) => {
                    tracing::warn!("Snapshot: skipping target {} ({}): {}", target.id, target.name, e);
                    continue;
                }
            };

            if spec.is_pinned() {
                snapshot.cache.statics().pin(&spec.hostname, &spec.pinned);
            }
            for key in spec.lookup_keys() {
                snapshot.cache.insert(key, spec.dns_ttl, spec.timeout);
            }
            snapshot.checks.insert(spec.id, spec.interval, spec.timeout);
            snapshot
                .by_host
                .entry(spec.hostname.clone())
                .or_default()
                .push(spec.id);
            snapshot.targets.insert(spec.id, spec);
        }

        if let Some(previous) = previous {
            snapshot.cache.inherit(&previous.cache);
            snapshot.checks.inherit(&previous.checks);
        }

        snapshot
    }

    pub fn target(&self, id: i64) -> Option<&TargetSpec> {
        self.targets.get(&id)
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    /// Targets probing `hostname`.
    pub fn targets_for_host(&self, hostname: &str) -> &[i64] {
        self.by_host.get(hostname).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Usable addresses for a target, static pins first.
    pub fn addresses(&self, spec: &TargetSpec) -> Option<BTreeSet<IpAddr>> {
        if let Some(pinned) = self.cache.statics().get(&spec.hostname, spec.mask) {
            return Some(pinned);
        }
        let key = spec.lookup_keys().into_iter().next()?;
        self.cache.get_addresses(&key, spec.mask)
    }

    /// Addresses recently dropped from any of the target's slots.
    pub fn expired_addresses(&self, spec: &TargetSpec) -> BTreeSet<IpAddr> {
        spec.lookup_keys()
            .into_iter()
            .next()
            .and_then(|key| self.cache.get_expired_addresses(&key, spec.mask))
            .unwrap_or_default()
    }

    /// Whether any of the target's lookups is queued or running.
    pub fn lookup_pending(&self, spec: &TargetSpec) -> bool {
        spec.lookup_keys().iter().any(|key| {
            matches!(
                self.cache.state(key),
                Some(QueryState::Queued | QueryState::InProgress)
            )
        })
    }
}
