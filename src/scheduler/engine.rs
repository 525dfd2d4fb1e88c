//! The scheduling engine: turns due slots into check units, executes them on
//! pool workers, and writes their outcomes back.

use super::{Dispatch, EventLoop, EventTarget, QueryDecision, Snapshot, TargetSpec};
use crate::clock::Timestamp;
use crate::config::EngineConfig;
use crate::db::{CheckRecord, DnsRecord, StoreRecord};
use crate::dns::{DualstackMask, LookupKey};
use crate::probe::{run_probe, run_resolve, ProbeError, ProbeSet, RemoteReport};
use crate::work::{
    AddressOutcome, BoxFuture, CheckUnit, UnitHandler, UnitOutcome, UnitStatus, UnitTarget,
    WorkKind, WorkQueue,
};

use arc_swap::ArcSwap;
use chrono::Utc;
use std::collections::BTreeSet;
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

const UNRESOLVED: &str = "hostname did not resolve";

pub struct Engine {
    cfg: EngineConfig,
    current: ArcSwap<Snapshot>,
    queue: Arc<WorkQueue>,
    timers: Arc<EventLoop>,
    probes: ProbeSet,
    records: mpsc::Sender<StoreRecord>,
}

impl Engine {
    pub fn new(
        cfg: EngineConfig,
        queue: Arc<WorkQueue>,
        timers: Arc<EventLoop>,
        probes: ProbeSet,
        records: mpsc::Sender<StoreRecord>,
    ) -> Self {
        let empty = Snapshot::empty(0, &cfg);
        Self {
            cfg,
            current: ArcSwap::from_pointee(empty),
            queue,
            timers,
            probes,
            records,
        }
    }

    /// The current snapshot. Callers hold it for the whole operation.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.current.load_full()
    }

    /// Publish `snapshot` and schedule every slot it holds.
    pub fn install(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        self.current.store(snapshot.clone());
        self.schedule_all(&snapshot);
        snapshot
    }

    pub fn report_remote(&self, target_id: i64, report: RemoteReport) {
        self.probes.remote().deposit(target_id, report);
    }

    fn schedule_all(&self, snap: &Snapshot) {
        // Lookups first, so checks that find no address see them pending
        for key in snap.cache.keys() {
            self.schedule_lookup(snap, &key);
        }
        for id in snap.checks.ids() {
            self.schedule_check(snap, id);
        }
    }

    fn schedule_lookup(&self, snap: &Snapshot, key: &LookupKey) {
        match snap.cache.query_needed(key) {
            QueryDecision::Work => {
                let window = snap
                    .cache
                    .get(key)
                    .map(|e| e.slot().period())
                    .unwrap_or(self.cfg.default_ttl);
                self.queue
                    .insert(CheckUnit::lookup(key.clone(), snap.generation, window));
            }
            QueryDecision::Event(at) => self.timers.arm(at, EventTarget::Dns(key.clone())),
            QueryDecision::Ignore => {}
        }
    }

    fn schedule_check(&self, snap: &Snapshot, target_id: i64) {
        match snap.checks.query_needed(target_id) {
            QueryDecision::Work => self.enqueue_check(snap, target_id),
            QueryDecision::Event(at) => self.timers.arm(at, EventTarget::Check(target_id)),
            QueryDecision::Ignore => {}
        }
    }

    fn check_unit(&self, snap: &Snapshot, spec: &TargetSpec, addresses: Vec<IpAddr>) -> CheckUnit {
        CheckUnit::new(
            spec.kind,
            UnitTarget::Check {
                target_id: spec.id,
                addresses,
            },
            snap.generation,
            Timestamp::now(),
            spec.interval,
        )
    }

    /// Queue a due check, or park it until its hostname resolves.
    ///
    /// A check with nothing to resolve is still queued with no addresses; the
    /// worker records the failure.
    fn enqueue_check(&self, snap: &Snapshot, target_id: i64) {
        let Some(spec) = snap.target(target_id) else {
            return;
        };
        if spec.kind == WorkKind::RemoteCheck {
            self.queue.insert(self.check_unit(snap, spec, Vec::new()));
            return;
        }
        match snap.addresses(spec) {
            Some(addresses) => {
                let unit = self.check_unit(snap, spec, addresses.into_iter().collect());
                self.queue.insert(unit);
            }
            None if snap.lookup_pending(spec) => {
                tracing::debug!("Engine: {} waiting for {} to resolve", spec.name, spec.hostname);
                snap.checks.park(&spec.hostname, spec.id);
            }
            None => self.queue.insert(self.check_unit(snap, spec, Vec::new())),
        }
    }

    /// Arm a timer for `next`, or schedule right away if it is already due.
    fn reschedule(&self, snap: &Snapshot, target: EventTarget, next: Timestamp) {
        if next > Timestamp::now() {
            self.timers.arm(next, target);
            return;
        }
        match target {
            EventTarget::Dns(key) => self.schedule_lookup(snap, &key),
            EventTarget::Check(id) => self.schedule_check(snap, id),
        }
    }

    /// Hand `work` to its own task and park `unit` on its result.
    fn spawn_continuation<F>(&self, unit: &mut CheckUnit, work: F)
    where
        F: Future<Output = UnitOutcome> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        unit.await_outcome(rx);
        let id = unit.id();
        let queue = self.queue.clone();
        tokio::spawn(async move {
            let outcome = match tokio::spawn(work).await {
                Ok(outcome) => outcome,
                Err(e) => UnitOutcome::Failed(format!("probe task failed: {}", e)),
            };
            let _ = tx.send(outcome);
            queue.resume(id);
        });
    }

    /// Start the unit's work. Returns its status afterwards.
    fn execute(&self, unit: &mut CheckUnit, snap: &Snapshot) -> UnitStatus {
        match (unit.kind(), unit.target().clone()) {
            (WorkKind::DnsLookup, UnitTarget::Lookup(key)) => {
                match snap.cache.start_query(&key, unit.version()) {
                    Ok(deadline) => {
                        let timeout = deadline - Timestamp::now();
                        // Overdue watchdog; a query still running then is re-issued
                        self.timers.arm(deadline + timeout, EventTarget::Dns(key.clone()));
                        let resolver = self.probes.resolver(key.kind);
                        let lookup = run_resolve(resolver, key.hostname.clone(), key.family, timeout);
                        self.spawn_continuation(unit, async move {
                            UnitOutcome::Resolved(lookup.await)
                        });
                    }
                    Err(refused) => unit.complete(UnitOutcome::Refused(refused)),
                }
            }
            (WorkKind::HealthCheck, UnitTarget::Check { target_id, addresses }) => {
                let deadline = match snap.checks.start(target_id, unit.version()) {
                    Ok(deadline) => deadline,
                    Err(refused) => {
                        unit.complete(UnitOutcome::Refused(refused));
                        return unit.status();
                    }
                };
                let Some(spec) = snap.target(target_id) else {
                    unit.complete(UnitOutcome::Failed("target removed".to_string()));
                    return unit.status();
                };
                if addresses.is_empty() {
                    unit.complete(UnitOutcome::Failed(UNRESOLVED.to_string()));
                    return unit.status();
                }
                let Some(probe) = self.probes.probe(&spec.probe.probe_type) else {
                    let reason = format!("unsupported probe type {:?}", spec.probe.probe_type);
                    unit.complete(UnitOutcome::Failed(reason));
                    return unit.status();
                };

                self.timers
                    .arm(deadline + spec.timeout, EventTarget::Check(target_id));
                let config = spec.probe.clone();
                self.spawn_continuation(unit, async move {
                    let mut probes = JoinSet::new();
                    for (index, address) in addresses.into_iter().enumerate() {
                        let probe = probe.clone();
                        let config = config.clone();
                        probes.spawn(async move {
                            let result = run_probe(probe, config, address).await;
                            (index, AddressOutcome { address, result })
                        });
                    }
                    let mut outcomes = Vec::with_capacity(probes.len());
                    while let Some(joined) = probes.join_next().await {
                        match joined {
                            Ok(outcome) => outcomes.push(outcome),
                            Err(e) => tracing::error!("Engine: probe task failed: {}", e),
                        }
                    }
                    outcomes.sort_by_key(|(index, _)| *index);
                    UnitOutcome::Probed(outcomes.into_iter().map(|(_, o)| o).collect())
                });
            }
            (WorkKind::RemoteCheck, UnitTarget::Check { target_id, .. }) => {
                match snap.checks.start(target_id, unit.version()) {
                    Ok(_) => {
                        let report = self.probes.remote().take(target_id);
                        unit.complete(UnitOutcome::Reported(report));
                    }
                    Err(refused) => unit.complete(UnitOutcome::Refused(refused)),
                }
            }
            (kind, _) => {
                unit.complete(UnitOutcome::Failed(format!("{:?} unit with mismatched target", kind)))
            }
        }
        unit.status()
    }

    async fn run_unit(&self, mut unit: CheckUnit) {
        let status = match unit.status() {
            UnitStatus::Idle => {
                let snap = self.snapshot();
                self.execute(&mut unit, &snap)
            }
            UnitStatus::InProgress => unit.poll(),
            done => done,
        };

        match status {
            UnitStatus::InProgress => self.queue.suspend(unit),
            UnitStatus::Complete | UnitStatus::CompleteRemote => {
                self.queue.forget(unit.id());
                self.complete(unit).await
            }
            UnitStatus::Idle => tracing::warn!("Engine: unit {} did not start", unit.id()),
        }
    }

    async fn complete(&self, mut unit: CheckUnit) {
        let Some(outcome) = unit.take_outcome() else {
            return;
        };
        if let UnitOutcome::Refused(reason) = &outcome {
            tracing::debug!("Engine: unit {} refused: {}", unit.id(), reason);
            return;
        }

        let snap = self.snapshot();
        if unit.version() != snap.generation {
            tracing::debug!(
                "Engine: dropping result of unit {} from generation {} (current {})",
                unit.id(),
                unit.version(),
                snap.generation
            );
            return;
        }

        match (unit.target(), outcome) {
            (UnitTarget::Lookup(key), UnitOutcome::Resolved(result)) => {
                self.finish_lookup(&snap, key, result).await
            }
            (UnitTarget::Lookup(key), UnitOutcome::Failed(reason)) => {
                self.finish_lookup(&snap, key, Err(ProbeError::Network(reason))).await
            }
            (UnitTarget::Check { target_id, .. }, outcome) => {
                self.finish_check(&snap, *target_id, outcome).await
            }
            (target, outcome) => {
                tracing::warn!("Engine: unexpected outcome {:?} for {:?}", outcome, target)
            }
        }
    }

    async fn finish_lookup(
        &self,
        snap: &Snapshot,
        key: &LookupKey,
        result: Result<Vec<IpAddr>, ProbeError>,
    ) {
        let mask = DualstackMask::only(key.family);
        let (addresses, success) = match result {
            Ok(found) => {
                let usable: Vec<IpAddr> = found.into_iter().filter(|ip| mask.accepts(ip)).collect();
                tracing::debug!("Engine: {} resolved to {:?}", key, usable);
                (usable, true)
            }
            Err(e) => {
                tracing::warn!("Engine: lookup {} failed: {}", key, e);
                (Vec::new(), false)
            }
        };

        // An empty set is stored as the family's sentinel so the failure stays visible
        if addresses.is_empty() {
            snap.cache.update(key, [key.family.unspecified()]);
        } else {
            snap.cache.update(key, addresses.iter().copied());
        }
        let next = snap.cache.finish(key, success);

        if let Some(expired) = snap.cache.get_expired_addresses(key, mask) {
            for id in snap.targets_for_host(&key.hostname) {
                let dropped = snap.checks.invalidate_addresses(*id, &expired);
                if dropped > 0 {
                    tracing::debug!("Engine: invalidated {} addresses of target {}", dropped, id);
                }
            }
        }

        self.persist(StoreRecord::Dns(DnsRecord {
            time: Utc::now(),
            hostname: key.hostname.clone(),
            family: key.family.as_str().to_string(),
            resolver: key.kind.as_str().to_string(),
            success,
            addresses,
        }))
        .await;

        self.reschedule(snap, EventTarget::Dns(key.clone()), next);
        self.release_waiters(snap, &key.hostname);
    }

    /// Queue checks parked on `hostname` that can now run.
    fn release_waiters(&self, snap: &Snapshot, hostname: &str) {
        for id in snap.checks.take_waiters(hostname) {
            let Some(spec) = snap.target(id) else {
                continue;
            };
            match snap.addresses(spec) {
                Some(addresses) => {
                    let unit = self.check_unit(snap, spec, addresses.into_iter().collect());
                    self.queue.insert(unit);
                }
                None if snap.lookup_pending(spec) => snap.checks.park(hostname, id),
                None => self.queue.insert(self.check_unit(snap, spec, Vec::new())),
            }
        }
    }

    async fn finish_check(&self, snap: &Snapshot, target_id: i64, outcome: UnitOutcome) {
        let Some(spec) = snap.target(target_id) else {
            return;
        };
        let now = Utc::now();
        let summary = |success: bool, latency: f64, reason: Option<String>| CheckRecord {
            time: now,
            target_id,
            address: spec.hostname.clone(),
            success,
            latency,
            reason,
            remote_group: None,
        };

        let (success, records) = match outcome {
            UnitOutcome::Probed(outcomes) => {
                let expired: BTreeSet<IpAddr> = snap.expired_addresses(spec);
                let kept = snap.checks.record(target_id, outcomes, &expired);
                let success = kept.iter().any(|o| o.result.is_ok());
                if !success && !kept.is_empty() {
                    tracing::warn!("Engine: all {} addresses of {} failed", kept.len(), spec.name);
                }
                let records = kept
                    .into_iter()
                    .map(|o| CheckRecord {
                        address: o.address.to_string(),
                        success: o.result.is_ok(),
                        latency: o.result.as_ref().copied().unwrap_or(-1.0),
                        reason: o.result.err().map(|e| e.to_string()),
                        ..summary(false, -1.0, None)
                    })
                    .collect();
                (success, records)
            }
            UnitOutcome::Reported(Some(report)) => {
                let record = CheckRecord {
                    remote_group: Some(report.group.clone()),
                    ..summary(report.success, report.latency, report.reason.clone())
                };
                (report.success, vec![record])
            }
            UnitOutcome::Reported(None) => {
                tracing::debug!("Engine: no remote report for {} yet", spec.name);
                (true, Vec::new())
            }
            UnitOutcome::Failed(reason) => {
                tracing::warn!("Engine: check {} failed: {}", spec.name, reason);
                (false, vec![summary(false, -1.0, Some(reason))])
            }
            other => {
                tracing::warn!("Engine: unexpected outcome {:?} for check {}", other, spec.name);
                return;
            }
        };

        for record in records {
            self.persist(StoreRecord::Check(record)).await;
        }
        if let Some(next) = snap.checks.finish(target_id, success) {
            self.reschedule(snap, EventTarget::Check(target_id), next);
        }
    }

    /// Hand a record to the writer, waiting while its channel is full.
    async fn persist(&self, record: StoreRecord) {
        if self.records.send(record).await.is_err() {
            tracing::error!("Engine: result writer has stopped, dropping record");
        }
    }
}

impl Dispatch for Engine {
    fn dispatch(&self, fired: Timestamp, target: EventTarget) {
        let snap = self.snapshot();
        match target {
            EventTarget::Dns(key) => {
                snap.cache.release_event(&key, fired);
                self.schedule_lookup(&snap, &key);
            }
            EventTarget::Check(id) => {
                snap.checks.release_event(id, fired);
                self.schedule_check(&snap, id);
            }
        }
    }
}

impl UnitHandler for Engine {
    fn handle(&self, unit: CheckUnit) -> BoxFuture<'_, ()> {
        Box::pin(self.run_unit(unit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Target;
    use crate::dns::AddressFamily;
    use crate::probe::{Probe, ProbeConfig, ProbeFuture, Resolver};
    use crate::scheduler::QueryState;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    /// Answers from a fixed table; unknown names fail.
    #[derive(Default)]
    struct TableResolver {
        answers: Mutex<HashMap<String, Vec<IpAddr>>>,
    }

    impl Resolver for TableResolver {
        fn resolve(&self, hostname: &str, family: AddressFamily, _: Duration) -> ProbeFuture<Vec<IpAddr>> {
            let answer = self.answers.lock().get(hostname).cloned();
            Box::pin(async move {
                match answer {
                    Some(ips) => Ok(ips.into_iter().filter(|ip| AddressFamily::of(ip) == family).collect()),
                    None => Err(ProbeError::Network("NXDOMAIN".to_string())),
                }
            })
        }
    }

    /// Succeeds for every address except those listed.
    struct Reachable(Vec<IpAddr>);

    impl Probe for Reachable {
        fn probe(&self, _: &ProbeConfig, address: IpAddr) -> ProbeFuture<f64> {
            let down = self.0.contains(&address);
            Box::pin(async move {
                if down {
                    Err(ProbeError::Network("connection refused".to_string()))
                } else {
                    Ok(1_000_000.0)
                }
            })
        }
    }

    struct Harness {
        engine: Arc<Engine>,
        queue: Arc<WorkQueue>,
        timers: Arc<EventLoop>,
        resolver: Arc<TableResolver>,
        records: mpsc::Receiver<StoreRecord>,
    }

    fn harness(down: Vec<IpAddr>) -> Harness {
        harness_with_capacity(down, 100)
    }

    fn harness_with_capacity(down: Vec<IpAddr>, capacity: usize) -> Harness {
        let resolver = Arc::new(TableResolver::default());
        let mut probes = ProbeSet::empty(resolver.clone());
        probes.register("tcp", Arc::new(Reachable(down)));
        let queue = Arc::new(WorkQueue::new(10));
        let timers = EventLoop::new(Duration::from_secs(1));
        let (tx, rx) = mpsc::channel(capacity);
        let engine = Arc::new(Engine::new(
            EngineConfig::default(),
            queue.clone(),
            timers.clone(),
            probes,
            tx,
        ));
        Harness {
            engine,
            queue,
            timers,
            resolver,
            records: rx,
        }
    }

    impl Harness {
        fn answer(&self, hostname: &str, ips: &[&str]) {
            let ips = ips.iter().map(|s| s.parse().unwrap()).collect();
            self.resolver.answers.lock().insert(hostname.to_string(), ips);
        }

        /// Run queued units, including resumed continuations, until the queue stays empty.
        async fn drain(&self) {
            let cancel = AtomicBool::new(false);
            loop {
                let next = tokio::time::timeout(Duration::from_millis(500), self.queue.take(&cancel)).await;
                match next {
                    Ok(Some(unit)) => self.engine.handle(unit).await,
                    _ => break,
                }
            }
        }

        fn drain_records(&mut self) -> Vec<StoreRecord> {
            let mut out = Vec::new();
            while let Ok(record) = self.records.try_recv() {
                out.push(record);
            }
            out
        }
    }

    fn target(id: i64, hostname: &str) -> Target {
        Target {
            id,
            name: format!("target-{}", id),
            hostname: hostname.to_string(),
            dualstack: "v4".to_string(),
            probe_interval: 30.0,
            timeout: 2.0,
            dns_ttl: 60.0,
            ..Default::default()
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_check_waits_for_resolution() {
        let mut h = harness(vec![ip("10.0.0.2")]);
        h.answer("svc.example.com", &["10.0.0.1", "10.0.0.2", "fd00::1"]);
        let snap = h.engine.install(Snapshot::build(
            1,
            &[target(1, "svc.example.com")],
            None,
            &EngineConfig::default(),
        ));

        // The lookup is queued and the check parked behind it
        assert_eq!(h.queue.len(), 1);
        assert_eq!(snap.checks.waiting_len(), 1);

        h.drain().await;
        assert_eq!(snap.checks.waiting_len(), 0);
        let states = snap.checks.address_states(1);
        assert_eq!(states.len(), 2);
        assert!(states.iter().any(|(addr, s)| *addr == ip("10.0.0.1") && s.success));
        assert!(states.iter().any(|(addr, s)| *addr == ip("10.0.0.2") && !s.success));
        assert_eq!(snap.checks.state(1), Some(QueryState::Inactive));

        let records = h.drain_records();
        assert_eq!(records.len(), 3);
        assert!(matches!(&records[0], StoreRecord::Dns(r) if r.success && r.addresses.len() == 2));

        // Both slots now have their next run armed
        assert_eq!(h.timers.len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresolved_hostname_fails_check() {
        let mut h = harness(vec![]);
        let snap = h.engine.install(Snapshot::build(
            1,
            &[target(1, "missing.example.com")],
            None,
            &EngineConfig::default(),
        ));
        h.drain().await;

        let key = snap.target(1).unwrap().lookup_keys().remove(0);
        assert_eq!(snap.cache.state(&key), Some(QueryState::Failed));
        let entry = snap.cache.get(&key).unwrap();
        assert!(entry.raw_addresses().contains(&ip("0.0.0.0")));
        assert_eq!(snap.checks.state(1), Some(QueryState::Failed));

        let records = h.drain_records();
        assert!(records.iter().any(|r| matches!(
            r,
            StoreRecord::Check(c) if !c.success && c.reason.as_deref() == Some(UNRESOLVED)
        )));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changed_answer_invalidates_old_addresses() {
        let h = harness(vec![]);
        h.answer("svc.example.com", &["10.0.0.1"]);
        let snap = h.engine.install(Snapshot::build(
            1,
            &[target(1, "svc.example.com")],
            None,
            &EngineConfig::default(),
        ));
        h.drain().await;
        assert_eq!(snap.checks.address_states(1)[0].0, ip("10.0.0.1"));

        // Re-resolve with a new answer
        h.answer("svc.example.com", &["10.0.0.5"]);
        let key = snap.target(1).unwrap().lookup_keys().remove(0);
        let fire = snap.cache.get(&key).unwrap().slot().pending_event().unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        h.engine.dispatch(fire, EventTarget::Dns(key.clone()));
        h.drain().await;

        assert!(snap.checks.address_states(1).is_empty());
        assert_eq!(
            snap.cache.get_expired_addresses(&key, DualstackMask::V4Only),
            Some(BTreeSet::from([ip("10.0.0.1")]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_results_dropped() {
        let mut h = harness(vec![]);
        h.answer("svc.example.com", &["10.0.0.1"]);
        let targets = [target(1, "svc.example.com")];
        let first = h.engine.install(Snapshot::build(1, &targets, None, &EngineConfig::default()));

        // Start the lookup under generation 1, then reload before it completes
        let cancel = AtomicBool::new(false);
        let mut lookup = h.queue.take(&cancel).await.unwrap();
        assert_eq!(h.engine.execute(&mut lookup, &first), UnitStatus::InProgress);

        let second = h.engine.install(Snapshot::build(2, &targets, Some(&first), &EngineConfig::default()));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(lookup.poll(), UnitStatus::Complete);
        h.engine.handle(lookup).await;

        let key = second.target(1).unwrap().lookup_keys().remove(0);
        assert_eq!(second.cache.get_addresses(&key, DualstackMask::V4Only), None);
        assert!(h.drain_records().is_empty());

        // The new generation re-issues the lookup itself
        h.drain().await;
        assert!(second.cache.get_addresses(&key, DualstackMask::V4Only).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_record_channel_waits_instead_of_dropping() {
        let mut h = harness_with_capacity(vec![], 2);
        h.answer("svc.example.com", &["10.0.0.1", "10.0.0.2", "10.0.0.3"]);
        let mut rx = std::mem::replace(&mut h.records, mpsc::channel(1).1);
        let reader = tokio::spawn(async move {
            let mut got = Vec::new();
            while got.len() < 4 {
                match rx.recv().await {
                    Some(record) => got.push(record),
                    None => break,
                }
            }
            got
        });

        h.engine.install(Snapshot::build(
            1,
            &[target(1, "svc.example.com")],
            None,
            &EngineConfig::default(),
        ));
        h.drain().await;

        let records = reader.await.unwrap();
        assert_eq!(records.len(), 4);
        assert!(matches!(&records[0], StoreRecord::Dns(r) if r.addresses.len() == 3));
        let checked = records
            .iter()
            .filter(|r| matches!(r, StoreRecord::Check(c) if c.success))
            .count();
        assert_eq!(checked, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_check_consumes_report() {
        let mut h = harness(vec![]);
        let mut remote = target(7, "edge.example.com");
        remote.probe_type = "remote".to_string();
        h.engine.report_remote(
            7,
            RemoteReport {
                group: "eu-west".to_string(),
                time: Timestamp::now(),
                success: false,
                latency: -1.0,
                reason: Some("timeout".to_string()),
            },
        );
        let snap = h.engine.install(Snapshot::build(1, &[remote], None, &EngineConfig::default()));
        h.drain().await;

        assert_eq!(snap.checks.state(7), Some(QueryState::Failed));
        let records = h.drain_records();
        assert_eq!(records.len(), 1);
        assert!(matches!(
            &records[0],
            StoreRecord::Check(c) if c.remote_group.as_deref() == Some("eu-west")
        ));
    }
}
