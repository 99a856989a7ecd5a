//! Deterministic simulation of several proxies sharing one store
//!
//! A `VolatileStore` commits writes and emits events. Events travel to each
//! proxy over a simulated network that drops, duplicates and reorders them;
//! sync responses and write acknowledgements are reordered but never lost.
//! Snapshots are taken when a proxy asks for one and may arrive after newer
//! events, which exercises stale-snapshot handling.
//!
//! Every consumer rebuilds its view from the notifications it receives. At
//! the end of a run the harness retransmits lost events until every proxy
//! has caught up, then checks:
//!
//! - each synchronized proxy's cache equals the store
//! - each synced consumer's reconstructed view equals its proxy's cache
//! - delivery-class rules held throughout (no updates before the first sync,
//!   no sync/desync to raw or write-only consumers, originator flags only for
//!   consumers that wrote)

use crate::backend::{StoreEvent, SyncResponse, WriteAck, WriteOp};
use crate::config::SimulationSettings;
use crate::error::StorageError;
use crate::memory::VolatileStore;
use crate::proxy::core::{Command, LocalWrite, ProxyCore, SyncState};
use crate::proxy::scheduler::{Change, Notification};
use crate::simulator::rng::DeterministicRng;
use crate::types::{
    BarrierToken, Capabilities, ConsumerId, DeliveryPolicy, Entity, EntityId, Originator,
    ProvenanceKey, ProxyId, StoreInfo, StoreKind, StoreValue,
};
use serde_json::json;
use tracing::debug;

const MAX_QUIESCE_ROUNDS: usize = 64;

/// Configuration for a proxy DST run
#[derive(Debug, Clone)]
pub struct ProxyDstConfig {
    pub seed: u64,
    pub kind: StoreKind,
    pub num_proxies: usize,
    /// Distinct entity ids (collections) or values (singletons)
    pub value_pool: u64,
    pub drop_prob: f64,
    pub duplicate_prob: f64,
    /// Probability a delivery takes a random queued message instead of the oldest
    pub reorder_prob: f64,
    /// Probability an operation is a write straight to the store
    pub remote_write_prob: f64,
    /// Probability of a delivery burst after each operation
    pub delivery_prob: f64,
    pub late_join_prob: f64,
    pub max_buffered_events: usize,
}

impl Default for ProxyDstConfig {
    fn default() -> Self {
        ProxyDstConfig {
            seed: 0,
            kind: StoreKind::Collection,
            num_proxies: 2,
            value_pool: 6,
            drop_prob: 0.0,
            duplicate_prob: 0.0,
            reorder_prob: 0.0,
            remote_write_prob: 0.2,
            delivery_prob: 0.7,
            late_join_prob: 0.0,
            max_buffered_events: 1024,
        }
    }
}

impl ProxyDstConfig {
    /// Calm mode - lossless, in-order delivery
    pub fn calm(seed: u64) -> Self {
        ProxyDstConfig {
            seed,
            ..Default::default()
        }
    }

    /// Moderate fault injection
    pub fn moderate(seed: u64) -> Self {
        ProxyDstConfig {
            seed,
            num_proxies: 3,
            drop_prob: 0.05,
            duplicate_prob: 0.05,
            reorder_prob: 0.2,
            delivery_prob: 0.5,
            late_join_prob: 0.02,
            ..Default::default()
        }
    }

    /// Chaos mode - aggressive faults and a tiny reorder buffer
    pub fn chaos(seed: u64) -> Self {
        ProxyDstConfig {
            seed,
            num_proxies: 4,
            value_pool: 4,
            drop_prob: 0.2,
            duplicate_prob: 0.15,
            reorder_prob: 0.5,
            remote_write_prob: 0.35,
            delivery_prob: 0.3,
            late_join_prob: 0.05,
            max_buffered_events: 4,
            ..Default::default()
        }
    }

    pub fn with_kind(mut self, kind: StoreKind) -> Self {
        self.kind = kind;
        self
    }

    /// Fault profile from the simulation section of the proxy configuration
    pub fn from_settings(seed: u64, kind: StoreKind, settings: &SimulationSettings) -> Self {
        ProxyDstConfig {
            seed,
            kind,
            num_proxies: 3,
            drop_prob: settings.drop_probability,
            duplicate_prob: settings.duplicate_probability,
            reorder_prob: settings.reorder_probability,
            delivery_prob: 0.5,
            late_join_prob: 0.02,
            ..Default::default()
        }
    }
}

/// Result of a proxy DST run
#[derive(Debug, Clone, Default)]
pub struct ProxyDstResult {
    pub seed: u64,
    pub total_operations: u64,
    pub local_writes: u64,
    pub remote_writes: u64,
    pub events_delivered: u64,
    pub events_dropped: u64,
    pub events_duplicated: u64,
    pub retransmissions: u64,
    pub syncs_served: u64,
    pub desyncs: u64,
    pub invariant_violations: Vec<String>,
    pub converged: bool,
}

impl ProxyDstResult {
    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty() && self.converged
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} local, {} remote), {} events, {} drops, {} dups, {} syncs, {} desyncs, converged={}, {} violations",
            self.seed,
            self.total_operations,
            self.local_writes,
            self.remote_writes,
            self.events_delivered,
            self.events_dropped,
            self.events_duplicated,
            self.syncs_served,
            self.desyncs,
            self.converged,
            self.invariant_violations.len()
        )
    }
}

#[derive(Debug, Clone)]
enum Inbound {
    Event(StoreEvent),
    Snapshot(SyncResponse),
    Ack {
        barrier: Option<BarrierToken>,
        ack: WriteAck,
    },
    Rejected {
        barrier: Option<BarrierToken>,
        error: StorageError,
    },
}

/// A consumer as the harness sees it: its registration plus the view it
/// rebuilt from notifications.
struct SimConsumer {
    id: ConsumerId,
    policy: DeliveryPolicy,
    capabilities: Capabilities,
    view: Option<StoreValue>,
    wrote: bool,
}

impl SimConsumer {
    fn is_synced(&self) -> bool {
        self.capabilities.read && self.policy.keep_synced
    }
}

struct SimProxy {
    core: ProxyCore,
    consumers: Vec<SimConsumer>,
    listening: bool,
    inbox: Vec<Inbound>,
}

// =============================================================================
// Harness
// =============================================================================

pub struct ProxyDstHarness {
    config: ProxyDstConfig,
    rng: DeterministicRng,
    store: VolatileStore,
    /// Every committed event, indexed by version - 1
    log: Vec<StoreEvent>,
    proxies: Vec<SimProxy>,
    next_remote_key: u64,
    result: ProxyDstResult,
}

impl ProxyDstHarness {
    pub fn new(config: ProxyDstConfig) -> Self {
        let info = StoreInfo::volatile("sim-store", config.kind);
        let mut harness = ProxyDstHarness {
            rng: DeterministicRng::new(config.seed),
            store: VolatileStore::new(info.clone()),
            log: Vec::new(),
            proxies: Vec::new(),
            next_remote_key: 0,
            result: ProxyDstResult {
                seed: config.seed,
                ..Default::default()
            },
            config,
        };

        for p in 0..harness.config.num_proxies {
            harness.proxies.push(SimProxy {
                core: ProxyCore::new(
                    ProxyId::new(format!("p{}", p)),
                    info.clone(),
                    harness.config.max_buffered_events,
                ),
                consumers: Vec::new(),
                listening: false,
                inbox: Vec::new(),
            });
            harness.register(p, DeliveryPolicy::synced(), Capabilities::READ_WRITE);
            harness.register(
                p,
                DeliveryPolicy::synced().with_notify_desync(false),
                Capabilities::READ_ONLY,
            );
            harness.register(p, DeliveryPolicy::updates_only(), Capabilities::READ_ONLY);
            harness.register(p, DeliveryPolicy::silent(), Capabilities::WRITE_ONLY);
        }
        harness
    }

    fn register(&mut self, p: usize, policy: DeliveryPolicy, capabilities: Capabilities) {
        let (id, commands) = self.proxies[p].core.register(policy, capabilities);
        self.proxies[p].consumers.push(SimConsumer {
            id,
            policy,
            capabilities,
            view: None,
            wrote: false,
        });
        self.execute(p, commands);
        self.collect_deliveries(p);
    }

    /// Run random operations, interleaved with delivery bursts
    pub fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            self.result.total_operations += 1;

            if self.rng.gen_bool(self.config.late_join_prob) {
                let p = self.rng.index(self.proxies.len());
                self.register(p, DeliveryPolicy::synced(), Capabilities::READ_WRITE);
            }

            if self.rng.gen_bool(self.config.remote_write_prob) {
                self.remote_write();
            } else {
                self.local_write();
            }

            if self.rng.gen_bool(self.config.delivery_prob) {
                let p = self.rng.index(self.proxies.len());
                let burst = self.rng.gen_range(1, 6) as usize;
                for _ in 0..burst {
                    if !self.deliver_one(p, true) {
                        break;
                    }
                }
            }
        }
    }

    fn random_write(&mut self) -> LocalWrite {
        let n = self.rng.gen_range(0, self.config.value_pool);
        match self.config.kind {
            StoreKind::Singleton => {
                if self.rng.gen_bool(0.15) {
                    LocalWrite::Clear
                } else {
                    LocalWrite::Set(Entity::new("value", json!(n)))
                }
            }
            StoreKind::Collection | StoreKind::BigCollection => {
                let id = EntityId::new(format!("e{}", n));
                if self.rng.gen_bool(0.35) {
                    LocalWrite::Remove(id)
                } else {
                    LocalWrite::Store {
                        entity: payload(&id),
                        key: None,
                    }
                }
            }
        }
    }

    fn local_write(&mut self) {
        let p = self.rng.index(self.proxies.len());
        let writers: Vec<usize> = self.proxies[p]
            .consumers
            .iter()
            .enumerate()
            .filter(|(_, c)| c.capabilities.write)
            .map(|(i, _)| i)
            .collect();
        let Some(&c) = self.rng.choose(&writers) else {
            return;
        };
        let write = self.random_write();
        let consumer = self.proxies[p].consumers[c].id;
        self.proxies[p].consumers[c].wrote = true;

        match self.proxies[p].core.write(consumer, write) {
            Ok(Some(command)) => {
                self.result.local_writes += 1;
                self.execute(p, vec![command]);
            }
            Ok(None) => {}
            Err(e) => self
                .result
                .invariant_violations
                .push(format!("proxy {} refused a valid write: {}", p, e)),
        }
        self.collect_deliveries(p);
    }

    fn remote_write(&mut self) {
        let op = match self.random_write() {
            LocalWrite::Set(entity) => WriteOp::Set(entity),
            LocalWrite::Clear => WriteOp::Clear,
            LocalWrite::Store { entity, .. } => {
                self.next_remote_key += 1;
                WriteOp::Store {
                    entity,
                    key: ProvenanceKey::new(format!("remote:k{}", self.next_remote_key)),
                }
            }
            LocalWrite::Remove(id) => WriteOp::Remove { id, keys: Vec::new() },
        };
        self.result.remote_writes += 1;
        if let Err(e) = self.commit(op, None, None) {
            self.result
                .invariant_violations
                .push(format!("remote write rejected: {}", e));
        }
    }

    /// Commits to the store and broadcasts the resulting event.
    fn commit(
        &mut self,
        op: WriteOp,
        barrier: Option<BarrierToken>,
        originator: Option<Originator>,
    ) -> Result<WriteAck, StorageError> {
        let (ack, event) = self.store.apply(op, barrier, originator)?;
        if let Some(event) = event {
            self.log.push(event.clone());
            self.broadcast(event);
        }
        Ok(ack)
    }

    fn broadcast(&mut self, event: StoreEvent) {
        for p in 0..self.proxies.len() {
            if !self.proxies[p].listening {
                continue;
            }
            if self.rng.gen_bool(self.config.drop_prob) {
                self.result.events_dropped += 1;
                continue;
            }
            self.proxies[p].inbox.push(Inbound::Event(event.clone()));
            if self.rng.gen_bool(self.config.duplicate_prob) {
                self.result.events_duplicated += 1;
                self.proxies[p].inbox.push(Inbound::Event(event.clone()));
            }
        }
    }

    fn execute(&mut self, p: usize, commands: Vec<Command>) {
        for command in commands {
            match command {
                Command::Initialize => self.proxies[p].listening = true,
                Command::Synchronize => {
                    self.result.syncs_served += 1;
                    let snapshot = self.store.snapshot();
                    self.proxies[p].inbox.push(Inbound::Snapshot(snapshot));
                }
                Command::Write {
                    op,
                    barrier,
                    originator,
                } => {
                    let inbound = match self.commit(op, barrier.clone(), Some(originator)) {
                        Ok(ack) => Inbound::Ack { barrier, ack },
                        Err(error) => Inbound::Rejected { barrier, error },
                    };
                    self.proxies[p].inbox.push(inbound);
                }
            }
        }
    }

    /// Delivers one queued message to proxy `p`. Returns false if none.
    fn deliver_one(&mut self, p: usize, reorder: bool) -> bool {
        let inbox_len = self.proxies[p].inbox.len();
        if inbox_len == 0 {
            return false;
        }
        let pick = if reorder && self.rng.gen_bool(self.config.reorder_prob) {
            self.rng.index(inbox_len)
        } else {
            0
        };
        let inbound = self.proxies[p].inbox.remove(pick);

        let core = &mut self.proxies[p].core;
        let commands = match inbound {
            Inbound::Event(event) => {
                self.result.events_delivered += 1;
                core.on_event(event)
            }
            Inbound::Snapshot(snapshot) => core.on_sync_response(snapshot),
            Inbound::Ack { barrier, ack } => {
                core.on_write_ack(barrier.as_ref(), ack);
                Vec::new()
            }
            Inbound::Rejected { barrier, error } => {
                core.on_write_failed(barrier.as_ref(), &error);
                self.result
                    .invariant_violations
                    .push(format!("proxy {} write rejected: {}", p, error));
                Vec::new()
            }
        };
        self.execute(p, commands);
        self.collect_deliveries(p);
        true
    }

    fn collect_deliveries(&mut self, p: usize) {
        let proxy = &mut self.proxies[p];
        for delivery in proxy.core.take_deliveries() {
            let Some(consumer) = proxy
                .consumers
                .iter_mut()
                .find(|c| c.id == delivery.consumer)
            else {
                self.result.invariant_violations.push(format!(
                    "proxy {} delivered to unknown {}",
                    p, delivery.consumer
                ));
                continue;
            };
            if let Err(violation) = observe(consumer, delivery.notification) {
                self.result
                    .invariant_violations
                    .push(format!("proxy {} {}: {}", p, consumer.id, violation));
            }
        }
    }

    /// Deliver everything, retransmitting lost events, until no proxy has
    /// anything left to learn.
    pub fn quiesce(&mut self) {
        for round in 0..MAX_QUIESCE_ROUNDS {
            for p in 0..self.proxies.len() {
                while self.deliver_one(p, false) {}
            }

            let mut retransmitted = 0;
            for p in 0..self.proxies.len() {
                let proxy = &mut self.proxies[p];
                if !proxy.listening || proxy.core.state() == SyncState::Unsynced {
                    continue;
                }
                let local = proxy.core.local_version().unwrap_or(0);
                for event in self.log.iter().filter(|e| e.version > local) {
                    proxy.inbox.push(Inbound::Event(event.clone()));
                    retransmitted += 1;
                }
            }
            self.result.retransmissions += retransmitted;
            if retransmitted == 0 && self.proxies.iter().all(|p| p.inbox.is_empty()) {
                debug!(seed = self.config.seed, round, "quiesced");
                return;
            }
        }
        self.result
            .invariant_violations
            .push(format!("did not quiesce in {} rounds", MAX_QUIESCE_ROUNDS));
    }

    /// Compares every synchronized cache to the store and every synced
    /// consumer view to its cache.
    pub fn check_convergence(&mut self) {
        let truth = normalize(self.store.snapshot().model.to_value());
        let store_version = self.store.version();
        let mut violations = Vec::new();

        for (p, proxy) in self.proxies.iter().enumerate() {
            let core = &proxy.core;
            self.result.desyncs += core.stats().desyncs;
            #[cfg(debug_assertions)]
            core.verify_invariants();

            if core.state() != SyncState::Synced {
                violations.push(format!("proxy {} ended {:?}", p, core.state()));
                continue;
            }
            if core.local_version() != Some(store_version) {
                violations.push(format!(
                    "proxy {} at version {:?}, store at {}",
                    p,
                    core.local_version(),
                    store_version
                ));
            }
            if let Some(token) = core.pending_barrier() {
                violations.push(format!("proxy {} still holds barrier {}", p, token));
            }
            let cached = normalize(core.value());
            if cached != truth {
                violations.push(format!(
                    "proxy {} cache {:?} differs from store {:?}",
                    p, cached, truth
                ));
            }

            for consumer in proxy.consumers.iter().filter(|c| c.is_synced()) {
                match &consumer.view {
                    Some(view) if normalize(view.clone()) == cached => {}
                    Some(view) => violations.push(format!(
                        "proxy {} {} sees {:?}, cache is {:?}",
                        p, consumer.id, view, cached
                    )),
                    None => violations.push(format!(
                        "proxy {} {} never received a sync",
                        p, consumer.id
                    )),
                }
            }
        }

        self.result.invariant_violations.extend(violations);
        self.result.converged = self.result.invariant_violations.is_empty();
    }

    pub fn result(&self) -> &ProxyDstResult {
        &self.result
    }

    pub fn into_result(self) -> ProxyDstResult {
        self.result
    }
}

/// Applies one notification to a consumer's reconstructed view.
fn observe(consumer: &mut SimConsumer, notification: Notification) -> Result<(), String> {
    if !consumer.capabilities.read {
        return Err(format!("write-only consumer got {}", notification.name()));
    }
    match notification {
        Notification::Sync(value) if consumer.is_synced() => {
            consumer.view = Some(value);
            Ok(())
        }
        Notification::Desync if consumer.is_synced() => {
            if !consumer.policy.notify_desync {
                return Err("desync delivered against policy".to_string());
            }
            Ok(())
        }
        Notification::Sync(_) | Notification::Desync => {
            Err("raw consumer got a sync-state notification".to_string())
        }
        Notification::Update { change, originator } => {
            if originator && !consumer.wrote {
                return Err("originator flag on a consumer that never wrote".to_string());
            }
            if !consumer.is_synced() {
                return Ok(());
            }
            let Some(view) = consumer.view.as_mut() else {
                return Err("update before first sync".to_string());
            };
            apply_change(view, change)
        }
    }
}

fn apply_change(view: &mut StoreValue, change: Change) -> Result<(), String> {
    match (view, change) {
        (view @ StoreValue::Singleton(_), Change::Singleton(value)) => {
            *view = StoreValue::Singleton(value);
            Ok(())
        }
        (StoreValue::Collection(items), Change::Collection { added, removed }) => {
            for entity in removed {
                let before = items.len();
                items.retain(|e| e.id != entity.id);
                if items.len() == before {
                    return Err(format!("removal of absent {}", entity.id));
                }
            }
            for entity in added {
                if items.iter().any(|e| e.id == entity.id) {
                    return Err(format!("addition of present {}", entity.id));
                }
                items.push(entity);
            }
            Ok(())
        }
        (_, change) => Err(format!("change of the wrong kind: {:?}", change)),
    }
}

fn normalize(value: StoreValue) -> StoreValue {
    match value {
        StoreValue::Collection(mut items) => {
            items.sort_by(|a, b| a.id.cmp(&b.id));
            StoreValue::Collection(items)
        }
        singleton => singleton,
    }
}

/// Collection payloads are a function of the id, so payload replacement
/// never makes replicas differ.
fn payload(id: &EntityId) -> Entity {
    Entity {
        id: id.clone(),
        data: json!({ "name": id.as_str() }),
    }
}

// =============================================================================
// Batch Runner
// =============================================================================

/// Run a batch of proxy DST tests
pub fn run_proxy_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> ProxyDstConfig,
) -> Vec<ProxyDstResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let mut harness = ProxyDstHarness::new(config_fn(seed));
        harness.run(ops_per_run);
        harness.quiesce();
        harness.check_convergence();
        results.push(harness.into_result());
    }

    results
}

/// Summarize batch results
pub fn summarize_batch(results: &[ProxyDstResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let total_events: u64 = results.iter().map(|r| r.events_delivered).sum();
    let total_drops: u64 = results.iter().map(|r| r.events_dropped).sum();
    let total_desyncs: u64 = results.iter().map(|r| r.desyncs).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops, {} events, {} drops, {} desyncs",
        passed, total, total_ops, total_events, total_drops, total_desyncs
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(config: ProxyDstConfig, ops: usize) -> ProxyDstResult {
        let mut harness = ProxyDstHarness::new(config);
        harness.run(ops);
        harness.quiesce();
        harness.check_convergence();
        harness.into_result()
    }

    #[test]
    fn test_proxy_dst_single_calm_collection() {
        let result = run(ProxyDstConfig::calm(42), 100);
        assert!(
            result.is_success(),
            "Calm should converge: {:?}",
            result.invariant_violations
        );
        assert!(result.local_writes > 0);
        assert_eq!(result.events_dropped, 0);
    }

    #[test]
    fn test_proxy_dst_chaos_desyncs_and_recovers() {
        let result = run(ProxyDstConfig::chaos(3), 300);
        assert!(result.is_success(), "{}: {:?}", result.summary(), result.invariant_violations);
        assert!(result.events_dropped > 0);
        assert!(result.desyncs > 0, "chaos should force at least one desync");
    }

    #[test]
    fn test_observe_rejects_update_before_sync() {
        let mut consumer = SimConsumer {
            id: ConsumerId::new(1),
            policy: DeliveryPolicy::synced(),
            capabilities: Capabilities::READ_ONLY,
            view: None,
            wrote: false,
        };
        let update = Notification::Update {
            change: Change::Singleton(None),
            originator: false,
        };
        assert!(observe(&mut consumer, update.clone()).is_err());

        observe(&mut consumer, Notification::Sync(StoreValue::Singleton(None))).unwrap();
        observe(&mut consumer, update).unwrap();

        let flagged = Notification::Update {
            change: Change::Singleton(None),
            originator: true,
        };
        assert!(observe(&mut consumer, flagged).is_err());
    }
}
