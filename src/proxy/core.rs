//! Storage proxy core
//!
//! One process-local replica of one store, multiplexed across consumers.
//! The core does no I/O: every entry point mutates state, queues deliveries
//! in the outbox, and returns the `Command`s the caller must carry out
//! against the backing store. `ProxyActor` drives it over tokio channels;
//! the simulator drives it directly.
//!
//! ## State machine
//!
//! ```text
//!  Unsynced ──register(keep_synced)──► Synchronizing ──snapshot──► Synced
//!                                                                  │  ▲
//!                                         gap / buffer overflow    │  │ snapshot, or the
//!                                                                  ▼  │ gap filled itself
//!                                                                 Desynced
//! ```
//!
//! Events are only sequenced once a synced registration asked for a
//! snapshot. Until then (and for big collections, which are never cached)
//! they are only passed through to consumers that take raw updates.

use crate::backend::{Mutation, StoreEvent, StoreModel, SyncResponse, WriteAck, WriteOp};
use crate::error::StorageError;
use crate::proxy::registry::{ConsumerRegistry, Registration};
use crate::proxy::scheduler::{Change, Delivery, DeliveryQueue, Notification};
use crate::replication::barrier::{BarrierScope, Verdict, WriteBarrier};
use crate::replication::provenance::ProvenanceSet;
use crate::replication::sequencer::{Offer, VersionSequencer};
use crate::types::{
    BarrierToken, Capabilities, ConsumerId, DeliveryPolicy, Entity, EntityId, Originator,
    ProvenanceKey, ProxyId, StoreInfo, StoreKind, StoreValue, Version,
};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsynced,
    Synchronizing,
    Synced,
    Desynced,
}

/// Backing-store work requested by the core.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Register the proxy's event listener.
    Initialize,
    /// Request a full snapshot; answer with `on_sync_response`.
    Synchronize,
    /// Forward a write; answer with `on_write_ack` or `on_write_failed`.
    Write {
        op: WriteOp,
        barrier: Option<BarrierToken>,
        originator: Originator,
    },
}

/// A write as issued by a consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalWrite {
    Set(Entity),
    Clear,
    /// Without a key, the proxy mints one.
    Store {
        entity: Entity,
        key: Option<ProvenanceKey>,
    },
    /// Retracts every key the proxy observed for the entity.
    Remove(EntityId),
}

impl LocalWrite {
    pub fn name(&self) -> &'static str {
        match self {
            LocalWrite::Set(_) => "set",
            LocalWrite::Clear => "clear",
            LocalWrite::Store { .. } => "store",
            LocalWrite::Remove(_) => "remove",
        }
    }

    fn applies_to(&self, kind: StoreKind) -> bool {
        match self {
            LocalWrite::Set(_) | LocalWrite::Clear => kind == StoreKind::Singleton,
            LocalWrite::Store { .. } | LocalWrite::Remove(_) => kind != StoreKind::Singleton,
        }
    }
}

/// Outcome of a read: served from cache, or must go to the backing store.
#[derive(Debug, Clone, PartialEq)]
pub enum Read<T> {
    Cached(T),
    Forward,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProxyStats {
    pub events_applied: u64,
    pub events_suppressed: u64,
    pub stale_events: u64,
    pub duplicate_events: u64,
    pub desyncs: u64,
    pub sync_requests: u64,
    pub snapshots_applied: u64,
    pub stale_snapshots: u64,
    pub sync_failures: u64,
    pub overflows: u64,
    pub writes_forwarded: u64,
    pub writes_skipped: u64,
    pub writes_rejected: u64,
}

#[derive(Debug)]
enum Cache {
    Singleton {
        /// What consumers see.
        visible: Option<Entity>,
        /// Latest sequenced value, including suppressed events.
        shadow: Option<Entity>,
    },
    Collection(ProvenanceSet),
    /// Big collections are never cached.
    PassThrough,
}

pub struct ProxyCore {
    id: ProxyId,
    info: StoreInfo,
    state: SyncState,
    sequencer: VersionSequencer<StoreEvent>,
    barrier: WriteBarrier,
    cache: Cache,
    registry: ConsumerRegistry,
    outbox: DeliveryQueue,
    initialized: bool,
    sync_in_flight: bool,
    /// Set after a buffer overflow: only a snapshot may restore `Synced`.
    needs_snapshot: bool,
    next_key: u64,
    next_barrier: u64,
    stats: ProxyStats,
}

impl ProxyCore {
    pub fn new(id: ProxyId, info: StoreInfo, max_buffered_events: usize) -> Self {
        let cache = match info.kind {
            StoreKind::Singleton => Cache::Singleton {
                visible: None,
                shadow: None,
            },
            StoreKind::Collection => Cache::Collection(ProvenanceSet::new()),
            StoreKind::BigCollection => Cache::PassThrough,
        };
        ProxyCore {
            barrier: WriteBarrier::new(BarrierScope::for_kind(info.kind)),
            id,
            info,
            state: SyncState::Unsynced,
            sequencer: VersionSequencer::new(max_buffered_events),
            cache,
            registry: ConsumerRegistry::new(),
            outbox: DeliveryQueue::new(),
            initialized: false,
            sync_in_flight: false,
            needs_snapshot: false,
            next_key: 0,
            next_barrier: 0,
            stats: ProxyStats::default(),
        }
    }

    pub fn id(&self) -> &ProxyId {
        &self.id
    }

    pub fn info(&self) -> &StoreInfo {
        &self.info
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn local_version(&self) -> Option<Version> {
        self.sequencer.local_version()
    }

    pub fn stats(&self) -> ProxyStats {
        self.stats
    }

    pub fn registry(&self) -> &ConsumerRegistry {
        &self.registry
    }

    pub fn pending_barrier(&self) -> Option<&BarrierToken> {
        self.barrier.pending_token()
    }

    pub fn sync_in_flight(&self) -> bool {
        self.sync_in_flight
    }

    /// Versions waiting in the reorder buffer.
    pub fn buffered_versions(&self) -> Vec<Version> {
        self.sequencer.buffered_versions()
    }

    fn is_pass_through(&self) -> bool {
        matches!(self.cache, Cache::PassThrough)
    }

    /// Current cached value as consumers see it.
    pub fn value(&self) -> StoreValue {
        match &self.cache {
            Cache::Singleton { visible, .. } => StoreValue::Singleton(visible.clone()),
            Cache::Collection(set) => StoreValue::Collection(set.list()),
            Cache::PassThrough => StoreValue::empty(self.info.kind),
        }
    }

    /// Provenance keys the proxy has observed for `id`.
    pub fn observed_keys(&self, id: &EntityId) -> Vec<ProvenanceKey> {
        match &self.cache {
            Cache::Collection(set) => set.keys(id),
            _ => Vec::new(),
        }
    }

    pub fn take_deliveries(&mut self) -> Vec<Delivery> {
        self.outbox.drain().collect()
    }

    pub fn has_deliveries(&self) -> bool {
        !self.outbox.is_empty()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn register(
        &mut self,
        policy: DeliveryPolicy,
        capabilities: Capabilities,
    ) -> (ConsumerId, Vec<Command>) {
        let registration = self.registry.register(policy, capabilities);
        let mut commands = Vec::new();
        debug!(
            proxy = %self.id,
            consumer = %registration.id,
            keep_synced = policy.keep_synced,
            read = capabilities.read,
            write = capabilities.write,
            "registered consumer"
        );

        if !capabilities.read {
            return (registration.id, commands);
        }
        if !self.initialized {
            self.initialized = true;
            commands.push(Command::Initialize);
        }
        if self.is_pass_through() || !registration.is_synced() {
            return (registration.id, commands);
        }

        match self.state {
            SyncState::Unsynced => {
                self.state = SyncState::Synchronizing;
                self.request_sync(&mut commands);
            }
            SyncState::Synced => {
                if registration.wants_sync() {
                    let value = self.value();
                    self.outbox.push(registration.id, Notification::Sync(value));
                }
            }
            SyncState::Synchronizing | SyncState::Desynced => self.request_sync(&mut commands),
        }
        (registration.id, commands)
    }

    /// Removes a registration and anything still queued for it. The cache
    /// outlives every registration.
    pub fn deregister(&mut self, consumer: ConsumerId) -> Result<(), StorageError> {
        self.registry.deregister(consumer)?;
        let discarded = self.outbox.discard(consumer);
        debug!(proxy = %self.id, consumer = %consumer, discarded, "deregistered consumer");
        Ok(())
    }

    // =========================================================================
    // Event stream
    // =========================================================================

    pub fn on_event(&mut self, event: StoreEvent) -> Vec<Command> {
        let mut commands = Vec::new();
        if event.store != self.info.id {
            warn!(proxy = %self.id, store = %event.store, "event for a different store");
            return commands;
        }

        self.deliver_raw(&event);
        if self.is_pass_through() || self.state == SyncState::Unsynced {
            return commands;
        }

        let version = event.version;
        match self.sequencer.offer(version, event) {
            Offer::Stale => {
                self.stats.stale_events += 1;
                debug!(proxy = %self.id, version, "discarding stale event");
                return commands;
            }
            Offer::Duplicate => {
                self.stats.duplicate_events += 1;
                debug!(proxy = %self.id, version, "discarding duplicate event");
                return commands;
            }
            Offer::Overflow => {
                self.stats.overflows += 1;
                self.needs_snapshot = true;
                warn!(
                    proxy = %self.id,
                    version,
                    "reorder buffer overflow, waiting for resync"
                );
                self.enter_desync(&mut commands);
                return commands;
            }
            Offer::Accepted => {}
        }

        let deliver = self.state == SyncState::Synced;
        self.drain_sequenced(deliver);

        if self.sequencer.has_gap() {
            debug!(
                proxy = %self.id,
                local = ?self.sequencer.local_version(),
                buffered = ?self.sequencer.buffered_versions(),
                "version gap"
            );
            self.enter_desync(&mut commands);
        } else if self.state == SyncState::Desynced
            && !self.needs_snapshot
            && self.sequencer.buffered() == 0
        {
            self.state = SyncState::Synced;
            info!(
                proxy = %self.id,
                version = ?self.sequencer.local_version(),
                "gap filled, synchronized without snapshot"
            );
            self.notify_sync();
        }

        #[cfg(debug_assertions)]
        self.verify_invariants();

        commands
    }

    pub fn on_sync_response(&mut self, response: SyncResponse) -> Vec<Command> {
        self.sync_in_flight = false;
        let mut commands = Vec::new();
        if self.is_pass_through() {
            return commands;
        }

        if let Some(local) = self.sequencer.local_version() {
            if response.version <= local {
                self.stats.stale_snapshots += 1;
                warn!(
                    proxy = %self.id,
                    snapshot = response.version,
                    local,
                    "discarding stale snapshot"
                );
                if self.state == SyncState::Desynced {
                    self.request_sync(&mut commands);
                }
                return commands;
            }
        }

        // Already caught up through the event stream; the events the snapshot
        // covers are still on their way and will be sequenced normally.
        if self.state == SyncState::Synced {
            self.stats.stale_snapshots += 1;
            debug!(
                proxy = %self.id,
                snapshot = response.version,
                "already synchronized, discarding snapshot"
            );
            return commands;
        }

        let barrier_pending = self.barrier.is_pending();
        match (&mut self.cache, response.model) {
            (Cache::Singleton { visible, shadow }, StoreModel::Singleton(value)) => {
                // A pending write stays visible until its barrier clears.
                if !barrier_pending {
                    *visible = value.clone();
                }
                *shadow = value;
            }
            (Cache::Collection(set), StoreModel::Collection(entries)) => {
                *set = ProvenanceSet::from_literal(entries);
            }
            (_, _) => {
                warn!(proxy = %self.id, kind = %self.info.kind, "snapshot of the wrong kind");
                return commands;
            }
        }

        let discarded = self.sequencer.anchor(response.version);
        self.needs_snapshot = false;
        self.stats.snapshots_applied += 1;
        debug!(
            proxy = %self.id,
            version = response.version,
            discarded,
            replaying = self.sequencer.buffered(),
            "applying snapshot"
        );
        self.drain_sequenced(false);

        if self.sequencer.has_gap() {
            if self.state == SyncState::Synchronizing {
                self.state = SyncState::Desynced;
            }
            self.request_sync(&mut commands);
            return commands;
        }

        let previous = self.state;
        self.state = SyncState::Synced;
        info!(
            proxy = %self.id,
            from = ?previous,
            version = ?self.sequencer.local_version(),
            "synchronized"
        );
        self.notify_sync();

        #[cfg(debug_assertions)]
        self.verify_invariants();

        commands
    }

    /// Records a failed snapshot request. The state is left alone so the
    /// owner can ask again through [`ProxyCore::retry_sync`].
    pub fn on_sync_failed(&mut self, error: &StorageError) {
        self.sync_in_flight = false;
        self.stats.sync_failures += 1;
        warn!(proxy = %self.id, %error, state = ?self.state, "synchronization failed");
    }

    /// Requests a snapshot if one is still owed and none is in flight.
    pub fn retry_sync(&mut self) -> Vec<Command> {
        let mut commands = Vec::new();
        if matches!(self.state, SyncState::Synchronizing | SyncState::Desynced) {
            self.request_sync(&mut commands);
        }
        commands
    }

    fn request_sync(&mut self, commands: &mut Vec<Command>) {
        if self.sync_in_flight {
            return;
        }
        self.sync_in_flight = true;
        self.stats.sync_requests += 1;
        commands.push(Command::Synchronize);
    }

    fn enter_desync(&mut self, commands: &mut Vec<Command>) {
        if self.state == SyncState::Synced {
            self.state = SyncState::Desynced;
            self.stats.desyncs += 1;
            info!(
                proxy = %self.id,
                local = ?self.sequencer.local_version(),
                "desynchronized"
            );
            for consumer in self.registry.matching(Registration::wants_desync) {
                self.outbox.push(consumer, Notification::Desync);
            }
        }
        self.request_sync(commands);
    }

    fn notify_sync(&mut self) {
        let consumers = self.registry.matching(Registration::wants_sync);
        if consumers.is_empty() {
            return;
        }
        let value = self.value();
        for consumer in consumers {
            self.outbox.push(consumer, Notification::Sync(value.clone()));
        }
    }

    fn drain_sequenced(&mut self, deliver: bool) {
        while let Some((_, event)) = self.sequencer.pop_next() {
            self.apply_sequenced(event, deliver);
        }
        self.release_covered_barrier(deliver);
    }

    fn apply_sequenced(&mut self, event: StoreEvent, deliver: bool) {
        self.stats.events_applied += 1;
        let verdict = self.barrier.check(event.barrier.as_ref());
        let version = event.version;

        let change = match (&mut self.cache, event.mutation) {
            (Cache::Singleton { visible, shadow }, mutation) => {
                let next = match mutation {
                    Mutation::Set(entity) => Some(entity),
                    Mutation::Clear => None,
                    other => {
                        warn!(proxy = %self.id, op = other.name(), "collection event on a singleton");
                        return;
                    }
                };
                *shadow = next.clone();
                match verdict {
                    Verdict::Suppressed => {
                        self.stats.events_suppressed += 1;
                        debug!(proxy = %self.id, version, "suppressed behind pending write");
                        None
                    }
                    Verdict::Confirmed => {
                        debug!(proxy = %self.id, version, "write confirmed");
                        *visible = next;
                        None
                    }
                    Verdict::Deliver if *visible != next => {
                        *visible = next.clone();
                        Some(Change::Singleton(next))
                    }
                    Verdict::Deliver => None,
                }
            }
            (Cache::Collection(set), Mutation::Add { entity, key, .. }) => {
                if verdict == Verdict::Confirmed {
                    debug!(proxy = %self.id, version, "write confirmed");
                }
                if set.add(entity.clone(), key) {
                    Some(Change::added(entity))
                } else {
                    None
                }
            }
            (Cache::Collection(set), Mutation::Remove { entity, keys, .. }) => {
                if verdict == Verdict::Confirmed {
                    debug!(proxy = %self.id, version, "write confirmed");
                }
                set.remove(&entity.id, &keys).map(Change::removed)
            }
            (Cache::Collection(_), other) => {
                warn!(proxy = %self.id, op = other.name(), "singleton event on a collection");
                None
            }
            (Cache::PassThrough, _) => None,
        };

        if let (true, Some(change)) = (deliver, change) {
            let writer = event.originator.as_ref().map(|o| o.consumer);
            self.fan_out(change, writer, event.originator.as_ref());
        }
    }

    /// Releases a barrier whose acknowledged version is already applied,
    /// surfacing the shadow value if it differs from what consumers saw.
    fn release_covered_barrier(&mut self, deliver: bool) {
        let Some(local) = self.sequencer.local_version() else {
            return;
        };
        let Some(token) = self.barrier.release_if_covered(local) else {
            return;
        };
        debug!(proxy = %self.id, barrier = %token, local, "barrier released by version");

        let change = match &mut self.cache {
            Cache::Singleton { visible, shadow } if visible != shadow => {
                *visible = shadow.clone();
                Some(Change::Singleton(shadow.clone()))
            }
            _ => None,
        };
        if let (true, Some(change)) = (deliver, change) {
            self.fan_out(change, None, None);
        }
    }

    /// Queues a sequenced or local change for every synced consumer taking
    /// updates. `writer` is flagged as originator if `origin` is this proxy.
    fn fan_out(
        &mut self,
        change: Change,
        writer: Option<ConsumerId>,
        origin: Option<&Originator>,
    ) {
        let own = origin.map_or(true, |o| o.proxy == self.id);
        for consumer in self.registry.matching(Registration::wants_sequenced_updates) {
            let originator = own && writer == Some(consumer);
            self.outbox.push(
                consumer,
                Notification::Update {
                    change: change.clone(),
                    originator,
                },
            );
        }
    }

    /// Passes the raw event to consumers that are not kept in sync.
    fn deliver_raw(&mut self, event: &StoreEvent) {
        let consumers = self.registry.matching(Registration::wants_raw_updates);
        if consumers.is_empty() {
            return;
        }
        let change = match &event.mutation {
            Mutation::Set(entity) => Change::Singleton(Some(entity.clone())),
            Mutation::Clear => Change::Singleton(None),
            Mutation::Add {
                entity,
                effective: true,
                ..
            } => Change::added(entity.clone()),
            Mutation::Remove {
                entity,
                effective: true,
                ..
            } => Change::removed(entity.clone()),
            Mutation::Add { .. } | Mutation::Remove { .. } => return,
        };
        for consumer in consumers {
            let originator = event
                .originator
                .as_ref()
                .map_or(false, |o| o.proxy == self.id && o.consumer == consumer);
            self.outbox.push(
                consumer,
                Notification::Update {
                    change: change.clone(),
                    originator,
                },
            );
        }
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Applies `write` locally when the cache is synchronized and returns the
    /// forward command. `None` means the write was redundant and skipped.
    pub fn write(
        &mut self,
        consumer: ConsumerId,
        write: LocalWrite,
    ) -> Result<Option<Command>, StorageError> {
        let registration = *self.registry.get(consumer)?;
        if !registration.capabilities.write {
            return Err(StorageError::CapabilityViolation {
                consumer,
                operation: write.name(),
            });
        }
        if !write.applies_to(self.info.kind) {
            return Err(StorageError::KindMismatch {
                store: self.info.id.clone(),
                kind: self.info.kind,
                operation: write.name(),
            });
        }
        let originator = Originator::new(self.id.clone(), consumer);

        let optimistic = registration.capabilities.read
            && self.state == SyncState::Synced
            && !self.is_pass_through();
        if !optimistic {
            let op = match write {
                LocalWrite::Set(entity) => WriteOp::Set(entity),
                LocalWrite::Clear => WriteOp::Clear,
                LocalWrite::Store { entity, key } => WriteOp::Store {
                    entity,
                    key: key.unwrap_or_else(|| self.mint_key()),
                },
                LocalWrite::Remove(id) => WriteOp::Remove { id, keys: Vec::new() },
            };
            self.stats.writes_forwarded += 1;
            debug!(proxy = %self.id, consumer = %consumer, op = op.name(), "forwarding write");
            return Ok(Some(Command::Write {
                op,
                barrier: None,
                originator,
            }));
        }

        let applied = match (&mut self.cache, write) {
            (Cache::Singleton { visible, .. }, LocalWrite::Set(entity)) => {
                if visible.as_ref() == Some(&entity) {
                    None
                } else {
                    *visible = Some(entity.clone());
                    Some((
                        WriteOp::Set(entity.clone()),
                        Some(Change::Singleton(Some(entity))),
                    ))
                }
            }
            (Cache::Singleton { visible, .. }, LocalWrite::Clear) => {
                if visible.is_none() {
                    None
                } else {
                    *visible = None;
                    Some((WriteOp::Clear, Some(Change::Singleton(None))))
                }
            }
            (Cache::Collection(set), LocalWrite::Store { entity, key }) => {
                let key = key.unwrap_or_else(|| {
                    ProvenanceKey::new(mint(&self.id, &mut self.next_key, 'k'))
                });
                let change = set
                    .add(entity.clone(), key.clone())
                    .then(|| Change::added(entity.clone()));
                Some((WriteOp::Store { entity, key }, change))
            }
            (Cache::Collection(set), LocalWrite::Remove(id)) => {
                let keys = set.keys(&id);
                if keys.is_empty() {
                    None
                } else {
                    let change = set.remove(&id, &keys).map(Change::removed);
                    Some((WriteOp::Remove { id, keys }, change))
                }
            }
            (_, write) => {
                return Err(StorageError::KindMismatch {
                    store: self.info.id.clone(),
                    kind: self.info.kind,
                    operation: write.name(),
                })
            }
        };

        let Some((op, change)) = applied else {
            self.stats.writes_skipped += 1;
            debug!(proxy = %self.id, consumer = %consumer, "skipping redundant write");
            return Ok(None);
        };

        let token = self.mint_barrier();
        if let Some(replaced) = self.barrier.arm(token.clone()) {
            debug!(proxy = %self.id, replaced = %replaced, barrier = %token, "barrier replaced");
        }
        if let Some(change) = change {
            self.fan_out(change, Some(consumer), None);
        }
        self.stats.writes_forwarded += 1;
        debug!(proxy = %self.id, consumer = %consumer, op = op.name(), barrier = %token, "optimistic write");

        #[cfg(debug_assertions)]
        self.verify_invariants();

        Ok(Some(Command::Write {
            op,
            barrier: Some(token),
            originator,
        }))
    }

    pub fn on_write_ack(&mut self, barrier: Option<&BarrierToken>, ack: WriteAck) {
        let Some(token) = barrier else {
            return;
        };
        if self.barrier.acknowledge(token, ack.version) {
            let deliver = self.state == SyncState::Synced;
            self.release_covered_barrier(deliver);
        }
    }

    /// The optimistic effect stays in place; only the barrier is released.
    pub fn on_write_failed(&mut self, barrier: Option<&BarrierToken>, error: &StorageError) {
        self.stats.writes_rejected += 1;
        warn!(proxy = %self.id, %error, "write rejected by backing store");
        if let Some(token) = barrier {
            self.barrier.fail(token);
        }
    }

    fn mint_key(&mut self) -> ProvenanceKey {
        ProvenanceKey::new(mint(&self.id, &mut self.next_key, 'k'))
    }

    fn mint_barrier(&mut self) -> BarrierToken {
        BarrierToken::new(mint(&self.id, &mut self.next_barrier, 'b'))
    }

    // =========================================================================
    // Reads
    // =========================================================================

    fn readable(&self, consumer: ConsumerId, operation: &'static str) -> Result<Registration, StorageError> {
        let registration = *self.registry.get(consumer)?;
        if !registration.capabilities.read {
            return Err(StorageError::CapabilityViolation {
                consumer,
                operation,
            });
        }
        Ok(registration)
    }

    fn require_kind(&self, ok: bool, operation: &'static str) -> Result<(), StorageError> {
        if ok {
            Ok(())
        } else {
            Err(StorageError::KindMismatch {
                store: self.info.id.clone(),
                kind: self.info.kind,
                operation,
            })
        }
    }

    fn serves_from_cache(&self, registration: &Registration) -> bool {
        self.state == SyncState::Synced && registration.is_synced() && !self.is_pass_through()
    }

    /// Singleton value.
    pub fn fetch(&self, consumer: ConsumerId) -> Result<Read<Option<Entity>>, StorageError> {
        let registration = self.readable(consumer, "fetch")?;
        self.require_kind(self.info.kind == StoreKind::Singleton, "fetch")?;
        match &self.cache {
            Cache::Singleton { visible, .. } if self.serves_from_cache(&registration) => {
                Ok(Read::Cached(visible.clone()))
            }
            _ => Ok(Read::Forward),
        }
    }

    /// Collection members. Big collections are read through cursors.
    pub fn list(&self, consumer: ConsumerId) -> Result<Read<Vec<Entity>>, StorageError> {
        let registration = self.readable(consumer, "list")?;
        self.require_kind(self.info.kind == StoreKind::Collection, "list")?;
        match &self.cache {
            Cache::Collection(set) if self.serves_from_cache(&registration) => {
                Ok(Read::Cached(set.list()))
            }
            _ => Ok(Read::Forward),
        }
    }

    /// One collection member by id.
    pub fn fetch_entity(
        &self,
        consumer: ConsumerId,
        id: &EntityId,
    ) -> Result<Read<Option<Entity>>, StorageError> {
        let registration = self.readable(consumer, "fetch")?;
        self.require_kind(self.info.kind != StoreKind::Singleton, "fetch")?;
        match &self.cache {
            Cache::Collection(set) if self.serves_from_cache(&registration) => {
                Ok(Read::Cached(set.get(id).cloned()))
            }
            _ => Ok(Read::Forward),
        }
    }

    /// Validates a cursor call; cursors always go to the backing store.
    pub fn check_cursor(&self, consumer: ConsumerId, operation: &'static str) -> Result<(), StorageError> {
        self.readable(consumer, operation)?;
        self.require_kind(self.info.kind == StoreKind::BigCollection, operation)
    }

    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        if self.state == SyncState::Synced {
            debug_assert!(
                self.sequencer.is_anchored(),
                "Invariant: a synced proxy has applied a snapshot"
            );
            debug_assert!(
                !self.sequencer.has_gap(),
                "Invariant: a synced proxy has no version gap"
            );
        }
        if self.is_pass_through() {
            debug_assert_eq!(
                self.state,
                SyncState::Unsynced,
                "Invariant: big collections are never synchronized"
            );
        }
        if let Cache::Collection(set) = &self.cache {
            set.verify_invariants();
        }
    }
}

/// `"{proxy}:{tag}{n}"`, unique per proxy and tag.
fn mint(proxy: &ProxyId, counter: &mut u64, tag: char) -> String {
    *counter += 1;
    format!("{}:{}{}", proxy, tag, counter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn singleton() -> ProxyCore {
        ProxyCore::new(
            ProxyId::from("p1"),
            StoreInfo::volatile("s", StoreKind::Singleton),
            64,
        )
    }

    fn collection() -> ProxyCore {
        ProxyCore::new(
            ProxyId::from("p1"),
            StoreInfo::volatile("c", StoreKind::Collection),
            64,
        )
    }

    fn event(store: &str, version: Version, mutation: Mutation) -> StoreEvent {
        StoreEvent {
            store: store.into(),
            version,
            originator: None,
            barrier: None,
            mutation,
        }
    }

    fn add(id: &str, key: &str, effective: bool) -> Mutation {
        Mutation::Add {
            entity: Entity::new(id, json!(id)),
            key: ProvenanceKey::from(key),
            effective,
        }
    }

    fn synced_singleton() -> (ProxyCore, ConsumerId) {
        let mut core = singleton();
        let (consumer, commands) = core.register(DeliveryPolicy::synced(), Capabilities::READ_WRITE);
        assert_eq!(commands, vec![Command::Initialize, Command::Synchronize]);
        core.on_sync_response(SyncResponse {
            version: 0,
            model: StoreModel::Singleton(None),
        });
        core.take_deliveries();
        (core, consumer)
    }

    #[test]
    fn test_first_sync_notifies_once() {
        let mut core = collection();
        let (a, _) = core.register(DeliveryPolicy::synced(), Capabilities::READ_ONLY);
        assert_eq!(core.state(), SyncState::Synchronizing);
        core.on_sync_response(SyncResponse {
            version: 2,
            model: StoreModel::Collection(vec![]),
        });
        assert_eq!(core.state(), SyncState::Synced);
        assert_eq!(
            core.take_deliveries(),
            vec![Delivery {
                consumer: a,
                notification: Notification::Sync(StoreValue::Collection(vec![])),
            }]
        );
    }

    #[test]
    fn test_late_joiner_gets_cached_value_without_backend_call() {
        let (mut core, _) = synced_singleton();
        let (late, commands) = core.register(DeliveryPolicy::synced(), Capabilities::READ_ONLY);
        assert!(commands.is_empty());
        let deliveries = core.take_deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].consumer, late);
        assert!(matches!(deliveries[0].notification, Notification::Sync(_)));
    }

    #[test]
    fn test_events_before_snapshot_are_replayed() {
        let mut core = collection();
        core.register(DeliveryPolicy::synced(), Capabilities::READ_ONLY);
        core.on_event(event("c", 1, add("a", "k1", true)));
        core.on_event(event("c", 2, add("b", "k2", true)));
        core.on_sync_response(SyncResponse {
            version: 1,
            model: StoreModel::Collection(vec![crate::replication::provenance::LiteralEntry {
                entity: Entity::new("a", json!("a")),
                keys: vec![ProvenanceKey::from("k1")],
            }]),
        });
        assert_eq!(core.local_version(), Some(2));
        assert_eq!(core.value().ids(), vec![EntityId::from("a"), EntityId::from("b")]);
        // Sync carries the caught-up value; replayed events are not separate updates.
        let deliveries = core.take_deliveries();
        assert_eq!(deliveries.len(), 1);
        assert!(matches!(&deliveries[0].notification, Notification::Sync(v) if v.ids().len() == 2));
    }

    #[test]
    fn test_non_effective_events_are_not_delivered() {
        let mut core = collection();
        core.register(DeliveryPolicy::synced(), Capabilities::READ_ONLY);
        core.on_sync_response(SyncResponse {
            version: 0,
            model: StoreModel::Collection(vec![]),
        });
        core.take_deliveries();

        core.on_event(event("c", 1, add("a", "k1", true)));
        core.on_event(event("c", 2, add("a", "k2", false)));
        let deliveries = core.take_deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(
            deliveries[0].notification,
            Notification::Update {
                change: Change::added(Entity::new("a", json!("a"))),
                originator: false,
            }
        );
    }

    #[test]
    fn test_raw_consumers_get_effective_events_in_arrival_order() {
        let mut core = collection();
        let (raw, commands) = core.register(DeliveryPolicy::updates_only(), Capabilities::READ_ONLY);
        assert_eq!(commands, vec![Command::Initialize]);

        core.on_event(event("c", 2, add("b", "k2", true)));
        core.on_event(event("c", 1, add("a", "k1", true)));
        core.on_event(event("c", 3, add("a", "k3", false)));
        let ids: Vec<_> = core
            .take_deliveries()
            .into_iter()
            .map(|d| {
                assert_eq!(d.consumer, raw);
                match d.notification {
                    Notification::Update {
                        change: Change::Collection { added, .. },
                        ..
                    } => added[0].id.to_string(),
                    other => panic!("unexpected {:?}", other),
                }
            })
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(core.state(), SyncState::Unsynced);
    }

    #[test]
    fn test_redundant_singleton_writes_are_skipped() {
        let (mut core, consumer) = synced_singleton();
        assert_eq!(core.write(consumer, LocalWrite::Clear).unwrap(), None);

        let v = Entity::new("x", json!(1));
        assert!(core.write(consumer, LocalWrite::Set(v.clone())).unwrap().is_some());
        assert_eq!(core.write(consumer, LocalWrite::Set(v)).unwrap(), None);
        assert_eq!(core.stats().writes_skipped, 2);
    }

    #[test]
    fn test_barrier_released_by_ack_surfaces_shadow() {
        let (mut core, consumer) = synced_singleton();
        let mine = Entity::new("mine", json!(1));
        let theirs = Entity::new("theirs", json!(2));

        let Some(Command::Write { barrier, .. }) =
            core.write(consumer, LocalWrite::Set(mine.clone())).unwrap()
        else {
            panic!("expected forward");
        };
        core.take_deliveries();

        // Our confirming event (v1) is lost; a later remote write arrives at v2.
        core.on_event(event("s", 2, Mutation::Set(theirs.clone())));
        assert_eq!(core.state(), SyncState::Desynced);
        core.take_deliveries();
        core.on_sync_response(SyncResponse {
            version: 2,
            model: StoreModel::Singleton(Some(theirs.clone())),
        });
        // Barrier still pending: our write stays visible.
        assert_eq!(core.value(), StoreValue::Singleton(Some(mine)));
        core.take_deliveries();

        core.on_write_ack(barrier.as_ref(), WriteAck { version: 1 });
        assert!(core.pending_barrier().is_none());
        assert_eq!(core.value(), StoreValue::Singleton(Some(theirs.clone())));
        assert_eq!(
            core.take_deliveries()[0].notification,
            Notification::Update {
                change: Change::Singleton(Some(theirs)),
                originator: false,
            }
        );
    }

    #[test]
    fn test_write_rejection_keeps_optimistic_value() {
        let (mut core, consumer) = synced_singleton();
        let v = Entity::new("x", json!(1));
        let Some(Command::Write { barrier, .. }) =
            core.write(consumer, LocalWrite::Set(v.clone())).unwrap()
        else {
            panic!("expected forward");
        };
        core.on_write_failed(
            barrier.as_ref(),
            &StorageError::WriteRejected {
                store: "s".into(),
                reason: "full".to_string(),
            },
        );
        assert!(core.pending_barrier().is_none());
        assert_eq!(core.value(), StoreValue::Singleton(Some(v)));
        assert_eq!(core.stats().writes_rejected, 1);
    }

    #[test]
    fn test_observed_remove_retracts_all_keys() {
        let mut core = collection();
        let (consumer, _) = core.register(DeliveryPolicy::synced(), Capabilities::READ_WRITE);
        core.on_sync_response(SyncResponse {
            version: 0,
            model: StoreModel::Collection(vec![]),
        });
        core.on_event(event("c", 1, add("a", "k1", true)));
        core.on_event(event("c", 2, add("a", "k2", false)));
        core.take_deliveries();

        let command = core.write(consumer, LocalWrite::Remove(EntityId::from("a"))).unwrap();
        match command {
            Some(Command::Write {
                op: WriteOp::Remove { keys, .. },
                ..
            }) => assert_eq!(keys, vec![ProvenanceKey::from("k1"), ProvenanceKey::from("k2")]),
            other => panic!("unexpected {:?}", other),
        }
        assert!(core.value().ids().is_empty());
        assert_eq!(
            core.write(consumer, LocalWrite::Remove(EntityId::from("a"))).unwrap(),
            None
        );
    }

    #[test]
    fn test_minted_keys_and_barriers_are_unique() {
        let mut core = collection();
        let (consumer, _) = core.register(DeliveryPolicy::synced(), Capabilities::READ_WRITE);
        core.on_sync_response(SyncResponse {
            version: 0,
            model: StoreModel::Collection(vec![]),
        });
        let mut seen = Vec::new();
        for id in ["a", "b"] {
            match core
                .write(
                    consumer,
                    LocalWrite::Store {
                        entity: Entity::new(id, json!(id)),
                        key: None,
                    },
                )
                .unwrap()
            {
                Some(Command::Write {
                    op: WriteOp::Store { key, .. },
                    barrier: Some(barrier),
                    ..
                }) => seen.push((key.to_string(), barrier.to_string())),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            seen,
            vec![
                ("p1:k1".to_string(), "p1:b1".to_string()),
                ("p1:k2".to_string(), "p1:b2".to_string())
            ]
        );
    }

    #[test]
    fn test_capability_and_kind_errors() {
        let mut core = singleton();
        let (reader, _) = core.register(DeliveryPolicy::synced(), Capabilities::READ_ONLY);
        let (writer, _) = core.register(DeliveryPolicy::silent(), Capabilities::WRITE_ONLY);

        assert!(matches!(
            core.write(reader, LocalWrite::Clear),
            Err(StorageError::CapabilityViolation { operation: "clear", .. })
        ));
        assert!(matches!(
            core.fetch(writer),
            Err(StorageError::CapabilityViolation { operation: "fetch", .. })
        ));
        assert!(matches!(
            core.list(reader),
            Err(StorageError::KindMismatch { .. })
        ));
        assert!(matches!(
            core.write(writer, LocalWrite::Remove(EntityId::from("a"))),
            Err(StorageError::KindMismatch { .. })
        ));
        assert_eq!(
            core.fetch(ConsumerId::new(99)),
            Err(StorageError::UnknownConsumer(ConsumerId::new(99)))
        );
    }

    #[test]
    fn test_reads_forward_until_synced() {
        let mut core = singleton();
        let (consumer, _) = core.register(DeliveryPolicy::synced(), Capabilities::READ_ONLY);
        assert_eq!(core.fetch(consumer).unwrap(), Read::Forward);
        core.on_sync_response(SyncResponse {
            version: 1,
            model: StoreModel::Singleton(Some(Entity::new("x", json!(1)))),
        });
        assert_eq!(
            core.fetch(consumer).unwrap(),
            Read::Cached(Some(Entity::new("x", json!(1))))
        );

        let (raw, _) = core.register(DeliveryPolicy::updates_only(), Capabilities::READ_ONLY);
        assert_eq!(core.fetch(raw).unwrap(), Read::Forward);
    }

    #[test]
    fn test_deregister_discards_queued_deliveries() {
        let mut core = collection();
        let (a, _) = core.register(DeliveryPolicy::synced(), Capabilities::READ_ONLY);
        let (b, _) = core.register(DeliveryPolicy::synced(), Capabilities::READ_ONLY);
        core.on_sync_response(SyncResponse {
            version: 0,
            model: StoreModel::Collection(vec![]),
        });
        core.deregister(a).unwrap();
        let deliveries = core.take_deliveries();
        assert!(deliveries.iter().all(|d| d.consumer == b));
        assert_eq!(deliveries.len(), 1);
        assert!(core.deregister(a).is_err());
    }

    #[test]
    fn test_overflow_waits_for_snapshot() {
        let mut core = ProxyCore::new(
            ProxyId::from("p1"),
            StoreInfo::volatile("c", StoreKind::Collection),
            2,
        );
        core.register(DeliveryPolicy::synced(), Capabilities::READ_ONLY);
        core.on_sync_response(SyncResponse {
            version: 0,
            model: StoreModel::Collection(vec![]),
        });
        for v in [3, 4] {
            core.on_event(event("c", v, add(&format!("e{}", v), "k", true)));
        }
        let commands = core.on_event(event("c", 5, add("e5", "k", true)));
        assert!(commands.is_empty(), "sync already requested at the first gap");
        assert_eq!(core.stats().overflows, 1);

        // Missing versions arriving late must not restore sync on their own.
        core.on_event(event("c", 1, add("e1", "k", true)));
        core.on_event(event("c", 2, add("e2", "k", true)));
        assert_eq!(core.state(), SyncState::Desynced);
    }

    #[test]
    fn test_snapshot_after_self_heal_is_not_a_second_sync() {
        let mut core = collection();
        let (consumer, _) = core.register(DeliveryPolicy::synced(), Capabilities::READ_ONLY);
        core.on_sync_response(SyncResponse {
            version: 0,
            model: StoreModel::Collection(vec![]),
        });
        core.take_deliveries();

        for v in [1, 4, 3, 2] {
            core.on_event(event("c", v, add(&format!("e{}", v), &format!("k{}", v), true)));
        }
        assert_eq!(core.state(), SyncState::Synced, "gap filled by late events");
        assert!(core.sync_in_flight());

        // The store moved on before answering the request made at the gap.
        let commands = core.on_sync_response(SyncResponse {
            version: 5,
            model: StoreModel::Collection(vec![]),
        });
        assert!(commands.is_empty());
        assert_eq!(core.state(), SyncState::Synced);

        let deliveries = core.take_deliveries();
        let syncs = deliveries
            .iter()
            .filter(|d| matches!(d.notification, Notification::Sync(_)))
            .count();
        let desyncs = deliveries
            .iter()
            .filter(|d| matches!(d.notification, Notification::Desync))
            .count();
        assert_eq!((desyncs, syncs), (1, 1));
        assert_eq!(core.stats().stale_snapshots, 1);
        match core.list(consumer).unwrap() {
            Read::Cached(items) => assert_eq!(items.len(), 4),
            other => panic!("unexpected {:?}", other),
        }

        core.on_event(event("c", 5, add("e5", "k5", true)));
        assert_eq!(core.local_version(), Some(5));
        assert!(matches!(
            core.take_deliveries()[..],
            [Delivery {
                notification: Notification::Update { .. },
                ..
            }]
        ));
    }

    #[test]
    fn test_failed_sync_is_retried() {
        let mut core = collection();
        let (consumer, _) = core.register(DeliveryPolicy::synced(), Capabilities::READ_ONLY);
        core.on_sync_failed(&StorageError::Unavailable { store: "c".into() });
        assert_eq!(core.state(), SyncState::Synchronizing);
        assert_eq!(core.stats().sync_failures, 1);
        assert!(core.take_deliveries().is_empty());

        // Events keep being sequenced while the snapshot is owed.
        core.on_event(event("c", 1, add("e1", "k1", true)));

        assert_eq!(core.retry_sync(), vec![Command::Synchronize]);
        assert!(core.retry_sync().is_empty(), "one request in flight");
        core.on_sync_response(SyncResponse {
            version: 0,
            model: StoreModel::Collection(vec![]),
        });
        assert_eq!(core.state(), SyncState::Synced);
        assert!(core.retry_sync().is_empty());

        let deliveries = core.take_deliveries();
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].consumer, consumer);
        match &deliveries[0].notification {
            Notification::Sync(StoreValue::Collection(items)) => assert_eq!(items.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_big_collection_is_pass_through() {
        let mut core = ProxyCore::new(
            ProxyId::from("p1"),
            StoreInfo::volatile("big", StoreKind::BigCollection),
            64,
        );
        let (consumer, commands) = core.register(DeliveryPolicy::synced(), Capabilities::READ_WRITE);
        assert_eq!(commands, vec![Command::Initialize]);
        assert!(core.check_cursor(consumer, "open_cursor").is_ok());
        assert_eq!(
            core.fetch_entity(consumer, &EntityId::from("a")).unwrap(),
            Read::Forward
        );
        match core
            .write(
                consumer,
                LocalWrite::Store {
                    entity: Entity::new("a", json!(1)),
                    key: None,
                },
            )
            .unwrap()
        {
            Some(Command::Write { barrier: None, .. }) => {}
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(core.state(), SyncState::Unsynced);
    }
}
