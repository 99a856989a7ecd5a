//! In-memory backing store.
//!
//! `VolatileStore` is the authoritative model of one store: a version
//! counter plus either a singleton value or a provenance set. Every committed
//! mutation bumps the version by one and yields exactly one event.
//!
//! `InMemoryBackingStore` wraps a set of volatile stores behind the async
//! `BackingStore` interface, fans events out to initialized listeners, and
//! can drop events on the way out to exercise desync handling.

use crate::backend::{
    BackingStore, CursorId, CursorPage, EventSender, Mutation, StoreEvent, StoreFuture,
    StoreModel, SyncResponse, WriteAck, WriteOp,
};
use crate::cursor::CursorManager;
use crate::error::StorageError;
use crate::replication::provenance::ProvenanceSet;
use crate::types::{
    BarrierToken, Entity, EntityId, Originator, StoreId, StoreInfo, StoreKind, Version,
};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
enum VolatileState {
    Singleton(Option<Entity>),
    Collection {
        members: ProvenanceSet,
        /// Version of the last write touching each member.
        last_write: AHashMap<EntityId, Version>,
    },
}

#[derive(Debug, Clone)]
pub struct VolatileStore {
    info: StoreInfo,
    version: Version,
    state: VolatileState,
}

impl VolatileStore {
    pub fn new(info: StoreInfo) -> Self {
        let state = match info.kind {
            StoreKind::Singleton => VolatileState::Singleton(None),
            StoreKind::Collection | StoreKind::BigCollection => VolatileState::Collection {
                members: ProvenanceSet::new(),
                last_write: AHashMap::new(),
            },
        };
        VolatileStore {
            info,
            version: 0,
            state,
        }
    }

    pub fn info(&self) -> &StoreInfo {
        &self.info
    }

    pub fn version(&self) -> Version {
        self.version
    }

    /// Commits `op`. Returns the acknowledgement and the event to push, if
    /// the write changed anything at all. Removing an entity the store does
    /// not hold commits nothing.
    pub fn apply(
        &mut self,
        op: WriteOp,
        barrier: Option<BarrierToken>,
        originator: Option<Originator>,
    ) -> Result<(WriteAck, Option<StoreEvent>), StorageError> {
        if !op.applies_to(self.info.kind) {
            return Err(StorageError::KindMismatch {
                store: self.info.id.clone(),
                kind: self.info.kind,
                operation: op.name(),
            });
        }

        let next = self.version + 1;
        let mutation = match (&mut self.state, op) {
            (VolatileState::Singleton(value), WriteOp::Set(entity)) => {
                *value = Some(entity.clone());
                Mutation::Set(entity)
            }
            (VolatileState::Singleton(value), WriteOp::Clear) => {
                *value = None;
                Mutation::Clear
            }
            (VolatileState::Collection { members, last_write }, WriteOp::Store { entity, key }) => {
                last_write.insert(entity.id.clone(), next);
                let effective = members.add(entity.clone(), key.clone());
                Mutation::Add {
                    entity,
                    key,
                    effective,
                }
            }
            (VolatileState::Collection { members, last_write }, WriteOp::Remove { id, keys }) => {
                let Some(entity) = members.get(&id).cloned() else {
                    return Ok((WriteAck { version: self.version }, None));
                };
                let keys = if keys.is_empty() {
                    members.keys(&id)
                } else {
                    keys
                };
                let effective = members.remove(&id, &keys).is_some();
                if effective {
                    last_write.remove(&id);
                }
                Mutation::Remove {
                    entity,
                    keys,
                    effective,
                }
            }
            (_, op) => {
                return Err(StorageError::KindMismatch {
                    store: self.info.id.clone(),
                    kind: self.info.kind,
                    operation: op.name(),
                })
            }
        };

        self.version = next;
        trace!(store = %self.info.id, version = next, op = mutation.name(), "committed");
        let event = StoreEvent {
            store: self.info.id.clone(),
            version: next,
            originator,
            barrier,
            mutation,
        };
        Ok((WriteAck { version: next }, Some(event)))
    }

    pub fn snapshot(&self) -> SyncResponse {
        let model = match &self.state {
            VolatileState::Singleton(value) => StoreModel::Singleton(value.clone()),
            VolatileState::Collection { members, .. } => StoreModel::Collection(members.to_literal()),
        };
        SyncResponse {
            version: self.version,
            model,
        }
    }

    pub fn read(&self) -> Result<Option<Entity>, StorageError> {
        match &self.state {
            VolatileState::Singleton(value) => Ok(value.clone()),
            VolatileState::Collection { .. } => Err(self.mismatch("read")),
        }
    }

    pub fn list(&self) -> Result<Vec<Entity>, StorageError> {
        match &self.state {
            VolatileState::Collection { members, .. } => Ok(members.list()),
            VolatileState::Singleton(_) => Err(self.mismatch("list")),
        }
    }

    pub fn fetch(&self, id: &EntityId) -> Result<Option<Entity>, StorageError> {
        match &self.state {
            VolatileState::Collection { members, .. } => Ok(members.get(id).cloned()),
            VolatileState::Singleton(_) => Err(self.mismatch("fetch")),
        }
    }

    /// Members ordered by their last write, oldest first.
    pub fn members_by_last_write(&self) -> Result<Vec<Entity>, StorageError> {
        match &self.state {
            VolatileState::Collection {
                members,
                last_write,
            } => {
                let mut ordered: Vec<(Version, &Entity)> = members
                    .iter()
                    .map(|e| (last_write.get(&e.id).copied().unwrap_or(0), e))
                    .collect();
                ordered.sort_by_key(|(v, _)| *v);
                Ok(ordered.into_iter().map(|(_, e)| e.clone()).collect())
            }
            VolatileState::Singleton(_) => Err(self.mismatch("open_cursor")),
        }
    }

    fn mismatch(&self, operation: &'static str) -> StorageError {
        StorageError::KindMismatch {
            store: self.info.id.clone(),
            kind: self.info.kind,
            operation,
        }
    }
}

struct Slot {
    store: VolatileStore,
    listeners: Vec<EventSender>,
}

#[derive(Default)]
struct Inner {
    slots: AHashMap<StoreId, Slot>,
    cursors: CursorManager,
    drop_budget: usize,
    dropped: u64,
    sync_failure_budget: usize,
    sync_calls: u64,
    initialize_calls: u64,
    write_calls: u64,
    read_calls: u64,
}

impl Inner {
    fn slot(&self, id: &StoreId) -> Result<&Slot, StorageError> {
        self.slots
            .get(id)
            .ok_or_else(|| StorageError::NotFound { store: id.clone() })
    }

    fn slot_mut(&mut self, id: &StoreId) -> Result<&mut Slot, StorageError> {
        self.slots
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound { store: id.clone() })
    }
}

/// Counters for asserting on backing-store traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub initialize: u64,
    pub synchronize: u64,
    pub write: u64,
    pub read: u64,
    pub dropped_events: u64,
}

/// Shared in-process backing store. Cloning shares the same stores.
#[derive(Clone, Default)]
pub struct InMemoryBackingStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryBackingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty store. Recreating an existing id resets it.
    pub fn create_store(&self, info: StoreInfo) {
        let mut inner = self.inner.lock();
        debug!(store = %info.id, kind = %info.kind, "creating volatile store");
        inner.slots.insert(
            info.id.clone(),
            Slot {
                store: VolatileStore::new(info),
                listeners: Vec::new(),
            },
        );
    }

    /// Drops the next `count` outgoing events (all listeners).
    pub fn drop_events(&self, count: usize) {
        self.inner.lock().drop_budget += count;
    }

    /// Fails the next `count` snapshot requests with `Unavailable`.
    pub fn fail_syncs(&self, count: usize) {
        self.inner.lock().sync_failure_budget += count;
    }

    pub fn version(&self, store: &StoreId) -> Result<Version, StorageError> {
        Ok(self.inner.lock().slot(store)?.store.version())
    }

    /// Snapshot version a live cursor reads at.
    pub fn cursor_version(&self, cursor: CursorId) -> Result<Version, StorageError> {
        self.inner.lock().cursors.version(cursor)
    }

    pub fn open_cursors(&self) -> usize {
        self.inner.lock().cursors.open_count()
    }

    pub fn call_counts(&self) -> CallCounts {
        let inner = self.inner.lock();
        CallCounts {
            initialize: inner.initialize_calls,
            synchronize: inner.sync_calls,
            write: inner.write_calls,
            read: inner.read_calls,
            dropped_events: inner.dropped,
        }
    }

    fn write_now(
        &self,
        store: &StoreId,
        op: WriteOp,
        barrier: Option<BarrierToken>,
        originator: Option<Originator>,
    ) -> Result<WriteAck, StorageError> {
        let mut inner = self.inner.lock();
        inner.write_calls += 1;
        let (ack, event) = inner.slot_mut(store)?.store.apply(op, barrier, originator)?;
        let Some(event) = event else {
            return Ok(ack);
        };

        if inner.drop_budget > 0 {
            inner.drop_budget -= 1;
            inner.dropped += 1;
            debug!(store = %store, version = event.version, "dropping event");
            return Ok(ack);
        }

        let slot = inner.slot_mut(store)?;
        slot.listeners.retain(|tx| tx.send(event.clone()).is_ok());
        Ok(ack)
    }
}

impl BackingStore for InMemoryBackingStore {
    fn initialize<'a>(&'a self, store: &'a StoreId, events: EventSender) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.initialize_calls += 1;
            let slot = inner.slot_mut(store)?;
            if !slot.listeners.iter().any(|tx| tx.same_channel(&events)) {
                slot.listeners.push(events);
            }
            Ok(())
        })
    }

    fn synchronize<'a>(&'a self, store: &'a StoreId) -> StoreFuture<'a, SyncResponse> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.sync_calls += 1;
            if inner.sync_failure_budget > 0 {
                inner.sync_failure_budget -= 1;
                return Err(StorageError::Unavailable {
                    store: store.clone(),
                });
            }
            Ok(inner.slot(store)?.store.snapshot())
        })
    }

    fn read<'a>(&'a self, store: &'a StoreId) -> StoreFuture<'a, Option<Entity>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.read_calls += 1;
            inner.slot(store)?.store.read()
        })
    }

    fn list<'a>(&'a self, store: &'a StoreId) -> StoreFuture<'a, Vec<Entity>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.read_calls += 1;
            inner.slot(store)?.store.list()
        })
    }

    fn fetch<'a>(&'a self, store: &'a StoreId, id: &'a EntityId) -> StoreFuture<'a, Option<Entity>> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            inner.read_calls += 1;
            inner.slot(store)?.store.fetch(id)
        })
    }

    fn write<'a>(
        &'a self,
        store: &'a StoreId,
        op: WriteOp,
        barrier: Option<BarrierToken>,
        originator: Option<Originator>,
    ) -> StoreFuture<'a, WriteAck> {
        Box::pin(async move { self.write_now(store, op, barrier, originator) })
    }

    fn open_cursor<'a>(
        &'a self,
        store: &'a StoreId,
        page_size: usize,
        forward: bool,
    ) -> StoreFuture<'a, (CursorId, Version)> {
        Box::pin(async move {
            let mut inner = self.inner.lock();
            let slot = inner.slot(store)?;
            let members = slot.store.members_by_last_write()?;
            let version = slot.store.version();
            Ok(inner.cursors.open(members, version, page_size, forward))
        })
    }

    fn cursor_next<'a>(&'a self, cursor: CursorId) -> StoreFuture<'a, CursorPage> {
        Box::pin(async move { self.inner.lock().cursors.next(cursor) })
    }

    fn cursor_close<'a>(&'a self, cursor: CursorId) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.inner.lock().cursors.close(cursor) })
    }
}
