//! Backing-store interface consumed by the storage proxy.
//!
//! The backing store is authoritative. It pushes individually versioned
//! events to every initialized listener; the network between it and a proxy
//! may reorder, duplicate or drop them.
//!
//! Methods return boxed futures so the trait stays object safe
//! (`Arc<dyn BackingStore>`).

use crate::error::StorageError;
use crate::replication::provenance::LiteralEntry;
use crate::types::{
    BarrierToken, Entity, EntityId, Originator, ProvenanceKey, StoreId, StoreKind, StoreValue,
    Version,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use tokio::sync::mpsc;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

pub type CursorId = u64;

/// Channel a backing store pushes events into.
pub type EventSender = mpsc::UnboundedSender<StoreEvent>;

/// A committed mutation as seen by the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Set(Entity),
    Clear,
    /// `effective` is true iff the add made the entity present.
    Add {
        entity: Entity,
        key: ProvenanceKey,
        effective: bool,
    },
    /// `effective` is true iff the remove made the entity absent.
    Remove {
        entity: Entity,
        keys: Vec<ProvenanceKey>,
        effective: bool,
    },
}

impl Mutation {
    pub fn name(&self) -> &'static str {
        match self {
            Mutation::Set(_) => "set",
            Mutation::Clear => "clear",
            Mutation::Add { .. } => "add",
            Mutation::Remove { .. } => "remove",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreEvent {
    pub store: StoreId,
    pub version: Version,
    pub originator: Option<Originator>,
    /// Present only on the event committing the write that carried it.
    pub barrier: Option<BarrierToken>,
    pub mutation: Mutation,
}

/// Write operation forwarded to the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WriteOp {
    Set(Entity),
    Clear,
    Store { entity: Entity, key: ProvenanceKey },
    /// An empty key list retracts every key the store holds for `id`.
    Remove { id: EntityId, keys: Vec<ProvenanceKey> },
}

impl WriteOp {
    pub fn name(&self) -> &'static str {
        match self {
            WriteOp::Set(_) => "set",
            WriteOp::Clear => "clear",
            WriteOp::Store { .. } => "store",
            WriteOp::Remove { .. } => "remove",
        }
    }

    /// Whether this operation applies to stores of `kind`.
    pub fn applies_to(&self, kind: StoreKind) -> bool {
        match self {
            WriteOp::Set(_) | WriteOp::Clear => kind == StoreKind::Singleton,
            WriteOp::Store { .. } | WriteOp::Remove { .. } => kind != StoreKind::Singleton,
        }
    }
}

/// Acknowledgement of a forwarded write. `version` is the store version once
/// the write was committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    pub version: Version,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreModel {
    Singleton(Option<Entity>),
    Collection(Vec<LiteralEntry>),
}

impl StoreModel {
    pub fn to_value(&self) -> StoreValue {
        match self {
            StoreModel::Singleton(e) => StoreValue::Singleton(e.clone()),
            StoreModel::Collection(entries) => {
                StoreValue::Collection(entries.iter().map(|e| e.entity.clone()).collect())
            }
        }
    }
}

/// Full snapshot of a store at `version`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub version: Version,
    pub model: StoreModel,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorPage {
    pub items: Vec<Entity>,
    pub done: bool,
}

pub trait BackingStore: Send + Sync {
    /// Registers `events` as a push listener. Repeating the call with the
    /// same channel is a no-op.
    fn initialize<'a>(&'a self, store: &'a StoreId, events: EventSender) -> StoreFuture<'a, ()>;

    fn synchronize<'a>(&'a self, store: &'a StoreId) -> StoreFuture<'a, SyncResponse>;

    /// Current singleton value.
    fn read<'a>(&'a self, store: &'a StoreId) -> StoreFuture<'a, Option<Entity>>;

    /// Current collection members.
    fn list<'a>(&'a self, store: &'a StoreId) -> StoreFuture<'a, Vec<Entity>>;

    /// Single collection member by id.
    fn fetch<'a>(&'a self, store: &'a StoreId, id: &'a EntityId) -> StoreFuture<'a, Option<Entity>>;

    fn write<'a>(
        &'a self,
        store: &'a StoreId,
        op: WriteOp,
        barrier: Option<BarrierToken>,
        originator: Option<Originator>,
    ) -> StoreFuture<'a, WriteAck>;

    /// Opens a version-frozen cursor. Returns the cursor id and the snapshot
    /// version it captured.
    fn open_cursor<'a>(
        &'a self,
        store: &'a StoreId,
        page_size: usize,
        forward: bool,
    ) -> StoreFuture<'a, (CursorId, Version)>;

    fn cursor_next<'a>(&'a self, cursor: CursorId) -> StoreFuture<'a, CursorPage>;

    fn cursor_close<'a>(&'a self, cursor: CursorId) -> StoreFuture<'a, ()>;
}
