//! Reference-mode split
//!
//! One logical store addressed by a compound key
//! `reference-mode://{backing}{container}`:
//!
//! ```text
//! container  (logical kind)   id -> { id, storage_key, version }   pointer
//! backing    (collection)     id -> full payload
//! ```
//!
//! Writes land the payload in the backing half first and then publish a
//! pointer in the container half. Everything a proxy reads or subscribes to
//! comes from the container, so consumers see pointers and resolve them
//! explicitly with [`ReferenceModeStore::dereference`].
//!
//! Events pushed by the container carry the container's store id. A relay
//! task per listener restamps them with the logical id before forwarding.

use crate::backend::{
    BackingStore, CursorId, CursorPage, EventSender, StoreEvent, StoreFuture, SyncResponse,
    WriteAck, WriteOp,
};
use crate::error::StorageError;
use crate::key::StorageKey;
use crate::types::{
    BarrierToken, Entity, EntityId, Originator, ProvenanceKey, StoreId, StoreInfo, StoreKind,
    Version,
};
use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Pointer stored in the container half.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub id: EntityId,
    pub storage_key: StorageKey,
    /// Backing version that committed the payload.
    pub version: Version,
}

impl Reference {
    pub fn to_entity(&self) -> Entity {
        Entity {
            id: self.id.clone(),
            data: json!({
                "id": self.id.as_str(),
                "storageKey": self.storage_key.to_string(),
                "version": self.version,
            }),
        }
    }

    /// Reads a pointer back out of a container entity.
    pub fn from_entity(entity: &Entity) -> Option<Reference> {
        let data = entity.data.as_object()?;
        Some(Reference {
            id: EntityId::new(data.get("id")?.as_str()?),
            storage_key: StorageKey::parse(data.get("storageKey")?.as_str()?).ok()?,
            version: data.get("version")?.as_u64()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Split {
    backing: StoreId,
    backing_key: StorageKey,
    container: StoreId,
}

/// A listener and the relay input registered with the container on its behalf.
struct Relay {
    listener: EventSender,
    input: EventSender,
}

/// `BackingStore` presenting each reference-mode store as one logical store
/// over an inner store that hosts both halves.
pub struct ReferenceModeStore<B: BackingStore> {
    inner: B,
    splits: RwLock<AHashMap<StoreId, Split>>,
    relays: Mutex<AHashMap<StoreId, Vec<Relay>>>,
    next_key: AtomicU64,
}

impl<B: BackingStore> ReferenceModeStore<B> {
    pub fn new(inner: B) -> Self {
        ReferenceModeStore {
            inner,
            splits: RwLock::new(AHashMap::new()),
            relays: Mutex::new(AHashMap::new()),
            next_key: AtomicU64::new(0),
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    /// Store descriptors for the two halves of `info`: backing first, then
    /// container. The inner store must host both under these ids.
    pub fn halves(info: &StoreInfo) -> Result<(StoreInfo, StoreInfo), StorageError> {
        let (backing, container) = info
            .storage_key
            .split()
            .ok_or_else(|| StorageError::InvalidStorageKey(info.storage_key.to_string()))?;
        Ok((
            StoreInfo::new(backing.to_string(), StoreKind::Collection, backing.clone()),
            StoreInfo::new(container.to_string(), info.kind, container.clone()),
        ))
    }

    /// Makes `info` addressable through this store.
    pub fn attach(&self, info: &StoreInfo) -> Result<(), StorageError> {
        let (backing, container) = Self::halves(info)?;
        debug!(
            store = %info.id,
            backing = %backing.id,
            container = %container.id,
            "attached reference-mode store"
        );
        self.splits.write().insert(
            info.id.clone(),
            Split {
                backing: backing.id,
                backing_key: backing.storage_key,
                container: container.id,
            },
        );
        Ok(())
    }

    fn split(&self, store: &StoreId) -> Result<Split, StorageError> {
        self.splits
            .read()
            .get(store)
            .cloned()
            .ok_or_else(|| StorageError::NotFound {
                store: store.clone(),
            })
    }

    /// Relay input for `listener`, reusing the one made by an earlier
    /// `initialize` with the same channel.
    fn relay(&self, store: &StoreId, listener: EventSender) -> EventSender {
        let mut all = self.relays.lock();
        let relays = all.entry(store.clone()).or_default();
        relays.retain(|r| !r.listener.is_closed());
        if let Some(existing) = relays.iter().find(|r| r.listener.same_channel(&listener)) {
            return existing.input.clone();
        }

        let (input, mut rx) = mpsc::unbounded_channel::<StoreEvent>();
        let logical = store.clone();
        let forward = listener.clone();
        tokio::spawn(async move {
            while let Some(mut event) = rx.recv().await {
                event.store = logical.clone();
                if forward.send(event).is_err() {
                    break;
                }
            }
            debug!(store = %logical, "event relay stopped");
        });
        relays.push(Relay {
            listener,
            input: input.clone(),
        });
        input
    }

    /// Resolves a pointer to its payload. A pointer whose payload is missing
    /// is a dangling reference, not an absent entity.
    pub async fn dereference(
        &self,
        store: &StoreId,
        reference: &Reference,
    ) -> Result<Entity, StorageError> {
        let split = self.split(store)?;
        self.inner
            .fetch(&split.backing, &reference.id)
            .await?
            .ok_or_else(|| StorageError::DanglingReference {
                id: reference.id.clone(),
                backing: reference.storage_key.to_string(),
            })
    }

    async fn publish(
        &self,
        split: &Split,
        entity: Entity,
        barrier: Option<BarrierToken>,
        originator: Option<Originator>,
        container_op: impl FnOnce(Entity) -> WriteOp,
    ) -> Result<WriteAck, StorageError> {
        let n = self.next_key.fetch_add(1, Ordering::Relaxed);
        let payload_key = ProvenanceKey::new(format!("payload:{}", n));
        let id = entity.id.clone();
        let stored = self
            .inner
            .write(
                &split.backing,
                WriteOp::Store {
                    entity,
                    key: payload_key,
                },
                None,
                originator.clone(),
            )
            .await?;

        let pointer = Reference {
            id,
            storage_key: split.backing_key.clone(),
            version: stored.version,
        }
        .to_entity();
        self.inner
            .write(&split.container, container_op(pointer), barrier, originator)
            .await
    }
}

impl<B: BackingStore> BackingStore for ReferenceModeStore<B> {
    fn initialize<'a>(&'a self, store: &'a StoreId, events: EventSender) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let split = self.split(store)?;
            let relay = self.relay(store, events);
            self.inner.initialize(&split.container, relay).await
        })
    }

    fn synchronize<'a>(&'a self, store: &'a StoreId) -> StoreFuture<'a, SyncResponse> {
        Box::pin(async move {
            let split = self.split(store)?;
            self.inner.synchronize(&split.container).await
        })
    }

    fn read<'a>(&'a self, store: &'a StoreId) -> StoreFuture<'a, Option<Entity>> {
        Box::pin(async move {
            let split = self.split(store)?;
            self.inner.read(&split.container).await
        })
    }

    fn list<'a>(&'a self, store: &'a StoreId) -> StoreFuture<'a, Vec<Entity>> {
        Box::pin(async move {
            let split = self.split(store)?;
            self.inner.list(&split.container).await
        })
    }

    fn fetch<'a>(&'a self, store: &'a StoreId, id: &'a EntityId) -> StoreFuture<'a, Option<Entity>> {
        Box::pin(async move {
            let split = self.split(store)?;
            self.inner.fetch(&split.container, id).await
        })
    }

    fn write<'a>(
        &'a self,
        store: &'a StoreId,
        op: WriteOp,
        barrier: Option<BarrierToken>,
        originator: Option<Originator>,
    ) -> StoreFuture<'a, WriteAck> {
        Box::pin(async move {
            let split = self.split(store)?;
            match op {
                WriteOp::Set(entity) => {
                    self.publish(&split, entity, barrier, originator, WriteOp::Set)
                        .await
                }
                WriteOp::Store { entity, key } => {
                    self.publish(&split, entity, barrier, originator, |pointer| {
                        WriteOp::Store {
                            entity: pointer,
                            key,
                        }
                    })
                    .await
                }
                // Payloads may be shared; only the pointer goes away.
                op @ (WriteOp::Clear | WriteOp::Remove { .. }) => {
                    self.inner
                        .write(&split.container, op, barrier, originator)
                        .await
                }
            }
        })
    }

    fn open_cursor<'a>(
        &'a self,
        store: &'a StoreId,
        page_size: usize,
        forward: bool,
    ) -> StoreFuture<'a, (CursorId, Version)> {
        Box::pin(async move {
            let split = self.split(store)?;
            self.inner
                .open_cursor(&split.container, page_size, forward)
                .await
        })
    }

    fn cursor_next<'a>(&'a self, cursor: CursorId) -> StoreFuture<'a, CursorPage> {
        self.inner.cursor_next(cursor)
    }

    fn cursor_close<'a>(&'a self, cursor: CursorId) -> StoreFuture<'a, ()> {
        self.inner.cursor_close(cursor)
    }
}
