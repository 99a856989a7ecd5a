pub mod backend;
pub mod config;
pub mod cursor;
pub mod error;
pub mod key;
pub mod memory;
pub mod observability;
pub mod proxy;
pub mod refmode;
pub mod replication;
pub mod simulator;
pub mod types;

#[cfg(test)]
mod stateright;

pub use backend::{BackingStore, CursorPage, StoreEvent, SyncResponse, WriteAck, WriteOp};
pub use config::ProxyConfig;
pub use error::StorageError;
pub use key::StorageKey;
pub use memory::InMemoryBackingStore;
pub use proxy::{spawn_proxy, ConsumerHandle, Notification, ProxyCore, ProxyHandle};
pub use refmode::{Reference, ReferenceModeStore};
pub use types::{
    Capabilities, ConsumerId, DeliveryPolicy, Entity, EntityId, ProvenanceKey, ProxyId, StoreId,
    StoreInfo, StoreKind, StoreValue, Version,
};
