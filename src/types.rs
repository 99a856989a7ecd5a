//! Core identifiers and value types shared by the proxy, the backing-store
//! interface and the simulation harness.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::key::StorageKey;

/// Per-store, monotonically increasing mutation counter.
pub type Version = u64;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

string_id!(
    /// Stable identifier of a store.
    StoreId
);
string_id!(
    /// Identity of an entity inside a collection.
    EntityId
);
string_id!(
    /// Token justifying one contributor's claim that an entity is present.
    ProvenanceKey
);
string_id!(
    /// Correlates a local optimistic write with its confirming event.
    BarrierToken
);
string_id!(
    /// Identity of one proxy instance.
    ProxyId
);

/// Identity of a consumer registered with a proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerId(pub u64);

impl ConsumerId {
    pub fn new(id: u64) -> Self {
        ConsumerId(id)
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// Which proxy and which of its consumers caused a write.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Originator {
    pub proxy: ProxyId,
    pub consumer: ConsumerId,
}

impl Originator {
    pub fn new(proxy: ProxyId, consumer: ConsumerId) -> Self {
        Originator { proxy, consumer }
    }
}

/// Payload stored in singletons and collections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub data: serde_json::Value,
}

impl Entity {
    pub fn new(id: impl Into<String>, data: serde_json::Value) -> Self {
        Entity {
            id: EntityId::new(id),
            data,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StoreKind {
    Singleton,
    Collection,
    BigCollection,
}

impl StoreKind {
    pub fn name(&self) -> &'static str {
        match self {
            StoreKind::Singleton => "singleton",
            StoreKind::Collection => "collection",
            StoreKind::BigCollection => "big-collection",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreInfo {
    pub id: StoreId,
    pub kind: StoreKind,
    pub storage_key: StorageKey,
}

impl StoreInfo {
    pub fn new(id: impl Into<String>, kind: StoreKind, storage_key: StorageKey) -> Self {
        StoreInfo {
            id: StoreId::new(id),
            kind,
            storage_key,
        }
    }

    /// Store on a volatile key derived from its id.
    pub fn volatile(id: impl Into<String>, kind: StoreKind) -> Self {
        let id = id.into();
        let storage_key = StorageKey::volatile(&id);
        StoreInfo::new(id, kind, storage_key)
    }
}

/// Per-consumer delivery policy, fixed at registration time.
///
/// Replacing a policy means deregistering and registering again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPolicy {
    pub keep_synced: bool,
    pub notify_sync: bool,
    pub notify_update: bool,
    pub notify_desync: bool,
}

impl DeliveryPolicy {
    /// Everything on.
    pub fn synced() -> Self {
        DeliveryPolicy {
            keep_synced: true,
            notify_sync: true,
            notify_update: true,
            notify_desync: true,
        }
    }

    /// Update notifications only, never synchronized.
    pub fn updates_only() -> Self {
        DeliveryPolicy {
            keep_synced: false,
            notify_sync: false,
            notify_update: true,
            notify_desync: false,
        }
    }

    pub fn silent() -> Self {
        DeliveryPolicy {
            keep_synced: false,
            notify_sync: false,
            notify_update: false,
            notify_desync: false,
        }
    }

    pub fn with_notify_desync(mut self, on: bool) -> Self {
        self.notify_desync = on;
        self
    }

    pub fn with_notify_update(mut self, on: bool) -> Self {
        self.notify_update = on;
        self
    }

    pub fn with_notify_sync(mut self, on: bool) -> Self {
        self.notify_sync = on;
        self
    }
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        DeliveryPolicy::synced()
    }
}

/// Read/write capabilities of a registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub read: bool,
    pub write: bool,
}

impl Capabilities {
    pub const READ_WRITE: Capabilities = Capabilities {
        read: true,
        write: true,
    };
    pub const READ_ONLY: Capabilities = Capabilities {
        read: true,
        write: false,
    };
    pub const WRITE_ONLY: Capabilities = Capabilities {
        read: false,
        write: true,
    };
}

/// Consumer-facing view of a store's value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StoreValue {
    Singleton(Option<Entity>),
    Collection(Vec<Entity>),
}

impl StoreValue {
    pub fn empty(kind: StoreKind) -> Self {
        match kind {
            StoreKind::Singleton => StoreValue::Singleton(None),
            StoreKind::Collection | StoreKind::BigCollection => StoreValue::Collection(Vec::new()),
        }
    }

    pub fn as_singleton(&self) -> Option<&Entity> {
        match self {
            StoreValue::Singleton(e) => e.as_ref(),
            StoreValue::Collection(_) => None,
        }
    }

    pub fn as_collection(&self) -> &[Entity] {
        match self {
            StoreValue::Collection(items) => items,
            StoreValue::Singleton(_) => &[],
        }
    }

    /// Entity ids in iteration order.
    pub fn ids(&self) -> Vec<EntityId> {
        match self {
            StoreValue::Singleton(e) => e.iter().map(|e| e.id.clone()).collect(),
            StoreValue::Collection(items) => items.iter().map(|e| e.id.clone()).collect(),
        }
    }
}
