//! Consumer registry owned by one proxy.
//!
//! Policies and capabilities are fixed at registration; changing them means
//! deregistering and registering again. Iteration is in registration order,
//! which is the order consumers receive fan-out deliveries in.

use crate::error::StorageError;
use crate::types::{Capabilities, ConsumerId, DeliveryPolicy};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    pub id: ConsumerId,
    pub policy: DeliveryPolicy,
    pub capabilities: Capabilities,
}

impl Registration {
    /// Served from the synchronized cache and told about sync state.
    pub fn is_synced(&self) -> bool {
        self.capabilities.read && self.policy.keep_synced
    }

    pub fn wants_sync(&self) -> bool {
        self.is_synced() && self.policy.notify_sync
    }

    pub fn wants_desync(&self) -> bool {
        self.is_synced() && self.policy.notify_desync
    }

    /// Receives the proxy's own sequenced updates.
    pub fn wants_sequenced_updates(&self) -> bool {
        self.is_synced() && self.policy.notify_update
    }

    /// Receives raw pushed events in arrival order.
    pub fn wants_raw_updates(&self) -> bool {
        self.capabilities.read && !self.policy.keep_synced && self.policy.notify_update
    }
}

#[derive(Debug, Default)]
pub struct ConsumerRegistry {
    entries: BTreeMap<ConsumerId, Registration>,
    next_id: u64,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, policy: DeliveryPolicy, capabilities: Capabilities) -> Registration {
        self.next_id += 1;
        let registration = Registration {
            id: ConsumerId::new(self.next_id),
            policy,
            capabilities,
        };
        self.entries.insert(registration.id, registration);
        registration
    }

    pub fn deregister(&mut self, id: ConsumerId) -> Result<Registration, StorageError> {
        self.entries
            .remove(&id)
            .ok_or(StorageError::UnknownConsumer(id))
    }

    pub fn get(&self, id: ConsumerId) -> Result<&Registration, StorageError> {
        self.entries.get(&id).ok_or(StorageError::UnknownConsumer(id))
    }

    /// Ids of registrations matching `filter`, in registration order.
    pub fn matching(&self, filter: impl Fn(&Registration) -> bool) -> Vec<ConsumerId> {
        self.entries
            .values()
            .filter(|r| filter(r))
            .map(|r| r.id)
            .collect()
    }

    pub fn any_synced(&self) -> bool {
        self.entries.values().any(Registration::is_synced)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Registration> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
