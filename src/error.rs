//! Storage error taxonomy
//!
//! Only direct write failures, capability violations and other programming
//! errors surface to callers. Version gaps, stale resyncs and suppressed
//! events are handled inside the proxy and never become errors.

use crate::types::{ConsumerId, EntityId, StoreId, StoreKind};

/// Error type for proxy and backing-store operations
#[derive(Debug, Clone, PartialEq)]
pub enum StorageError {
    /// Read on a write-only registration or write on a read-only one
    CapabilityViolation {
        consumer: ConsumerId,
        operation: &'static str,
    },
    /// Consumer is not registered with this proxy
    UnknownConsumer(ConsumerId),
    /// Backing store refused a forwarded write
    WriteRejected { store: StoreId, reason: String },
    /// Pointer resolves to no payload in the backing location
    DanglingReference { id: EntityId, backing: String },
    /// Store does not exist
    NotFound { store: StoreId },
    /// Backing store could not serve the request right now
    Unavailable { store: StoreId },
    /// Cursor id unknown or already closed
    UnknownCursor(u64),
    /// Storage key could not be parsed
    InvalidStorageKey(String),
    /// Operation does not apply to this kind of store
    KindMismatch {
        store: StoreId,
        kind: StoreKind,
        operation: &'static str,
    },
    /// Proxy actor has shut down
    ProxyClosed,
    /// Configuration could not be loaded
    Config(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::CapabilityViolation { consumer, operation } => {
                write!(f, "{} lacks the capability for {}", consumer, operation)
            }
            StorageError::UnknownConsumer(id) => write!(f, "{} is not registered", id),
            StorageError::WriteRejected { store, reason } => {
                write!(f, "write to store {} rejected: {}", store, reason)
            }
            StorageError::DanglingReference { id, backing } => {
                write!(f, "dangling reference: {} has no payload in {}", id, backing)
            }
            StorageError::NotFound { store } => write!(f, "store not found: {}", store),
            StorageError::Unavailable { store } => write!(f, "store unavailable: {}", store),
            StorageError::UnknownCursor(id) => write!(f, "unknown or closed cursor: {}", id),
            StorageError::InvalidStorageKey(key) => write!(f, "invalid storage key: {}", key),
            StorageError::KindMismatch {
                store,
                kind,
                operation,
            } => write!(f, "{} is not supported on {} store {}", operation, kind, store),
            StorageError::ProxyClosed => write!(f, "storage proxy closed"),
            StorageError::Config(msg) => write!(f, "configuration error: {}", msg),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<toml::de::Error> for StorageError {
    fn from(e: toml::de::Error) -> Self {
        StorageError::Config(e.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(e: std::io::Error) -> Self {
        StorageError::Config(e.to_string())
    }
}

impl StorageError {
    /// Programming errors are reported synchronously and never retried.
    pub fn is_programming_error(&self) -> bool {
        matches!(
            self,
            StorageError::CapabilityViolation { .. }
                | StorageError::UnknownConsumer(_)
                | StorageError::UnknownCursor(_)
                | StorageError::KindMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_classification() {
        let err = StorageError::CapabilityViolation {
            consumer: ConsumerId::new(3),
            operation: "fetch",
        };
        assert_eq!(err.to_string(), "consumer-3 lacks the capability for fetch");
        assert!(err.is_programming_error());

        let dangling = StorageError::DanglingReference {
            id: EntityId::from("e1"),
            backing: "volatile://backing".to_string(),
        };
        assert!(!dangling.is_programming_error());
        assert_ne!(
            dangling,
            StorageError::NotFound {
                store: StoreId::from("e1")
            }
        );
    }
}
