//! Store proxy
//!
//! `core` is the sans-IO state machine: it takes events, snapshots and write
//! results and produces commands for the backing store plus deliveries for
//! consumers. `actor` drives a core on a tokio task.

pub mod actor;
pub mod core;
pub mod registry;
pub mod scheduler;

pub use actor::{spawn_proxy, ConsumerHandle, ProxyActor, ProxyHandle};
pub use self::core::{Command, LocalWrite, ProxyCore, ProxyStats, Read, SyncState};
pub use registry::{ConsumerRegistry, Registration};
pub use scheduler::{Change, Delivery, DeliveryQueue, Notification};
