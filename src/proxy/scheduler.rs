//! Delivery queue between the proxy core and its consumers.
//!
//! Deliveries are queued in the order the core produced them and dispatched
//! one at a time, which keeps per-consumer FIFO and the cross-consumer
//! relative order of effective changes. Detaching a consumer discards what
//! is still queued for it.

use crate::types::{ConsumerId, Entity, StoreValue};
use std::collections::VecDeque;

/// What changed, as seen by one consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    Singleton(Option<Entity>),
    Collection {
        added: Vec<Entity>,
        removed: Vec<Entity>,
    },
}

impl Change {
    pub fn added(entity: Entity) -> Self {
        Change::Collection {
            added: vec![entity],
            removed: Vec::new(),
        }
    }

    pub fn removed(entity: Entity) -> Self {
        Change::Collection {
            added: Vec::new(),
            removed: vec![entity],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// The proxy (re)synchronized; carries the caught-up value.
    Sync(StoreValue),
    Desync,
    /// `originator` is true only for the consumer whose write caused it.
    Update { change: Change, originator: bool },
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Notification::Sync(_) => "sync",
            Notification::Desync => "desync",
            Notification::Update { .. } => "update",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub consumer: ConsumerId,
    pub notification: Notification,
}

#[derive(Debug, Default)]
pub struct DeliveryQueue {
    queue: VecDeque<Delivery>,
}

impl DeliveryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, consumer: ConsumerId, notification: Notification) {
        self.queue.push_back(Delivery {
            consumer,
            notification,
        });
    }

    pub fn pop(&mut self) -> Option<Delivery> {
        self.queue.pop_front()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Delivery> + '_ {
        self.queue.drain(..)
    }

    /// Discards deliveries queued for `consumer`. Returns how many.
    pub fn discard(&mut self, consumer: ConsumerId) -> usize {
        let before = self.queue.len();
        self.queue.retain(|d| d.consumer != consumer);
        before - self.queue.len()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
