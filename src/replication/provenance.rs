//! Provenance-tracked collection membership (observed-remove set)
//!
//! An entity is a member while at least one provenance key asserts it.
//! Adds and removes report whether they were *effective*, i.e. whether they
//! changed membership. Only effective operations are ever surfaced to
//! consumers.
//!
//! Iteration order is the order of first effective add; non-effective
//! operations never reorder members.

use crate::types::{Entity, EntityId, ProvenanceKey};
use ahash::AHashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
struct Member {
    entity: Entity,
    keys: BTreeSet<ProvenanceKey>,
    seq: u64,
}

/// One member in transferable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiteralEntry {
    pub entity: Entity,
    pub keys: Vec<ProvenanceKey>,
}

#[derive(Debug, Clone, Default)]
pub struct ProvenanceSet {
    members: AHashMap<EntityId, Member>,
    order: BTreeMap<u64, EntityId>,
    next_seq: u64,
}

impl ProvenanceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Asserts `entity` under `key`. Effective iff the entity was absent.
    ///
    /// A new key on an existing member replaces its payload but is not a
    /// membership change.
    pub fn add(&mut self, entity: Entity, key: ProvenanceKey) -> bool {
        if let Some(member) = self.members.get_mut(&entity.id) {
            if member.keys.insert(key) && member.entity != entity {
                member.entity = entity;
            }
            return false;
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        let id = entity.id.clone();
        let mut keys = BTreeSet::new();
        keys.insert(key);
        self.order.insert(seq, id.clone());
        self.members.insert(id, Member { entity, keys, seq });

        #[cfg(debug_assertions)]
        self.verify_invariants();

        true
    }

    /// Retracts `keys` from `id`. Returns the removed entity iff the member
    /// became absent. Unknown ids and unknown keys are no-ops.
    pub fn remove(&mut self, id: &EntityId, keys: &[ProvenanceKey]) -> Option<Entity> {
        let member = self.members.get_mut(id)?;
        for key in keys {
            member.keys.remove(key);
        }
        if !member.keys.is_empty() {
            return None;
        }

        let member = self.members.remove(id)?;
        self.order.remove(&member.seq);

        #[cfg(debug_assertions)]
        self.verify_invariants();

        Some(member.entity)
    }

    pub fn remove_key(&mut self, id: &EntityId, key: &ProvenanceKey) -> Option<Entity> {
        self.remove(id, std::slice::from_ref(key))
    }

    /// Retracts every key of every member, returning the removed entities in
    /// iteration order.
    pub fn clear(&mut self) -> Vec<Entity> {
        let removed = self.list();
        self.members.clear();
        self.order.clear();
        removed
    }

    pub fn contains(&self, id: &EntityId) -> bool {
        self.members.contains_key(id)
    }

    pub fn get(&self, id: &EntityId) -> Option<&Entity> {
        self.members.get(id).map(|m| &m.entity)
    }

    /// Keys currently asserting `id`, sorted.
    pub fn keys(&self, id: &EntityId) -> Vec<ProvenanceKey> {
        self.members
            .get(id)
            .map(|m| m.keys.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entity> + '_ {
        self.order
            .values()
            .filter_map(move |id| self.members.get(id).map(|m| &m.entity))
    }

    pub fn list(&self) -> Vec<Entity> {
        self.iter().cloned().collect()
    }

    pub fn to_literal(&self) -> Vec<LiteralEntry> {
        self.order
            .values()
            .filter_map(|id| self.members.get(id))
            .map(|m| LiteralEntry {
                entity: m.entity.clone(),
                keys: m.keys.iter().cloned().collect(),
            })
            .collect()
    }

    /// Rebuilds a set from a literal. Entries without keys are not members.
    pub fn from_literal(entries: impl IntoIterator<Item = LiteralEntry>) -> Self {
        let mut set = ProvenanceSet::new();
        for entry in entries {
            for key in entry.keys {
                set.add(entry.entity.clone(), key);
            }
        }
        set
    }

    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        debug_assert_eq!(
            self.members.len(),
            self.order.len(),
            "Invariant: every member has exactly one order slot"
        );
        for (id, member) in &self.members {
            debug_assert!(
                !member.keys.is_empty(),
                "Invariant: member '{}' must have at least one key",
                id
            );
            debug_assert_eq!(self.order.get(&member.seq), Some(id));
        }
    }
}

impl PartialEq for ProvenanceSet {
    /// Equal membership, payloads, keys and order; sequence numbers are ignored.
    fn eq(&self, other: &Self) -> bool {
        self.to_literal() == other.to_literal()
    }
}
