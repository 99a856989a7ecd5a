//! Deterministic Simulation Testing for provenance-set convergence
//!
//! Replicas apply adds and observed-removes locally and broadcast them over a
//! faulty network that drops, duplicates and reorders messages. Delivery is
//! causal per provenance key (a remove never overtakes the add of a key it
//! retracts), messages are deduplicated by id, and dropped messages are
//! retransmitted during `sync_all`.
//!
//! ```text
//! for seed in 0..100 {
//!     let mut harness = ProvenanceDstHarness::new(ProvenanceDstConfig::calm(seed));
//!     harness.run(200);
//!     harness.sync_all();
//!     harness.check_convergence();  // compares every replica to the shadow
//! }
//! ```

use super::provenance::ProvenanceSet;
use crate::simulator::rng::DeterministicRng;
use crate::types::{Entity, EntityId, ProvenanceKey};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Configuration for provenance-set DST
#[derive(Debug, Clone)]
pub struct ProvenanceDstConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    pub num_replicas: usize,
    /// Distinct entity ids operations draw from
    pub entity_pool: u64,
    /// Probability a broadcast copy is lost until `sync_all`
    pub message_drop_prob: f64,
    pub duplicate_prob: f64,
    /// Probability of a delivery round after each operation
    pub delivery_prob: f64,
    /// Probability an operation is a remove
    pub remove_prob: f64,
}

impl Default for ProvenanceDstConfig {
    fn default() -> Self {
        ProvenanceDstConfig {
            seed: 0,
            num_replicas: 3,
            entity_pool: 8,
            message_drop_prob: 0.0,
            duplicate_prob: 0.0,
            delivery_prob: 0.5,
            remove_prob: 0.3,
        }
    }
}

impl ProvenanceDstConfig {
    /// Calm mode - lossless, in-order-ish delivery
    pub fn calm(seed: u64) -> Self {
        ProvenanceDstConfig {
            seed,
            ..Default::default()
        }
    }

    /// Moderate fault injection
    pub fn moderate(seed: u64) -> Self {
        ProvenanceDstConfig {
            seed,
            num_replicas: 4,
            message_drop_prob: 0.1,
            duplicate_prob: 0.1,
            delivery_prob: 0.3,
            ..Default::default()
        }
    }

    /// Chaos mode - aggressive fault injection
    pub fn chaos(seed: u64) -> Self {
        ProvenanceDstConfig {
            seed,
            num_replicas: 5,
            entity_pool: 4,
            message_drop_prob: 0.3,
            duplicate_prob: 0.25,
            delivery_prob: 0.15,
            remove_prob: 0.45,
        }
    }
}

/// Result of a provenance-set DST run
#[derive(Debug, Clone, Default)]
pub struct ProvenanceDstResult {
    pub seed: u64,
    pub total_operations: u64,
    /// Local operations that changed membership at their origin
    pub effective_operations: u64,
    pub messages_delivered: u64,
    pub messages_dropped: u64,
    pub duplicates_ignored: u64,
    pub invariant_violations: Vec<String>,
    pub converged: bool,
}

impl ProvenanceDstResult {
    pub fn is_success(&self) -> bool {
        self.invariant_violations.is_empty() && self.converged
    }

    pub fn summary(&self) -> String {
        format!(
            "Seed {}: {} ops ({} effective), {} delivered, {} drops, {} dups, converged={}, {} violations",
            self.seed,
            self.total_operations,
            self.effective_operations,
            self.messages_delivered,
            self.messages_dropped,
            self.duplicates_ignored,
            self.converged,
            self.invariant_violations.len()
        )
    }
}

#[derive(Debug, Clone)]
enum SetOp {
    Add { entity: Entity, key: ProvenanceKey },
    Remove { id: EntityId, keys: Vec<ProvenanceKey> },
}

#[derive(Debug, Clone)]
struct Message {
    id: u64,
    op: SetOp,
}

struct Replica {
    set: ProvenanceSet,
    /// Message ids already applied
    applied: HashSet<u64>,
    inbox: Vec<Message>,
}

// =============================================================================
// Harness
// =============================================================================

pub struct ProvenanceDstHarness {
    config: ProvenanceDstConfig,
    rng: DeterministicRng,
    replicas: Vec<Replica>,
    /// Message id that introduced each key
    key_origin: HashMap<ProvenanceKey, u64>,
    /// Copies lost in transit, by destination
    lost: Vec<(usize, Message)>,
    /// Ground truth: live keys per entity
    shadow: BTreeMap<EntityId, BTreeSet<ProvenanceKey>>,
    next_message: u64,
    result: ProvenanceDstResult,
}

impl ProvenanceDstHarness {
    pub fn new(config: ProvenanceDstConfig) -> Self {
        let rng = DeterministicRng::new(config.seed);
        let replicas = (0..config.num_replicas)
            .map(|_| Replica {
                set: ProvenanceSet::new(),
                applied: HashSet::new(),
                inbox: Vec::new(),
            })
            .collect();

        ProvenanceDstHarness {
            result: ProvenanceDstResult {
                seed: config.seed,
                ..Default::default()
            },
            config,
            rng,
            replicas,
            key_origin: HashMap::new(),
            lost: Vec::new(),
            shadow: BTreeMap::new(),
            next_message: 0,
        }
    }

    /// Run random operations, interleaved with partial delivery rounds
    pub fn run(&mut self, operations: usize) {
        for _ in 0..operations {
            let origin = self.rng.gen_range(0, self.config.num_replicas as u64) as usize;
            let id = EntityId::new(format!(
                "e{}",
                self.rng.gen_range(0, self.config.entity_pool)
            ));

            let op = if self.rng.gen_bool(self.config.remove_prob) {
                // Observed remove: only the keys this replica has seen.
                let keys = self.replicas[origin].set.keys(&id);
                SetOp::Remove { id, keys }
            } else {
                self.next_message += 1;
                let key = ProvenanceKey::new(format!("r{}:k{}", origin, self.next_message));
                SetOp::Add {
                    entity: payload(&id),
                    key,
                }
            };

            self.next_message += 1;
            let message = Message {
                id: self.next_message,
                op,
            };
            if let SetOp::Add { key, .. } = &message.op {
                self.key_origin.insert(key.clone(), message.id);
            }
            self.record_shadow(&message.op);

            if apply(&mut self.replicas[origin], &message) {
                self.result.effective_operations += 1;
            }
            self.result.total_operations += 1;
            self.broadcast(origin, message);

            if self.rng.gen_bool(self.config.delivery_prob) {
                let target = self.rng.gen_range(0, self.config.num_replicas as u64) as usize;
                let budget = self.rng.gen_range(1, 4) as usize;
                self.deliver(target, budget);
            }
        }
    }

    fn record_shadow(&mut self, op: &SetOp) {
        match op {
            SetOp::Add { entity, key } => {
                self.shadow
                    .entry(entity.id.clone())
                    .or_default()
                    .insert(key.clone());
            }
            SetOp::Remove { id, keys } => {
                if let Some(live) = self.shadow.get_mut(id) {
                    for key in keys {
                        live.remove(key);
                    }
                    if live.is_empty() {
                        self.shadow.remove(id);
                    }
                }
            }
        }
    }

    fn broadcast(&mut self, origin: usize, message: Message) {
        for dest in 0..self.replicas.len() {
            if dest == origin {
                continue;
            }
            if self.rng.gen_bool(self.config.message_drop_prob) {
                self.result.messages_dropped += 1;
                self.lost.push((dest, message.clone()));
                continue;
            }
            self.replicas[dest].inbox.push(message.clone());
            if self.rng.gen_bool(self.config.duplicate_prob) {
                self.replicas[dest].inbox.push(message.clone());
            }
        }
    }

    /// A message is deliverable once every key it retracts has been added
    /// at the destination.
    fn deliverable(&self, dest: usize, message: &Message) -> bool {
        match &message.op {
            SetOp::Add { .. } => true,
            SetOp::Remove { keys, .. } => keys.iter().all(|key| {
                self.key_origin
                    .get(key)
                    .map(|origin| self.replicas[dest].applied.contains(origin))
                    .unwrap_or(true)
            }),
        }
    }

    /// Deliver up to `budget` messages to `dest`, picked at random among the
    /// deliverable ones. Returns how many were taken off the inbox.
    fn deliver(&mut self, dest: usize, budget: usize) -> usize {
        let mut taken = 0;
        while taken < budget {
            let ready: Vec<usize> = self.replicas[dest]
                .inbox
                .iter()
                .enumerate()
                .filter(|(_, m)| self.deliverable(dest, m))
                .map(|(i, _)| i)
                .collect();
            if ready.is_empty() {
                break;
            }
            let pick = ready[self.rng.gen_range(0, ready.len() as u64) as usize];
            let message = self.replicas[dest].inbox.swap_remove(pick);
            taken += 1;

            if self.replicas[dest].applied.contains(&message.id) {
                self.result.duplicates_ignored += 1;
                continue;
            }
            apply(&mut self.replicas[dest], &message);
            self.result.messages_delivered += 1;

            #[cfg(debug_assertions)]
            self.replicas[dest].set.verify_invariants();
        }
        taken
    }

    /// Retransmit lost copies and deliver everything.
    pub fn sync_all(&mut self) {
        for (dest, message) in self.lost.drain(..) {
            self.replicas[dest].inbox.push(message);
        }
        loop {
            let mut progressed = 0;
            for dest in 0..self.replicas.len() {
                progressed += self.deliver(dest, usize::MAX);
            }
            if progressed == 0 {
                break;
            }
        }
        for (i, replica) in self.replicas.iter().enumerate() {
            if !replica.inbox.is_empty() {
                self.result.invariant_violations.push(format!(
                    "Replica {} stuck with {} undeliverable messages",
                    i,
                    replica.inbox.len()
                ));
            }
        }
    }

    /// Every replica must hold exactly the shadow's members.
    pub fn check_convergence(&mut self) {
        let expected: Vec<EntityId> = self.shadow.keys().cloned().collect();

        for (i, replica) in self.replicas.iter().enumerate() {
            #[cfg(debug_assertions)]
            replica.set.verify_invariants();

            let mut actual: Vec<EntityId> = replica.set.iter().map(|e| e.id.clone()).collect();
            actual.sort();
            if actual != expected {
                self.result.invariant_violations.push(format!(
                    "Replica {} has members {:?} but expected {:?}",
                    i, actual, expected
                ));
            }
            for (id, keys) in &self.shadow {
                let held: BTreeSet<ProvenanceKey> = replica.set.keys(id).into_iter().collect();
                if held != *keys {
                    self.result.invariant_violations.push(format!(
                        "Replica {} holds keys {:?} for {} but expected {:?}",
                        i, held, id, keys
                    ));
                }
            }
        }

        self.result.converged = self.result.invariant_violations.is_empty();
    }

    pub fn result(&self) -> &ProvenanceDstResult {
        &self.result
    }

    pub fn into_result(self) -> ProvenanceDstResult {
        self.result
    }
}

fn payload(id: &EntityId) -> Entity {
    Entity {
        id: id.clone(),
        data: json!({ "name": id.as_str() }),
    }
}

/// Applies a message and marks it applied. Returns whether membership changed.
fn apply(replica: &mut Replica, message: &Message) -> bool {
    replica.applied.insert(message.id);
    match &message.op {
        SetOp::Add { entity, key } => replica.set.add(entity.clone(), key.clone()),
        SetOp::Remove { id, keys } => replica.set.remove(id, keys).is_some(),
    }
}

// =============================================================================
// Batch Runner
// =============================================================================

/// Run a batch of provenance-set DST tests
pub fn run_provenance_batch(
    base_seed: u64,
    count: usize,
    ops_per_run: usize,
    config_fn: impl Fn(u64) -> ProvenanceDstConfig,
) -> Vec<ProvenanceDstResult> {
    let mut results = Vec::with_capacity(count);

    for i in 0..count {
        let seed = base_seed + i as u64;
        let mut harness = ProvenanceDstHarness::new(config_fn(seed));
        harness.run(ops_per_run);
        harness.sync_all();
        harness.check_convergence();
        results.push(harness.into_result());
    }

    results
}

/// Summarize batch results
pub fn summarize_batch(results: &[ProvenanceDstResult]) -> String {
    let total = results.len();
    let passed = results.iter().filter(|r| r.is_success()).count();
    let failed_seeds: Vec<u64> = results
        .iter()
        .filter(|r| !r.is_success())
        .map(|r| r.seed)
        .collect();

    let total_ops: u64 = results.iter().map(|r| r.total_operations).sum();
    let total_delivered: u64 = results.iter().map(|r| r.messages_delivered).sum();
    let total_drops: u64 = results.iter().map(|r| r.messages_dropped).sum();
    let total_dups: u64 = results.iter().map(|r| r.duplicates_ignored).sum();

    let mut summary = format!(
        "Batch: {}/{} passed, {} total ops, {} delivered, {} drops, {} dups",
        passed, total, total_ops, total_delivered, total_drops, total_dups
    );

    if !failed_seeds.is_empty() {
        summary.push_str(&format!("\nFailed seeds: {:?}", failed_seeds));
    }

    summary
}
