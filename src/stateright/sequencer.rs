//! Stateright model of the version sequencer
//!
//! Versions `1..=max_version` are committed up front and each has one copy
//! in flight. The checker explores every interleaving of deliveries, one
//! duplicated copy per version, a single lost copy and a single resync at
//! the latest version. Each state's arrival history is replayed through the
//! real `VersionSequencer`.

use crate::replication::sequencer::{Offer, VersionSequencer};
use crate::types::Version;
use stateright::{Model, Property};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    Arrive(Version),
    Resync(Version),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SequencerAction {
    Deliver(Version),
    Duplicate(Version),
    Drop(Version),
    Resync,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SequencerState {
    /// Copies still in the network, per version
    pub in_flight: BTreeMap<Version, u8>,
    pub duplicated: BTreeSet<Version>,
    pub dropped: Option<Version>,
    pub resynced: bool,
    pub history: Vec<Step>,
}

/// Outcome of replaying a history.
#[derive(Debug, PartialEq, Eq)]
pub struct Replay {
    /// Every applied version was exactly one past the previous one
    pub contiguous: bool,
    pub applied_twice: bool,
    pub local: Option<Version>,
    pub has_gap: bool,
    pub buffered: usize,
}

pub fn replay(history: &[Step]) -> Replay {
    let mut sequencer: VersionSequencer<()> = VersionSequencer::new(64);
    sequencer.anchor(0);
    let mut expected = 1;
    let mut contiguous = true;
    let mut seen = BTreeSet::new();
    let mut applied_twice = false;

    for step in history {
        match *step {
            Step::Arrive(v) => {
                if sequencer.offer(v, ()) != Offer::Accepted {
                    continue;
                }
            }
            Step::Resync(v) => {
                sequencer.anchor(v);
                expected = v + 1;
            }
        }
        while let Some((v, ())) = sequencer.pop_next() {
            contiguous &= v == expected;
            applied_twice |= !seen.insert(v);
            expected = v + 1;
        }
    }

    Replay {
        contiguous,
        applied_twice,
        local: sequencer.local_version(),
        has_gap: sequencer.has_gap(),
        buffered: sequencer.buffered(),
    }
}

pub struct SequencerModel {
    pub max_version: Version,
}

impl SequencerModel {
    pub fn new() -> Self {
        SequencerModel { max_version: 3 }
    }
}

impl Default for SequencerModel {
    fn default() -> Self {
        Self::new()
    }
}

impl Model for SequencerModel {
    type State = SequencerState;
    type Action = SequencerAction;

    fn init_states(&self) -> Vec<Self::State> {
        vec![SequencerState {
            in_flight: (1..=self.max_version).map(|v| (v, 1)).collect(),
            duplicated: BTreeSet::new(),
            dropped: None,
            resynced: false,
            history: Vec::new(),
        }]
    }

    fn actions(&self, state: &Self::State, actions: &mut Vec<Self::Action>) {
        for (&v, &copies) in &state.in_flight {
            if copies == 0 {
                continue;
            }
            actions.push(SequencerAction::Deliver(v));
            if !state.duplicated.contains(&v) {
                actions.push(SequencerAction::Duplicate(v));
            }
            if state.dropped.is_none() {
                actions.push(SequencerAction::Drop(v));
            }
        }
        if !state.resynced {
            actions.push(SequencerAction::Resync);
        }
    }

    fn next_state(&self, state: &Self::State, action: Self::Action) -> Option<Self::State> {
        let mut next = state.clone();
        match action {
            SequencerAction::Deliver(v) => {
                let copies = next.in_flight.get_mut(&v)?;
                *copies = copies.checked_sub(1)?;
                next.history.push(Step::Arrive(v));
            }
            SequencerAction::Duplicate(v) => {
                *next.in_flight.get_mut(&v)? += 1;
                next.duplicated.insert(v);
            }
            SequencerAction::Drop(v) => {
                let copies = next.in_flight.get_mut(&v)?;
                *copies = copies.checked_sub(1)?;
                next.dropped = Some(v);
            }
            SequencerAction::Resync => {
                next.resynced = true;
                next.history.push(Step::Resync(self.max_version));
            }
        }
        Some(next)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            // INVARIANT: applied versions are strictly contiguous
            Property::always("applied_in_order", |_: &SequencerModel, state: &SequencerState| {
                replay(&state.history).contiguous
            }),
            // INVARIANT: no version is applied twice
            Property::always("applied_once", |_: &SequencerModel, state: &SequencerState| {
                !replay(&state.history).applied_twice
            }),
            // INVARIANT: after draining, anything buffered is waiting on a gap
            Property::always("gap_iff_buffered", |_: &SequencerModel, state: &SequencerState| {
                let r = replay(&state.history);
                r.has_gap == (r.buffered > 0)
            }),
            // INVARIANT: with nothing in flight and nothing lost (or a resync
            // after the loss), the sequencer has caught up
            Property::always(
                "caught_up_when_quiet",
                |model: &SequencerModel, state: &SequencerState| {
                    let quiet = state.in_flight.values().all(|&c| c == 0);
                    let recoverable = state.dropped.is_none() || state.resynced;
                    if !(quiet && recoverable) {
                        return true;
                    }
                    replay(&state.history).local == Some(model.max_version)
                },
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replay_reordered_duplicated() {
        let r = replay(&[
            Step::Arrive(2),
            Step::Arrive(2),
            Step::Arrive(1),
            Step::Arrive(3),
            Step::Arrive(1),
        ]);
        assert!(r.contiguous);
        assert!(!r.applied_twice);
        assert_eq!(r.local, Some(3));
        assert!(!r.has_gap);
    }

    #[test]
    fn test_replay_resync_fills_lost_version() {
        let r = replay(&[Step::Arrive(1), Step::Arrive(3)]);
        assert!(r.has_gap);
        assert_eq!(r.buffered, 1);

        let r = replay(&[Step::Arrive(1), Step::Arrive(3), Step::Resync(3)]);
        assert!(!r.has_gap);
        assert_eq!(r.local, Some(3));
    }

    #[test]
    #[ignore] // Run with: cargo test stateright_sequencer -- --ignored --nocapture
    fn stateright_sequencer_model_check() {
        use stateright::Checker;

        let model = SequencerModel::new();
        let checker = model.checker().spawn_bfs().join();

        println!("States explored: {}", checker.unique_state_count());
        checker.assert_properties();
        println!("Model check passed! Sequencer invariants hold.");
    }
}
