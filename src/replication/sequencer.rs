//! Version Sequencer
//!
//! Turns a best-effort, possibly reordered or duplicated event stream into a
//! gap-free application sequence:
//!
//! ```text
//! arrival:  1  4  3  2  5
//! applied:  1  .  .  2 3 4  5
//! buffer:   -  4  3,4  -    -
//! ```
//!
//! Events at or below the local version are stale and discarded. Events
//! beyond `local + 1` wait in a buffer keyed by version (duplicates keep the
//! first copy). A snapshot anchors the sequencer at its version and drops
//! everything it supersedes.

use crate::types::Version;
use std::collections::BTreeMap;

/// What happened to an offered event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Already applied or superseded.
    Stale,
    /// Same version already buffered.
    Duplicate,
    /// Buffered; call `pop_next` to drain what became contiguous.
    Accepted,
    /// Buffer limit exceeded. The buffer was emptied; only a resync recovers.
    Overflow,
}

#[derive(Debug)]
pub struct VersionSequencer<E> {
    local_version: Option<Version>,
    buffer: BTreeMap<Version, E>,
    max_buffered: usize,
}

impl<E> VersionSequencer<E> {
    pub fn new(max_buffered: usize) -> Self {
        VersionSequencer {
            local_version: None,
            buffer: BTreeMap::new(),
            max_buffered: max_buffered.max(1),
        }
    }

    /// Highest applied version. `None` until the first snapshot anchors us;
    /// events arriving before that are only buffered.
    pub fn local_version(&self) -> Option<Version> {
        self.local_version
    }

    pub fn is_anchored(&self) -> bool {
        self.local_version.is_some()
    }

    pub fn offer(&mut self, version: Version, event: E) -> Offer {
        if matches!(self.local_version, Some(local) if version <= local) {
            return Offer::Stale;
        }
        if self.buffer.contains_key(&version) {
            return Offer::Duplicate;
        }
        self.buffer.insert(version, event);
        if self.buffer.len() > self.max_buffered {
            self.buffer.clear();
            return Offer::Overflow;
        }
        Offer::Accepted
    }

    /// Pops the next contiguous event, advancing the local version.
    pub fn pop_next(&mut self) -> Option<(Version, E)> {
        let next = self.local_version? + 1;
        let entry = self.buffer.first_entry()?;
        if *entry.key() != next {
            return None;
        }
        let event = entry.remove();
        self.local_version = Some(next);
        Some((next, event))
    }

    /// True while buffered events wait on a missing version.
    pub fn has_gap(&self) -> bool {
        match self.local_version {
            Some(local) => self
                .buffer
                .keys()
                .next()
                .map(|&v| v > local + 1)
                .unwrap_or(false),
            None => false,
        }
    }

    /// Anchors at a snapshot version, discarding superseded buffered events.
    /// Returns how many were discarded.
    pub fn anchor(&mut self, snapshot_version: Version) -> usize {
        debug_assert!(
            self.local_version.map_or(true, |v| snapshot_version >= v),
            "Precondition: snapshot must not move the sequencer backwards"
        );
        let retained = self.buffer.split_off(&(snapshot_version + 1));
        let discarded = self.buffer.len();
        self.buffer = retained;
        self.local_version = Some(snapshot_version);
        discarded
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Versions currently waiting, ascending.
    pub fn buffered_versions(&self) -> Vec<Version> {
        self.buffer.keys().copied().collect()
    }
}
