//! Write Barrier Tracker
//!
//! Gives read-your-own-writes without blocking. A local write arms a barrier
//! and forwards the barrier token with the write. Until an event carrying
//! that token comes back:
//!
//! - singleton stores suppress every other event (it would expose a value
//!   causally older than the write already visible locally);
//! - collection stores keep applying other events, since provenance
//!   operations commute, and only use the token to recognize the echo.
//!
//! At most one barrier is pending; a second write replaces it. The write
//! acknowledgement reports the version the store assigned, which lets the
//! proxy release a barrier whose own event was lost or superseded by a
//! snapshot.

use crate::types::{BarrierToken, StoreKind, Version};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierScope {
    /// Suppress non-matching events while pending.
    Suppress,
    /// Apply non-matching events normally.
    EchoOnly,
}

impl BarrierScope {
    pub fn for_kind(kind: StoreKind) -> Self {
        match kind {
            StoreKind::Singleton => BarrierScope::Suppress,
            StoreKind::Collection | StoreKind::BigCollection => BarrierScope::EchoOnly,
        }
    }
}

/// How an incoming event relates to the pending barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// No barrier in the way.
    Deliver,
    /// The event confirms the pending write; the barrier is released.
    Confirmed,
    /// Sequence it but neither apply nor deliver it.
    Suppressed,
}

#[derive(Debug, Clone)]
struct Pending {
    token: BarrierToken,
    acked_version: Option<Version>,
}

#[derive(Debug, Clone)]
pub struct WriteBarrier {
    scope: BarrierScope,
    pending: Option<Pending>,
}

impl WriteBarrier {
    pub fn new(scope: BarrierScope) -> Self {
        WriteBarrier {
            scope,
            pending: None,
        }
    }

    pub fn scope(&self) -> BarrierScope {
        self.scope
    }

    /// Arms a barrier for a new local write. Returns the token it replaced.
    pub fn arm(&mut self, token: BarrierToken) -> Option<BarrierToken> {
        self.pending
            .replace(Pending {
                token,
                acked_version: None,
            })
            .map(|p| p.token)
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn pending_token(&self) -> Option<&BarrierToken> {
        self.pending.as_ref().map(|p| &p.token)
    }

    pub fn check(&mut self, barrier: Option<&BarrierToken>) -> Verdict {
        let Some(pending) = &self.pending else {
            return Verdict::Deliver;
        };
        if barrier == Some(&pending.token) {
            self.pending = None;
            return Verdict::Confirmed;
        }
        match self.scope {
            BarrierScope::Suppress => Verdict::Suppressed,
            BarrierScope::EchoOnly => Verdict::Deliver,
        }
    }

    /// Records the version assigned to the write behind `token`. Acks for a
    /// replaced barrier are ignored.
    pub fn acknowledge(&mut self, token: &BarrierToken, version: Version) -> bool {
        match &mut self.pending {
            Some(p) if &p.token == token => {
                p.acked_version = Some(version);
                true
            }
            _ => false,
        }
    }

    /// Releases the barrier if its write is already covered by `local_version`.
    pub fn release_if_covered(&mut self, local_version: Version) -> Option<BarrierToken> {
        let covered = matches!(
            &self.pending,
            Some(Pending { acked_version: Some(v), .. }) if *v <= local_version
        );
        if covered {
            self.pending.take().map(|p| p.token)
        } else {
            None
        }
    }

    /// Releases the barrier after its write was rejected.
    pub fn fail(&mut self, token: &BarrierToken) -> bool {
        if self.pending_token() == Some(token) {
            self.pending = None;
            true
        } else {
            false
        }
    }
}
