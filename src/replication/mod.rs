pub mod barrier;
pub mod crdt_dst;
pub mod provenance;
pub mod sequencer;

pub use barrier::{BarrierScope, Verdict, WriteBarrier};
pub use provenance::{LiteralEntry, ProvenanceSet};
pub use sequencer::{Offer, VersionSequencer};
