//! Stateright model checking
//!
//! Exhaustive state-space exploration complementing the seeded simulations
//! in `simulator` and `replication::crdt_dst`.
//!
//! ## Available Models
//!
//! - `sequencer`: gap-free, in-order, exactly-once application under
//!   reordering, duplication, loss and resync
//!
//! ## Running Model Checks
//!
//! ```bash
//! # Marked #[ignore] for CI speed
//! cargo test stateright -- --ignored --nocapture
//! ```

pub mod sequencer;

pub use sequencer::SequencerModel;
