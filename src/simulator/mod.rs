//! Deterministic simulation
//!
//! Everything here is driven by a seeded [`DeterministicRng`]: a failing
//! seed replays the exact interleaving of writes, drops, duplicates and
//! reorderings that broke it.

pub mod harness;
pub mod rng;

pub use harness::{
    run_proxy_batch, summarize_batch, ProxyDstConfig, ProxyDstHarness, ProxyDstResult,
};
pub use rng::DeterministicRng;
