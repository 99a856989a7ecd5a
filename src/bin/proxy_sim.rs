//! Runs the deterministic simulation batches and a live actor smoke test.
//!
//! Usage: `proxy-sim [config.toml]`. Exits non-zero if any seed fails.

use std::sync::Arc;

use serde_json::json;
use store_proxy::config::ProxyConfig;
use store_proxy::observability::init_logging;
use store_proxy::replication::crdt_dst::{self, ProvenanceDstConfig};
use store_proxy::simulator::{self, ProxyDstConfig};
use store_proxy::{
    spawn_proxy, Capabilities, DeliveryPolicy, Entity, InMemoryBackingStore, ProxyId, StoreInfo,
    StoreKind,
};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => ProxyConfig::from_file(path)?,
        None => ProxyConfig::default(),
    }
    .with_env_overrides()?;
    init_logging(&config.logging)?;

    let sim = &config.simulation;
    info!(
        seeds = sim.seeds,
        first_seed = sim.first_seed,
        operations = sim.operations,
        "starting simulation batches"
    );

    let mut failed = false;
    for kind in [StoreKind::Singleton, StoreKind::Collection] {
        let results = simulator::run_proxy_batch(sim.first_seed, sim.seeds, sim.operations, |seed| {
            ProxyDstConfig::from_settings(seed, kind, sim)
        });
        let summary = simulator::summarize_batch(&results);
        println!("Proxy DST ({}):\n{}", kind, summary);
        for result in results.iter().filter(|r| !r.is_success()) {
            error!(seed = result.seed, violations = ?result.invariant_violations, "proxy run failed");
            failed = true;
        }
    }

    let results = crdt_dst::run_provenance_batch(sim.first_seed, sim.seeds, sim.operations, |seed| {
        ProvenanceDstConfig {
            message_drop_prob: sim.drop_probability,
            duplicate_prob: sim.duplicate_probability,
            ..ProvenanceDstConfig::moderate(seed)
        }
    });
    println!("Provenance set DST:\n{}", crdt_dst::summarize_batch(&results));
    for result in results.iter().filter(|r| !r.is_success()) {
        error!(seed = result.seed, violations = ?result.invariant_violations, "provenance run failed");
        failed = true;
    }

    if let Err(e) = actor_smoke(&config).await {
        error!(error = %e, "actor smoke test failed");
        failed = true;
    }

    if failed {
        std::process::exit(1);
    }
    info!("all simulations passed");
    Ok(())
}

/// Two proxies over one in-memory store; a write through one must reach a
/// consumer of the other.
async fn actor_smoke(config: &ProxyConfig) -> Result<(), Box<dyn std::error::Error>> {
    let backend = InMemoryBackingStore::new();
    let info = StoreInfo::volatile("smoke", StoreKind::Collection);
    backend.create_store(info.clone());

    let (writer_proxy, _) = spawn_proxy(
        ProxyId::from("writer"),
        info.clone(),
        Arc::new(backend.clone()),
        config,
    );
    let (reader_proxy, _) = spawn_proxy(
        ProxyId::from("reader"),
        info,
        Arc::new(backend.clone()),
        config,
    );

    let writer = writer_proxy
        .register(DeliveryPolicy::synced(), Capabilities::READ_WRITE)
        .await?;
    let reader = reader_proxy
        .register(DeliveryPolicy::synced(), Capabilities::READ_ONLY)
        .await?;
    writer_proxy.idle().await?;
    reader_proxy.idle().await?;

    writer_proxy
        .store(writer.id(), Entity::new("hello", json!({ "greeting": "world" })))
        .await?;
    writer_proxy.idle().await?;
    reader_proxy.idle().await?;

    let seen = reader_proxy.list(reader.id()).await?;
    if seen.len() != 1 {
        return Err(format!("reader sees {} entities, expected 1", seen.len()).into());
    }
    info!(calls = ?backend.call_counts(), "actor smoke test passed");

    writer_proxy.shutdown().await;
    reader_proxy.shutdown().await;
    Ok(())
}
