//! Storage proxy behavioral properties
//!
//! Provenance idempotence, multi-key membership, version contiguity,
//! read-your-writes, cursor snapshot isolation, write-only registrations and
//! the end-to-end desync/resync scenario.

use std::sync::Arc;

use serde_json::json;
use store_proxy::backend::{
    BackingStore, Mutation, StoreEvent, StoreModel, SyncResponse, WriteAck, WriteOp,
};
use store_proxy::config::ProxyConfig;
use store_proxy::memory::InMemoryBackingStore;
use store_proxy::proxy::core::{Command, LocalWrite, ProxyCore, Read, SyncState};
use store_proxy::proxy::scheduler::{Change, Notification};
use store_proxy::proxy::spawn_proxy;
use store_proxy::replication::provenance::ProvenanceSet;
use store_proxy::{
    Capabilities, ConsumerId, DeliveryPolicy, Entity, EntityId, ProvenanceKey, ProxyId,
    StorageError, StoreId, StoreInfo, StoreKind, StoreValue, Version,
};

// =============================================================================
// Helpers
// =============================================================================

fn entity(id: &str) -> Entity {
    Entity::new(id, json!({ "name": id }))
}

fn key(k: &str) -> ProvenanceKey {
    ProvenanceKey::from(k)
}

fn event(store: &str, version: Version, mutation: Mutation) -> StoreEvent {
    StoreEvent {
        store: StoreId::from(store),
        version,
        originator: None,
        barrier: None,
        mutation,
    }
}

fn add(store: &str, version: Version, id: &str, k: &str) -> StoreEvent {
    event(
        store,
        version,
        Mutation::Add {
            entity: entity(id),
            key: key(k),
            effective: true,
        },
    )
}

fn remove(store: &str, version: Version, id: &str, keys: &[&str]) -> StoreEvent {
    event(
        store,
        version,
        Mutation::Remove {
            entity: entity(id),
            keys: keys.iter().map(|k| key(k)).collect(),
            effective: true,
        },
    )
}

/// A collection proxy synchronized to an empty store at version 0, with one
/// synced read-only consumer whose initial sync has been drained.
fn synced_collection() -> (ProxyCore, ConsumerId) {
    let mut core = ProxyCore::new(
        ProxyId::from("p1"),
        StoreInfo::volatile("c", StoreKind::Collection),
        64,
    );
    let (consumer, commands) = core.register(DeliveryPolicy::synced(), Capabilities::READ_ONLY);
    assert_eq!(commands, vec![Command::Initialize, Command::Synchronize]);
    core.on_sync_response(SyncResponse {
        version: 0,
        model: StoreModel::Collection(Vec::new()),
    });
    assert_eq!(core.state(), SyncState::Synced);
    core.take_deliveries();
    (core, consumer)
}

fn updates(core: &mut ProxyCore) -> Vec<Notification> {
    core.take_deliveries()
        .into_iter()
        .map(|d| d.notification)
        .collect()
}

// =============================================================================
// 1. Provenance idempotence
// =============================================================================

#[test]
fn test_provenance_idempotence() {
    let mut set = ProvenanceSet::new();
    assert!(set.add(entity("a"), key("k1")));
    assert!(!set.add(entity("a"), key("k1")));
    assert!(set.remove(&EntityId::from("a"), &[key("never")]).is_none());
    assert!(set.contains(&EntityId::from("a")));

    let (mut core, _) = synced_collection();
    core.on_event(add("c", 1, "a", "k1"));
    core.on_event(add("c", 2, "a", "k1"));
    core.on_event(remove("c", 3, "a", &["never"]));
    assert_eq!(
        updates(&mut core),
        vec![Notification::Update {
            change: Change::added(entity("a")),
            originator: false,
        }],
        "one effective add, nothing for the repeat or the unknown key"
    );
    assert_eq!(core.value(), StoreValue::Collection(vec![entity("a")]));
}

// =============================================================================
// 2. Multi-key membership
// =============================================================================

#[test]
fn test_multi_key_membership() {
    let (mut core, _) = synced_collection();

    core.on_event(add("c", 1, "a", "k1"));
    core.on_event(add("c", 2, "a", "k2"));
    assert_eq!(updates(&mut core).len(), 1, "only the first key is effective");

    core.on_event(remove("c", 3, "a", &["k1"]));
    assert!(updates(&mut core).is_empty(), "k2 still asserts membership");
    assert_eq!(core.observed_keys(&EntityId::from("a")), vec![key("k2")]);

    core.on_event(remove("c", 4, "a", &["k2"]));
    assert_eq!(
        updates(&mut core),
        vec![Notification::Update {
            change: Change::removed(entity("a")),
            originator: false,
        }]
    );
    assert_eq!(core.value(), StoreValue::Collection(Vec::new()));
}

// =============================================================================
// 3. Version contiguity
// =============================================================================

#[test]
fn test_version_contiguity_with_self_heal() {
    let (mut core, _) = synced_collection();
    let mut resyncs = 0;
    let mut feed = |core: &mut ProxyCore, v: Version| {
        let commands = core.on_event(add("c", v, &format!("e{}", v), &format!("k{}", v)));
        resyncs += commands
            .iter()
            .filter(|c| **c == Command::Synchronize)
            .count();
    };

    feed(&mut core, 1);
    assert_eq!(core.state(), SyncState::Synced);
    feed(&mut core, 4);
    assert_eq!(core.state(), SyncState::Desynced);
    feed(&mut core, 3);
    feed(&mut core, 2);
    assert_eq!(core.state(), SyncState::Synced, "the gap filled itself");
    feed(&mut core, 5);
    drop(feed);

    assert_eq!(resyncs, 1, "at most one resync request");
    assert_eq!(core.stats().desyncs, 1);
    assert_eq!(core.local_version(), Some(5));

    // Members iterate in first-add order, which is application order.
    let order: Vec<String> = core
        .value()
        .ids()
        .into_iter()
        .map(|id| id.to_string())
        .collect();
    assert_eq!(order, vec!["e1", "e2", "e3", "e4", "e5"]);

    let notifications = updates(&mut core);
    assert_eq!(
        notifications.iter().filter(|n| **n == Notification::Desync).count(),
        1
    );
    assert_eq!(
        notifications
            .iter()
            .filter(|n| matches!(n, Notification::Sync(_)))
            .count(),
        1,
        "healing re-syncs consumers once"
    );

    // The resync response is behind the local version and is discarded.
    let commands = core.on_sync_response(SyncResponse {
        version: 4,
        model: StoreModel::Collection(Vec::new()),
    });
    assert!(commands.is_empty());
    assert_eq!(core.stats().stale_snapshots, 1);
    assert_eq!(core.value().ids().len(), 5);
    assert!(updates(&mut core).is_empty());
}

// =============================================================================
// 4. Read-your-writes
// =============================================================================

#[test]
fn test_read_your_writes_behind_barrier() {
    let mut core = ProxyCore::new(
        ProxyId::from("p1"),
        StoreInfo::volatile("s", StoreKind::Singleton),
        64,
    );
    let (writer, _) = core.register(DeliveryPolicy::synced(), Capabilities::READ_WRITE);
    let (watcher, _) = core.register(DeliveryPolicy::synced(), Capabilities::READ_ONLY);
    core.on_sync_response(SyncResponse {
        version: 0,
        model: StoreModel::Singleton(None),
    });
    core.take_deliveries();

    let v1 = Entity::new("s", json!("v1"));
    let command = core
        .write(writer, LocalWrite::Set(v1.clone()))
        .unwrap()
        .unwrap();
    let token = match command {
        Command::Write {
            barrier: Some(token),
            ..
        } => token,
        other => panic!("expected an optimistic write, got {:?}", other),
    };
    let delivered = core.take_deliveries();
    assert_eq!(delivered.len(), 2);
    assert!(delivered.iter().all(|d| match &d.notification {
        Notification::Update { originator, .. } => *originator == (d.consumer == writer),
        _ => false,
    }));

    // An unrelated remote write, committed before ours, shows up first.
    let remote = Entity::new("s", json!("remote"));
    core.on_event(event("s", 1, Mutation::Set(remote)));
    assert_eq!(core.fetch(writer).unwrap(), Read::Cached(Some(v1.clone())));
    assert_eq!(core.fetch(watcher).unwrap(), Read::Cached(Some(v1.clone())));
    assert!(core.take_deliveries().is_empty(), "suppressed behind the barrier");

    // Our confirmation: applied silently.
    let mut confirm = event("s", 2, Mutation::Set(v1.clone()));
    confirm.barrier = Some(token.clone());
    core.on_event(confirm);
    core.on_write_ack(Some(&token), WriteAck { version: 2 });
    assert!(core.take_deliveries().is_empty(), "no duplicate notification");
    assert!(core.pending_barrier().is_none());

    // Later remote events are delivered normally.
    let v3 = Entity::new("s", json!("v3"));
    core.on_event(event("s", 3, Mutation::Set(v3.clone())));
    let delivered = updates(&mut core);
    assert_eq!(
        delivered,
        vec![
            Notification::Update {
                change: Change::Singleton(Some(v3.clone())),
                originator: false,
            };
            2
        ]
    );
    assert_eq!(core.fetch(writer).unwrap(), Read::Cached(Some(v3)));
}

// =============================================================================
// 5. Cursor snapshot isolation
// =============================================================================

async fn drain_cursor(
    store: &InMemoryBackingStore,
    cursor: u64,
) -> Result<Vec<String>, StorageError> {
    let mut ids = Vec::new();
    loop {
        let page = store.cursor_next(cursor).await?;
        if page.done {
            assert!(page.items.is_empty());
            return Ok(ids);
        }
        ids.extend(page.items.into_iter().map(|e| e.id.to_string()));
    }
}

#[tokio::test]
async fn test_cursor_snapshot_isolation() {
    let store = InMemoryBackingStore::new();
    let info = StoreInfo::volatile("big", StoreKind::BigCollection);
    store.create_store(info.clone());

    for i in 0..10 {
        store
            .write(
                &info.id,
                WriteOp::Store {
                    entity: entity(&format!("e{}", i)),
                    key: key(&format!("k{}", i)),
                },
                None,
                None,
            )
            .await
            .unwrap();
    }

    let (before, v_before) = store.open_cursor(&info.id, 3, true).await.unwrap();
    assert_eq!(store.cursor_version(before).unwrap(), v_before);

    for id in ["e2", "e5"] {
        store
            .write(
                &info.id,
                WriteOp::Remove {
                    id: EntityId::from(id),
                    keys: Vec::new(),
                },
                None,
                None,
            )
            .await
            .unwrap();
    }
    store
        .write(
            &info.id,
            WriteOp::Store {
                entity: entity("e10"),
                key: key("k10"),
            },
            None,
            None,
        )
        .await
        .unwrap();

    let (after, v_after) = store.open_cursor(&info.id, 3, true).await.unwrap();
    assert_eq!(v_after - v_before, 3);

    let expected_before: Vec<String> = (0..10).map(|i| format!("e{}", i)).collect();
    assert_eq!(drain_cursor(&store, before).await.unwrap(), expected_before);
    assert_eq!(
        drain_cursor(&store, after).await.unwrap(),
        vec!["e0", "e1", "e3", "e4", "e6", "e7", "e8", "e9", "e10"]
    );

    // Exhausted cursors are released.
    assert_eq!(
        store.cursor_version(before),
        Err(StorageError::UnknownCursor(before))
    );
    assert_eq!(store.open_cursors(), 0);
}

#[tokio::test]
async fn test_rewrite_moves_to_tail_and_backward_cursor() {
    let store = InMemoryBackingStore::new();
    let info = StoreInfo::volatile("big", StoreKind::BigCollection);
    store.create_store(info.clone());
    for (id, k) in [("a", "k1"), ("b", "k2"), ("c", "k3"), ("a", "k4")] {
        store
            .write(
                &info.id,
                WriteOp::Store {
                    entity: entity(id),
                    key: key(k),
                },
                None,
                None,
            )
            .await
            .unwrap();
    }

    let (forward, _) = store.open_cursor(&info.id, 10, true).await.unwrap();
    assert_eq!(drain_cursor(&store, forward).await.unwrap(), vec!["b", "c", "a"]);

    let (backward, _) = store.open_cursor(&info.id, 2, false).await.unwrap();
    assert_eq!(drain_cursor(&store, backward).await.unwrap(), vec!["a", "c", "b"]);

    let (closed, _) = store.open_cursor(&info.id, 2, true).await.unwrap();
    store.cursor_close(closed).await.unwrap();
    assert_eq!(
        store.cursor_next(closed).await,
        Err(StorageError::UnknownCursor(closed))
    );
    assert_eq!(
        store.cursor_close(closed).await,
        Err(StorageError::UnknownCursor(closed))
    );
}

// =============================================================================
// 6. Non-readable handles never sync
// =============================================================================

#[test]
fn test_write_only_registration_issues_no_commands() {
    let mut core = ProxyCore::new(
        ProxyId::from("p1"),
        StoreInfo::volatile("c", StoreKind::Collection),
        64,
    );
    let (writer, commands) = core.register(DeliveryPolicy::synced(), Capabilities::WRITE_ONLY);
    assert!(commands.is_empty());
    assert_eq!(core.state(), SyncState::Unsynced);

    let command = core
        .write(
            writer,
            LocalWrite::Store {
                entity: entity("a"),
                key: None,
            },
        )
        .unwrap();
    assert!(matches!(command, Some(Command::Write { barrier: None, .. })));
    assert!(core.value().ids().is_empty(), "nothing cached");
    assert!(matches!(
        core.list(writer),
        Err(StorageError::CapabilityViolation { .. })
    ));
}

#[tokio::test]
async fn test_write_only_handle_never_initializes() {
    let memory = InMemoryBackingStore::new();
    let info = StoreInfo::volatile("c", StoreKind::Collection);
    memory.create_store(info.clone());
    let (proxy, _task) = spawn_proxy(
        ProxyId::from("p1"),
        info,
        Arc::new(memory.clone()),
        &ProxyConfig::default(),
    );

    let writer = proxy
        .register(DeliveryPolicy::synced(), Capabilities::WRITE_ONLY)
        .await
        .unwrap();
    for i in 0..3 {
        proxy.store(writer.id(), entity(&format!("e{}", i))).await.unwrap();
    }
    proxy.remove(writer.id(), EntityId::from("e1")).await.unwrap();
    proxy.idle().await.unwrap();

    let counts = memory.call_counts();
    assert_eq!(counts.initialize, 0);
    assert_eq!(counts.synchronize, 0);
    assert_eq!(counts.write, 4);
    assert_eq!(memory.list(&StoreId::from("c")).await.unwrap().len(), 2);
}

// =============================================================================
// 7. End-to-end desync and resync
// =============================================================================

#[tokio::test]
async fn test_end_to_end_dropped_event_resyncs_both_consumers() {
    let memory = InMemoryBackingStore::new();
    let info = StoreInfo::volatile("items", StoreKind::Collection);
    memory.create_store(info.clone());
    let (proxy, _task) = spawn_proxy(
        ProxyId::from("p1"),
        info.clone(),
        Arc::new(memory.clone()),
        &ProxyConfig::default(),
    );

    let mut reader = proxy
        .register(DeliveryPolicy::synced(), Capabilities::READ_ONLY)
        .await
        .unwrap();
    let mut writer = proxy
        .register(DeliveryPolicy::synced(), Capabilities::READ_WRITE)
        .await
        .unwrap();
    proxy.idle().await.unwrap();

    let v1 = Entity::new("i1", json!("v1"));
    let v2 = Entity::new("i2", json!("v2"));
    let v3 = Entity::new("i3", json!("v3"));

    proxy.store(writer.id(), v1.clone()).await.unwrap();
    proxy.idle().await.unwrap();

    memory.drop_events(1);
    for (e, k) in [(&v2, "remote:k2"), (&v3, "remote:k3")] {
        memory
            .write(
                &info.id,
                WriteOp::Store {
                    entity: e.clone(),
                    key: key(k),
                },
                None,
                None,
            )
            .await
            .unwrap();
    }
    proxy.idle().await.unwrap();

    let expected = |originator: bool| {
        vec![
            Notification::Sync(StoreValue::Collection(Vec::new())),
            Notification::Update {
                change: Change::added(v1.clone()),
                originator,
            },
            Notification::Desync,
            Notification::Sync(StoreValue::Collection(vec![
                v1.clone(),
                v2.clone(),
                v3.clone(),
            ])),
        ]
    };
    assert_eq!(reader.drain(), expected(false));
    assert_eq!(writer.drain(), expected(true));

    assert_eq!(memory.call_counts().dropped_events, 1);
    assert_eq!(memory.call_counts().synchronize, 2);
    assert_eq!(proxy.list(reader.id()).await.unwrap(), vec![v1, v2, v3]);
}
