mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{scheduler, start_server, RecordingWatchdogClient, RENEW_INTERVAL_MS};
use darkstar_core::{DataStore, SchedulerError};
use darkstar_infrastructure::MemoryDataStore;
use darkstar_testing_utils::{MockDataStore, TestEnv};
use darkstar_watchdog::{node, Node, WatchdogServer, WatchdogServerApi};

fn memory_store() -> Arc<dyn DataStore> {
    Arc::new(MemoryDataStore::new())
}

/// 每 30ms 续约一次，直到 `stop` 被置位
fn spawn_renewer(server: Arc<WatchdogServer>, id: u64, stop: Arc<AtomicBool>) {
    tokio::spawn(async move {
        while !stop.load(Ordering::SeqCst) {
            let _ = server.renew_node(id).await;
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    });
}

#[tokio::test]
async fn test_register_requested_id_and_reject_duplicate() {
    let server = start_server(memory_store(), scheduler()).await;
    let client = RecordingWatchdogClient::new();

    let registration = server
        .register_node(Some(7), "host-a", client.clone())
        .await
        .unwrap();
    assert_eq!(registration.node_id, 7);
    assert_eq!(registration.renew_interval_ms, RENEW_INTERVAL_MS);
    assert!(server.is_alive(7).await.unwrap());

    let err = server
        .register_node(Some(7), "host-a", client)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::NodeAlreadyRegistered { id: 7 }));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_assigned_ids_are_unique() {
    let server = start_server(memory_store(), scheduler()).await;
    let client = RecordingWatchdogClient::new();

    let first = server.register_node(None, "a", client.clone()).await.unwrap();
    let second = server.register_node(None, "b", client).await.unwrap();
    assert_ne!(first.node_id, second.node_id);
    assert_eq!(server.alive_node_count(), 2);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unrenewed_node_fails_permanently() {
    let store = memory_store();
    let server = start_server(store.clone(), scheduler()).await;
    let client = RecordingWatchdogClient::new();
    server
        .register_node(Some(7), "host-a", client.clone())
        .await
        .unwrap();

    assert!(
        TestEnv::wait_for(
            || async { !server.is_alive(7).await.unwrap() },
            Duration::from_millis(RENEW_INTERVAL_MS * 10),
        )
        .await
    );
    assert!(!server.renew_node(7).await.unwrap());

    tokio::time::sleep(Duration::from_millis(RENEW_INTERVAL_MS)).await;
    assert!(!server.is_alive(7).await.unwrap());

    // 失败状态最终写入存储
    assert!(
        TestEnv::wait_for(
            || async {
                node::get_node(store.as_ref(), 7)
                    .await
                    .unwrap()
                    .is_some_and(|node| !node.alive)
            },
            Duration::from_secs(1),
        )
        .await
    );

    // 已失败的ID被新ID取代
    let registration = server
        .register_node(Some(7), "host-a", client)
        .await
        .unwrap();
    assert_ne!(registration.node_id, 7);
    assert!(server.is_alive(registration.node_id).await.unwrap());
    assert!(!server.is_alive(7).await.unwrap());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_renewal_keeps_node_alive() {
    let server = Arc::new(start_server(memory_store(), scheduler()).await);
    let client = RecordingWatchdogClient::new();
    let id = server
        .register_node(None, "host-a", client)
        .await
        .unwrap()
        .node_id;

    let stop = Arc::new(AtomicBool::new(false));
    spawn_renewer(server.clone(), id, stop.clone());

    tokio::time::sleep(Duration::from_millis(RENEW_INTERVAL_MS * 4)).await;
    assert!(server.is_alive(id).await.unwrap());

    stop.store(true, Ordering::SeqCst);
    assert!(
        TestEnv::wait_for(
            || async { !server.is_alive(id).await.unwrap() },
            Duration::from_millis(RENEW_INTERVAL_MS * 10),
        )
        .await
    );

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_unknown_node_is_not_alive() {
    let server = start_server(memory_store(), scheduler()).await;
    assert!(!server.is_alive(42).await.unwrap());
    assert!(!server.renew_node(42).await.unwrap());
    assert!(!server.ping(42).await.unwrap());
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failed_persistence_rolls_back_registration() {
    let store = MockDataStore::new();
    let server = start_server(store.clone(), scheduler()).await;
    let client = RecordingWatchdogClient::new();

    store.set_fail_all(true);
    let err = server
        .register_node(None, "host-a", client.clone())
        .await
        .unwrap_err();
    let id = match err {
        SchedulerError::NodeRegistrationFailed { id, .. } => id,
        other => panic!("unexpected error: {other}"),
    };
    assert!(!server.is_alive(id).await.unwrap());
    assert_eq!(server.alive_node_count(), 0);
    assert!(!store.snapshot().contains_key(&Node::key(id)));

    store.set_fail_all(false);
    let registration = server.register_node(None, "host-a", client).await.unwrap();
    assert!(server.is_alive(registration.node_id).await.unwrap());

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_store_failure_is_retried() {
    let store = MockDataStore::new();
    let server = start_server(store.clone(), scheduler()).await;

    store.fail_next_commits(2);
    let registration = server
        .register_node(None, "host-a", RecordingWatchdogClient::new())
        .await
        .unwrap();

    let record = node::get_node(store.as_ref(), registration.node_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record, Node::new(registration.node_id, "host-a"));

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_startup_marks_persisted_nodes_failed() {
    let store = memory_store();
    node::put_node(store.as_ref(), &Node::new(3, "old-a")).await.unwrap();
    node::put_node(store.as_ref(), &Node::new(5, "old-b")).await.unwrap();

    let server = start_server(store.clone(), scheduler()).await;
    let nodes = node::get_nodes(store.as_ref()).await.unwrap();
    assert_eq!(nodes, vec![Node::failed(3, "old-a"), Node::failed(5, "old-b")]);

    // 新ID从最大的历史ID之后开始
    let client = RecordingWatchdogClient::new();
    let registration = server
        .register_node(None, "host-a", client.clone())
        .await
        .unwrap();
    assert_eq!(registration.node_id, 6);

    // 历史节点的失败在第一个节点注册后推送
    assert!(client.wait_for(3, false, Duration::from_secs(1)).await);
    assert!(client.wait_for(5, false, Duration::from_secs(1)).await);
    assert!(client.wait_for(6, true, Duration::from_secs(1)).await);

    // 历史ID不会被重新使用
    let registration = server
        .register_node(Some(3), "old-a", client)
        .await
        .unwrap();
    assert_eq!(registration.node_id, 7);

    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_clients_notified_of_started_and_failed_nodes() {
    let server = Arc::new(start_server(memory_store(), scheduler()).await);
    let watcher = RecordingWatchdogClient::new();
    let unreachable = RecordingWatchdogClient::new();
    unreachable.set_unreachable(true);

    let watcher_id = server
        .register_node(None, "watcher", watcher.clone())
        .await
        .unwrap()
        .node_id;
    let stop = Arc::new(AtomicBool::new(false));
    spawn_renewer(server.clone(), watcher_id, stop.clone());

    let flaky_id = server
        .register_node(None, "flaky", unreachable.clone())
        .await
        .unwrap()
        .node_id;

    assert!(watcher.wait_for(flaky_id, true, Duration::from_secs(1)).await);
    assert!(watcher.wait_for(flaky_id, false, Duration::from_secs(2)).await);
    assert!(unreachable.changes().is_empty());
    assert!(server.is_alive(watcher_id).await.unwrap());

    stop.store(true, Ordering::SeqCst);
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shutdown_fails_alive_nodes_and_rejects_calls() {
    let store = memory_store();
    let server = start_server(store.clone(), scheduler()).await;
    let client = RecordingWatchdogClient::new();
    let id = server
        .register_node(None, "host-a", client.clone())
        .await
        .unwrap()
        .node_id;

    server.shutdown().await.unwrap();
    assert!(client.saw(id, false));
    assert_eq!(
        node::get_node(store.as_ref(), id).await.unwrap(),
        Some(Node::failed(id, "host-a"))
    );

    assert!(matches!(
        server.shutdown().await,
        Err(SchedulerError::IllegalState(_))
    ));
    assert!(matches!(
        server.register_node(None, "host-b", client).await,
        Err(SchedulerError::IllegalState(_))
    ));
    assert!(matches!(
        server.renew_node(id).await,
        Err(SchedulerError::IllegalState(_))
    ));
}

#[tokio::test]
async fn test_invalid_renew_interval_rejected() {
    let result = WatchdogServer::start(
        memory_store(),
        scheduler(),
        Some(common::watchdog_config(1)),
    )
    .await;
    assert!(matches!(result, Err(SchedulerError::InvalidArgument(_))));
}
