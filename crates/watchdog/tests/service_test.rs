mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{scheduler, start_server, watchdog_config, RecordingNodeListener, RENEW_INTERVAL_MS};
use darkstar_core::{DataStore, SchedulerError, SchedulerResult, WatchdogConfig};
use darkstar_infrastructure::MemoryDataStore;
use darkstar_watchdog::{
    node, Node, Registration, WatchdogClient, WatchdogServer, WatchdogServerApi, WatchdogService,
};

fn memory_store() -> Arc<dyn DataStore> {
    Arc::new(MemoryDataStore::new())
}

fn embedded_config() -> WatchdogConfig {
    WatchdogConfig {
        client_host: Some("node-a".to_string()),
        ..watchdog_config(RENEW_INTERVAL_MS)
    }
}

/// 可模拟连接中断的服务端代理，续约失败时返回网络错误
struct UnreachableServer {
    server: Arc<WatchdogServer>,
    down: AtomicBool,
    /// 接下来需要失败的续约次数
    fail_renewals: AtomicUsize,
    renew_calls: AtomicUsize,
}

impl UnreachableServer {
    fn new(server: Arc<WatchdogServer>) -> Arc<Self> {
        Arc::new(Self {
            server,
            down: AtomicBool::new(false),
            fail_renewals: AtomicUsize::new(0),
            renew_calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl WatchdogServerApi for UnreachableServer {
    async fn register_node(
        &self,
        node_id: Option<u64>,
        host: &str,
        client: Arc<dyn WatchdogClient>,
    ) -> SchedulerResult<Registration> {
        self.server.register_node(node_id, host, client).await
    }

    async fn renew_node(&self, node_id: u64) -> SchedulerResult<bool> {
        self.renew_calls.fetch_add(1, Ordering::SeqCst);
        let blip = self
            .fail_renewals
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if blip || self.down.load(Ordering::SeqCst) {
            return Err(SchedulerError::Network("connection reset".to_string()));
        }
        self.server.renew_node(node_id).await
    }

    async fn is_alive(&self, node_id: u64) -> SchedulerResult<bool> {
        self.server.is_alive(node_id).await
    }
}

#[tokio::test]
async fn test_embedded_server_registers_local_node() {
    let service = WatchdogService::start(&embedded_config(), memory_store(), scheduler())
        .await
        .unwrap();
    let id = service.local_node_id();

    assert!(service.server().is_some());
    assert_eq!(service.renew_interval_ms(), RENEW_INTERVAL_MS);
    assert!(service.is_local_node_alive().await.unwrap());
    assert!(service.is_local_node_alive_non_transactional().unwrap());
    assert_eq!(service.get_node(id).await.unwrap(), Some(Node::new(id, "node-a")));
    assert_eq!(service.get_nodes().await.unwrap(), vec![Node::new(id, "node-a")]);

    // 续约使节点在多个续约间隔后仍然存活
    tokio::time::sleep(Duration::from_millis(RENEW_INTERVAL_MS * 4)).await;
    assert!(service.is_node_alive(id).await.unwrap());
    assert!(service.is_local_node_alive().await.unwrap());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_shut_down_service_rejects_calls() {
    let service = WatchdogService::start(&embedded_config(), memory_store(), scheduler())
        .await
        .unwrap();
    service.shutdown().await.unwrap();
    assert!(service.is_shutdown());

    assert!(matches!(
        service.shutdown().await,
        Err(SchedulerError::IllegalState(_))
    ));
    assert!(matches!(
        service.is_local_node_alive().await,
        Err(SchedulerError::IllegalState(_))
    ));
    assert!(matches!(
        service.is_local_node_alive_non_transactional(),
        Err(SchedulerError::IllegalState(_))
    ));
    assert!(matches!(
        service.get_node(1).await,
        Err(SchedulerError::IllegalState(_))
    ));
    assert!(matches!(
        service.add_node_listener(RecordingNodeListener::new()),
        Err(SchedulerError::IllegalState(_))
    ));
}

#[tokio::test]
async fn test_listeners_hear_about_other_nodes() {
    let store = memory_store();
    let scheduler = scheduler();
    let service_a = WatchdogService::start(&embedded_config(), store.clone(), scheduler.clone())
        .await
        .unwrap();
    let listener = RecordingNodeListener::new();
    service_a.add_node_listener(listener.clone()).unwrap();

    let server = service_a.server().unwrap().clone();
    let service_b = WatchdogService::connect(server, "node-b", store, scheduler)
        .await
        .unwrap();
    let b = service_b.local_node_id();

    assert!(listener.wait_for_started(b, Duration::from_secs(1)).await);

    // B 停止续约后被判定失败
    service_b.shutdown().await.unwrap();
    assert!(listener.wait_for_failed(b, Duration::from_secs(2)).await);
    assert!(service_a.is_local_node_alive().await.unwrap());

    // 不会通知本节点自己启动
    let a = service_a.local_node_id();
    assert!(listener.started().iter().all(|node| node.id != a));

    service_a.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_lost_server_marks_local_node_failed() {
    let store = memory_store();
    let scheduler = scheduler();
    let server = Arc::new(start_server(store.clone(), scheduler.clone()).await);
    let proxy = UnreachableServer::new(server.clone());

    let service = WatchdogService::connect(proxy.clone(), "node-a", store, scheduler)
        .await
        .unwrap();
    let listener = RecordingNodeListener::new();
    service.add_node_listener(listener.clone()).unwrap();
    let id = service.local_node_id();

    proxy.down.store(true, Ordering::SeqCst);
    assert!(listener.wait_for_failed(id, Duration::from_secs(2)).await);
    assert!(!service.is_local_node_alive_non_transactional().unwrap());
    assert!(!service.is_local_node_alive().await.unwrap());

    // 本地失败后恢复连接也不会复活
    proxy.down.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(RENEW_INTERVAL_MS * 2)).await;
    assert!(!service.is_local_node_alive_non_transactional().unwrap());
    assert_eq!(listener.failed().len(), 1);

    service.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_server_declared_failure_reaches_local_listeners() {
    let store = memory_store();
    let scheduler = scheduler();
    let server = Arc::new(start_server(store.clone(), scheduler.clone()).await);
    let service = WatchdogService::connect(server.clone(), "node-a", store, scheduler)
        .await
        .unwrap();
    let listener = RecordingNodeListener::new();
    service.add_node_listener(listener.clone()).unwrap();
    let id = service.local_node_id();

    server.shutdown().await.unwrap();
    assert!(listener.wait_for_failed(id, Duration::from_secs(1)).await);
    assert!(!service.is_local_node_alive_non_transactional().unwrap());

    service.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_durable_record_overrides_local_flag() {
    let store = memory_store();
    let scheduler = scheduler();
    let server = Arc::new(start_server(store.clone(), scheduler.clone()).await);
    let service = WatchdogService::connect(server.clone(), "node-a", store.clone(), scheduler)
        .await
        .unwrap();
    let listener = RecordingNodeListener::new();
    service.add_node_listener(listener.clone()).unwrap();
    let id = service.local_node_id();

    node::put_node(store.as_ref(), &Node::failed(id, "node-a"))
        .await
        .unwrap();
    assert!(service.is_local_node_alive_non_transactional().unwrap());
    assert!(!service.is_local_node_alive().await.unwrap());
    assert!(!service.is_local_node_alive_non_transactional().unwrap());
    assert!(listener.wait_for_failed(id, Duration::from_secs(1)).await);

    service.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_start() {
    let config = WatchdogConfig {
        start_server: false,
        server_host: String::new(),
        ..embedded_config()
    };
    let result = WatchdogService::start(&config, memory_store(), scheduler()).await;
    assert!(matches!(result, Err(SchedulerError::Configuration(_))));
}

#[tokio::test]
async fn test_single_renew_failure_recovers_with_short_interval() {
    const SHORT_INTERVAL_MS: u64 = 48;
    let store = memory_store();
    let scheduler = scheduler();
    let server = Arc::new(
        WatchdogServer::start(
            store.clone(),
            scheduler.clone(),
            Some(watchdog_config(SHORT_INTERVAL_MS)),
        )
        .await
        .unwrap(),
    );
    let proxy = UnreachableServer::new(server.clone());
    proxy.fail_renewals.store(1, Ordering::SeqCst);

    let service = WatchdogService::connect(proxy.clone(), "node-a", store, scheduler)
        .await
        .unwrap();
    let listener = RecordingNodeListener::new();
    service.add_node_listener(listener.clone()).unwrap();
    let id = service.local_node_id();

    // 第一次续约失败后提前重试，仍在续约间隔内完成
    tokio::time::sleep(Duration::from_millis(SHORT_INTERVAL_MS * 8)).await;
    assert_eq!(proxy.fail_renewals.load(Ordering::SeqCst), 0);
    assert!(proxy.renew_calls.load(Ordering::SeqCst) >= 5);
    assert!(service.is_local_node_alive_non_transactional().unwrap());
    assert!(server.is_alive(id).await.unwrap());
    assert!(listener.failed().is_empty());

    service.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}
