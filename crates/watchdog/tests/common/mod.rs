#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use darkstar_core::{
    DataStore, RetryPolicyKind, SchedulerConfig, SchedulerError, SchedulerResult, WatchdogConfig,
};
use darkstar_dispatcher::TransactionScheduler;
use darkstar_testing_utils::TestEnv;
use darkstar_watchdog::{check_status_arrays, Node, NodeListener, WatchdogClient, WatchdogServer};

pub const RENEW_INTERVAL_MS: u64 = 100;

pub fn scheduler() -> Arc<TransactionScheduler> {
    Arc::new(TransactionScheduler::from_config(SchedulerConfig {
        consumer_threads: 2,
        retry_policy: RetryPolicyKind::Immediate,
        transaction_timeout_ms: 1000,
        ..Default::default()
    }))
}

pub fn watchdog_config(renew_interval_ms: u64) -> WatchdogConfig {
    WatchdogConfig {
        server_port: 0,
        renew_interval_ms,
        ..Default::default()
    }
}

pub async fn start_server(
    store: Arc<dyn DataStore>,
    scheduler: Arc<TransactionScheduler>,
) -> WatchdogServer {
    WatchdogServer::start(store, scheduler, Some(watchdog_config(RENEW_INTERVAL_MS)))
        .await
        .unwrap()
}

/// 记录收到的所有回调的节点监听器
#[derive(Default)]
pub struct RecordingNodeListener {
    started: Mutex<Vec<Node>>,
    failed: Mutex<Vec<Node>>,
}

impl RecordingNodeListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> Vec<Node> {
        self.started.lock().unwrap().clone()
    }

    pub fn failed(&self) -> Vec<Node> {
        self.failed.lock().unwrap().clone()
    }

    pub async fn wait_for_failed(&self, id: u64, timeout: Duration) -> bool {
        TestEnv::wait_for(
            || async move { self.failed().iter().any(|node| node.id == id) },
            timeout,
        )
        .await
    }

    pub async fn wait_for_started(&self, id: u64, timeout: Duration) -> bool {
        TestEnv::wait_for(
            || async move { self.started().iter().any(|node| node.id == id) },
            timeout,
        )
        .await
    }
}

impl NodeListener for RecordingNodeListener {
    fn node_started(&self, node: &Node) {
        self.started.lock().unwrap().push(node.clone());
    }

    fn node_failed(&self, node: &Node) {
        self.failed.lock().unwrap().push(node.clone());
    }
}

/// 记录服务端推送的状态变化的客户端
#[derive(Default)]
pub struct RecordingWatchdogClient {
    changes: Mutex<Vec<Node>>,
    unreachable: AtomicBool,
}

impl RecordingWatchdogClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// 之后的推送全部失败，模拟节点不可达
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn changes(&self) -> Vec<Node> {
        self.changes.lock().unwrap().clone()
    }

    pub fn saw(&self, id: u64, alive: bool) -> bool {
        self.changes()
            .iter()
            .any(|node| node.id == id && node.alive == alive)
    }

    pub async fn wait_for(&self, id: u64, alive: bool, timeout: Duration) -> bool {
        TestEnv::wait_for(|| async move { self.saw(id, alive) }, timeout).await
    }
}

#[async_trait]
impl WatchdogClient for RecordingWatchdogClient {
    async fn node_status_changes(
        &self,
        ids: &[u64],
        hosts: &[String],
        alive: &[bool],
    ) -> SchedulerResult<()> {
        check_status_arrays(ids, hosts, alive)?;
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(SchedulerError::Network("connection refused".to_string()));
        }

        let mut changes = self.changes.lock().unwrap();
        for ((&id, host), &alive) in ids.iter().zip(hosts).zip(alive) {
            changes.push(Node {
                id,
                host: host.clone(),
                alive,
            });
        }
        Ok(())
    }
}
