//! 看门狗服务端
//!
//! 集群中唯一的节点存活仲裁者。节点注册后必须在续约间隔内续约，
//! 后台清扫任务把过期未续约的节点标记为失败并持久化，通知任务把状态变化
//! 推送给所有存活节点的客户端。
//!
//! 节点表与按过期时间排序的索引分别加锁：续约和清扫以不同频率访问两者，
//! 且索引的排序键（过期时间）只能在持有索引锁时修改。加锁顺序固定为
//! 节点状态锁在前、索引锁在后。

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use darkstar_core::{
    current_time_millis, DataStore, SchedulerError, SchedulerResult, WatchdogConfig,
    MAX_RENEW_INTERVAL_MS, MIN_RENEW_INTERVAL_MS,
};
use darkstar_dispatcher::TransactionScheduler;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{split_status_arrays, Registration, WatchdogClient, WatchdogServerApi};
use crate::node::{self, Node};
use crate::txn::run_transactional;
use crate::{lock, read, write};

struct NodeState {
    alive: bool,
    expiration: i64,
}

struct ServerNode {
    id: u64,
    host: String,
    client: Arc<dyn WatchdogClient>,
    state: Mutex<NodeState>,
}

impl ServerNode {
    fn is_alive_at(&self, now: i64) -> bool {
        let state = lock(&self.state);
        state.alive && state.expiration > now
    }

    fn is_marked_alive(&self) -> bool {
        lock(&self.state).alive
    }

    fn snapshot(&self) -> Node {
        Node {
            id: self.id,
            host: self.host.clone(),
            alive: self.is_marked_alive(),
        }
    }
}

struct ServerInner {
    store: Arc<dyn DataStore>,
    scheduler: Arc<TransactionScheduler>,
    renew_interval_ms: u64,
    nodes: RwLock<HashMap<u64, Arc<ServerNode>>>,
    /// 正在持久化的注册
    pending: Mutex<BTreeSet<u64>>,
    expirations: Mutex<BTreeSet<(i64, u64)>>,
    status_changes: Mutex<VecDeque<Node>>,
    /// 内存中已失败但失败状态尚未写入存储的节点
    unpersisted_failures: Mutex<BTreeSet<u64>>,
    status_notify: Notify,
    sweep_notify: Notify,
    next_id: AtomicU64,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// 看门狗服务端
pub struct WatchdogServer {
    inner: Arc<ServerInner>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl WatchdogServer {
    /// 启动服务端
    ///
    /// 先把存储中的所有节点标记为失败（上一次运行留下的节点不可能仍然存活），
    /// 新ID从最大的已持久化ID之后开始分配，然后启动清扫和通知任务。
    pub async fn start(
        store: Arc<dyn DataStore>,
        scheduler: Arc<TransactionScheduler>,
        config: Option<WatchdogConfig>,
    ) -> SchedulerResult<Self> {
        let config = config.unwrap_or_default();
        let renew_interval_ms = config.renew_interval_ms;
        if !(MIN_RENEW_INTERVAL_MS..=MAX_RENEW_INTERVAL_MS).contains(&renew_interval_ms) {
            return Err(SchedulerError::InvalidArgument(format!(
                "续约间隔超出范围: {renew_interval_ms}ms"
            )));
        }

        let recovery_store = store.clone();
        let recovered = run_transactional(&scheduler, "MarkAllNodesFailed", move || {
            let store = recovery_store.clone();
            async move { node::mark_all_nodes_failed(store.as_ref()).await }
        })
        .await?;
        let next_id = recovered.iter().map(|node| node.id).max().unwrap_or(0) + 1;
        if !recovered.is_empty() {
            info!(
                "恢复 {} 个历史节点并标记为失败，新节点ID从 {} 开始",
                recovered.len(),
                next_id
            );
        }

        let (shutdown_tx, _) = watch::channel(false);
        let inner = Arc::new(ServerInner {
            store,
            scheduler,
            renew_interval_ms,
            nodes: RwLock::new(HashMap::new()),
            pending: Mutex::new(BTreeSet::new()),
            expirations: Mutex::new(BTreeSet::new()),
            status_changes: Mutex::new(recovered.into_iter().collect()),
            unpersisted_failures: Mutex::new(BTreeSet::new()),
            status_notify: Notify::new(),
            sweep_notify: Notify::new(),
            next_id: AtomicU64::new(next_id),
            shutdown: AtomicBool::new(false),
            shutdown_tx,
        });

        let tasks = vec![
            tokio::spawn(sweep_loop(inner.clone(), inner.shutdown_tx.subscribe())),
            tokio::spawn(notify_loop(inner.clone(), inner.shutdown_tx.subscribe())),
        ];
        info!("看门狗服务端已启动，续约间隔: {}ms", renew_interval_ms);

        Ok(Self {
            inner,
            tasks: tokio::sync::Mutex::new(tasks),
        })
    }

    pub fn renew_interval_ms(&self) -> u64 {
        self.inner.renew_interval_ms
    }

    /// 当前存活的节点数
    pub fn alive_node_count(&self) -> usize {
        let now = current_time_millis();
        read(&self.inner.nodes)
            .values()
            .filter(|node| node.is_alive_at(now))
            .count()
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// 关闭服务端
    ///
    /// 停止后台任务，把仍存活的节点标记为失败并持久化，最后通知这些节点。
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::illegal_state("看门狗服务端已关闭"));
        }

        info!("正在关闭看门狗服务端");
        let _ = self.inner.shutdown_tx.send(true);
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!("看门狗后台任务异常退出: {}", e);
            }
        }

        let survivors: Vec<Arc<ServerNode>> = read(&self.inner.nodes)
            .values()
            .filter(|node| node.is_marked_alive())
            .cloned()
            .collect();
        let mut changed = Vec::with_capacity(survivors.len());
        for node in &survivors {
            if self.inner.fail_node(node) {
                changed.push(node.snapshot());
            }
        }
        lock(&self.inner.status_changes).clear();
        self.inner.persist_failures().await;

        if !changed.is_empty() {
            let clients: Vec<_> = survivors.iter().map(|node| node.client.clone()).collect();
            notify_clients(&clients, &changed).await;
        }
        info!("看门狗服务端已关闭，{} 个节点被标记为失败", changed.len());
        Ok(())
    }
}

impl ServerInner {
    fn ensure_running(&self) -> SchedulerResult<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(SchedulerError::illegal_state("看门狗服务端已关闭"));
        }
        Ok(())
    }

    fn expiration_from(&self, now: i64) -> i64 {
        now + self.renew_interval_ms as i64
    }

    /// 在内存中把节点标记为失败，返回本次调用是否改变了状态
    fn fail_node(&self, node: &ServerNode) -> bool {
        {
            let mut state = lock(&node.state);
            if !state.alive {
                return false;
            }
            state.alive = false;
            lock(&self.expirations).remove(&(state.expiration, node.id));
        }
        lock(&self.unpersisted_failures).insert(node.id);
        true
    }

    /// 把失败状态写入存储，失败时保留到下一次清扫重试
    async fn persist_failures(&self) {
        let ids: Vec<u64> = lock(&self.unpersisted_failures).iter().copied().collect();
        if ids.is_empty() {
            return;
        }

        let store = self.store.clone();
        let batch = ids.clone();
        let result = run_transactional(&self.scheduler, "MarkNodesFailed", move || {
            let store = store.clone();
            let batch = batch.clone();
            async move {
                for id in batch {
                    node::mark_node_failed(store.as_ref(), id).await?;
                }
                Ok::<(), SchedulerError>(())
            }
        })
        .await;

        match result {
            Ok(()) => {
                let mut unpersisted = lock(&self.unpersisted_failures);
                for id in &ids {
                    unpersisted.remove(id);
                }
                debug!("已持久化 {} 个节点的失败状态", ids.len());
            }
            Err(e) => warn!("持久化节点失败状态出错，将在下次清扫时重试: {}", e),
        }
    }

    /// 找出过期节点并标记为失败
    fn sweep_expired(&self, now: i64) -> Vec<Node> {
        let expired: Vec<(i64, u64)> = {
            let mut expirations = lock(&self.expirations);
            let mut expired = Vec::new();
            while let Some(&(expiration, id)) = expirations.first() {
                if expiration > now {
                    break;
                }
                expirations.remove(&(expiration, id));
                expired.push((expiration, id));
            }
            expired
        };

        let mut failed = Vec::new();
        for (_, id) in expired {
            let Some(node) = read(&self.nodes).get(&id).cloned() else {
                continue;
            };
            // 索引项被取出后节点可能已续约并重新入队
            if lock(&node.state).expiration > now {
                continue;
            }
            if self.fail_node(&node) {
                warn!("节点 {} ({}) 续约超时，标记为失败", node.id, node.host);
                failed.push(node.snapshot());
            }
        }
        failed
    }

    fn next_sweep_delay(&self, now: i64) -> Duration {
        let interval = self.renew_interval_ms as i64;
        let millis = match lock(&self.expirations).first() {
            Some(&(expiration, _)) => (expiration - now).clamp(1, interval),
            None => interval,
        };
        Duration::from_millis(millis as u64)
    }

    fn push_status_changes(&self, nodes: impl IntoIterator<Item = Node>) {
        let mut changes = lock(&self.status_changes);
        let before = changes.len();
        changes.extend(nodes);
        if changes.len() > before {
            self.status_notify.notify_one();
        }
    }

    fn alive_clients(&self) -> Vec<Arc<dyn WatchdogClient>> {
        read(&self.nodes)
            .values()
            .filter(|node| node.is_marked_alive())
            .map(|node| node.client.clone())
            .collect()
    }

    async fn persisted_node_exists(&self, id: u64) -> SchedulerResult<bool> {
        let store = self.store.clone();
        run_transactional(&self.scheduler, "CheckNodeRecord", move || {
            let store = store.clone();
            async move {
                let record = node::get_node(store.as_ref(), id).await?;
                Ok::<bool, SchedulerError>(record.is_some())
            }
        })
        .await
    }

    /// 选定本次注册使用的ID并在持久化期间占住它
    fn claim_id(&self, requested: Option<u64>, persisted: bool) -> SchedulerResult<u64> {
        let now = current_time_millis();
        let nodes = read(&self.nodes);
        let mut pending = lock(&self.pending);

        let id = match requested {
            Some(id) => {
                let alive = nodes.get(&id).is_some_and(|node| node.is_alive_at(now));
                if alive || pending.contains(&id) {
                    return Err(SchedulerError::NodeAlreadyRegistered { id });
                }
                if nodes.contains_key(&id) || persisted {
                    let fresh = self.next_id.fetch_add(1, Ordering::SeqCst);
                    info!("节点 {} 已失败，使用新ID {} 重新注册", id, fresh);
                    fresh
                } else {
                    self.next_id.fetch_max(id + 1, Ordering::SeqCst);
                    id
                }
            }
            None => self.next_id.fetch_add(1, Ordering::SeqCst),
        };
        pending.insert(id);
        Ok(id)
    }
}

#[async_trait]
impl WatchdogServerApi for WatchdogServer {
    async fn register_node(
        &self,
        node_id: Option<u64>,
        host: &str,
        client: Arc<dyn WatchdogClient>,
    ) -> SchedulerResult<Registration> {
        let inner = &self.inner;
        inner.ensure_running()?;
        if host.is_empty() {
            return Err(SchedulerError::InvalidArgument("主机名不能为空".to_string()));
        }

        let persisted = match node_id {
            Some(id) => inner.persisted_node_exists(id).await?,
            None => false,
        };
        let id = inner.claim_id(node_id, persisted)?;

        let record = Node::new(id, host);
        let store = inner.store.clone();
        let to_store = record.clone();
        let stored = run_transactional(&inner.scheduler, "StoreNewNode", move || {
            let store = store.clone();
            let node = to_store.clone();
            async move { node::put_node(store.as_ref(), &node).await }
        })
        .await;

        if let Err(e) = stored {
            lock(&inner.pending).remove(&id);
            warn!("节点 {} ({}) 注册失败: {}", id, host, e);
            return Err(SchedulerError::NodeRegistrationFailed {
                id,
                message: e.to_string(),
            });
        }

        let expiration = inner.expiration_from(current_time_millis());
        let server_node = Arc::new(ServerNode {
            id,
            host: host.to_string(),
            client,
            state: Mutex::new(NodeState {
                alive: true,
                expiration,
            }),
        });
        write(&inner.nodes).insert(id, server_node);
        lock(&inner.expirations).insert((expiration, id));
        lock(&inner.pending).remove(&id);

        inner.push_status_changes([record]);
        inner.sweep_notify.notify_one();
        info!("节点 {} ({}) 已注册", id, host);

        Ok(Registration {
            node_id: id,
            renew_interval_ms: inner.renew_interval_ms,
        })
    }

    async fn renew_node(&self, node_id: u64) -> SchedulerResult<bool> {
        let inner = &self.inner;
        inner.ensure_running()?;
        let Some(node) = read(&inner.nodes).get(&node_id).cloned() else {
            return Ok(false);
        };

        let now = current_time_millis();
        let mut state = lock(&node.state);
        if !state.alive || state.expiration <= now {
            return Ok(false);
        }

        let expiration = inner.expiration_from(now);
        let mut expirations = lock(&inner.expirations);
        expirations.remove(&(state.expiration, node_id));
        state.expiration = expiration;
        expirations.insert((expiration, node_id));
        Ok(true)
    }

    async fn is_alive(&self, node_id: u64) -> SchedulerResult<bool> {
        self.inner.ensure_running()?;
        let now = current_time_millis();
        Ok(read(&self.inner.nodes)
            .get(&node_id)
            .is_some_and(|node| node.is_alive_at(now)))
    }
}

async fn sweep_loop(inner: Arc<ServerInner>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        let now = current_time_millis();
        let failed = inner.sweep_expired(now);
        inner.persist_failures().await;
        inner.push_status_changes(failed);

        let delay = inner.next_sweep_delay(current_time_millis());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = inner.sweep_notify.notified() => {}
            _ = shutdown_rx.changed() => break,
        }
    }
    debug!("节点过期清扫任务已退出");
}

async fn notify_loop(inner: Arc<ServerInner>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = inner.status_notify.notified() => {}
            _ = shutdown_rx.changed() => break,
        }

        // 没有存活节点时保留变更，交给下一个注册的节点
        let clients = inner.alive_clients();
        if clients.is_empty() {
            continue;
        }
        let changed: Vec<Node> = lock(&inner.status_changes).drain(..).collect();
        if changed.is_empty() {
            continue;
        }
        notify_clients(&clients, &changed).await;
    }
    debug!("节点状态通知任务已退出");
}

async fn notify_clients(clients: &[Arc<dyn WatchdogClient>], changed: &[Node]) {
    let (ids, hosts, alive) = split_status_arrays(changed);
    let calls = clients
        .iter()
        .map(|client| client.node_status_changes(&ids, &hosts, &alive));
    for result in futures::future::join_all(calls).await {
        if let Err(e) = result {
            warn!("推送节点状态变化失败: {}", e);
        }
    }
    debug!("已向 {} 个客户端推送 {} 个节点状态变化", clients.len(), changed.len());
}
