//! 节点看门狗服务
//!
//! 每个节点运行一个服务实例：向服务端注册本节点，按续约间隔的一半续约，
//! 并把服务端推送的节点状态变化以独立任务的形式通知本地监听器。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use darkstar_core::{
    current_time_millis, DataStore, Identity, KernelTask, SchedulerError, SchedulerResult,
    WatchdogConfig,
};
use darkstar_dispatcher::TransactionScheduler;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::{check_status_arrays, NodeListener, WatchdogClient, WatchdogServerApi};
use crate::node::{self, Node};
use crate::server::WatchdogServer;
use crate::transport::{self, HttpEndpoint, RemoteWatchdogServer};
use crate::txn::run_transactional;
use crate::{read, write};

/// 续约出错后重试等待时间的下限
pub const MIN_RENEW_BACKOFF_MS: u64 = 25;

struct ServiceInner {
    host: String,
    store: Arc<dyn DataStore>,
    scheduler: Arc<TransactionScheduler>,
    /// 注册完成后写入本节点ID
    local_node_id: watch::Sender<Option<u64>>,
    alive: AtomicBool,
    listeners: RwLock<Vec<Arc<dyn NodeListener>>>,
    shutdown: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
}

/// 节点看门狗服务
pub struct WatchdogService {
    inner: Arc<ServiceInner>,
    local_node_id: u64,
    renew_interval_ms: u64,
    server: Arc<dyn WatchdogServerApi>,
    embedded_server: Option<Arc<WatchdogServer>>,
    endpoints: Vec<HttpEndpoint>,
    renew_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl WatchdogService {
    /// 按配置启动服务
    ///
    /// `start_server` 为 true 时在本节点启动服务端并对外提供 HTTP 接口；
    /// 否则启动客户端回调端点，通过 HTTP 向远程服务端注册。
    pub async fn start(
        config: &WatchdogConfig,
        store: Arc<dyn DataStore>,
        scheduler: Arc<TransactionScheduler>,
    ) -> SchedulerResult<Self> {
        config
            .validate()
            .map_err(|e| SchedulerError::Configuration(format!("{e:#}")))?;

        let host = match &config.client_host {
            Some(host) => host.clone(),
            None => local_host_name(),
        };
        let inner = ServiceInner::new(host, store.clone(), scheduler.clone());
        let client: Arc<dyn WatchdogClient> = Arc::new(LocalWatchdogClient {
            inner: Arc::downgrade(&inner),
        });

        let mut endpoints = Vec::new();
        let (server, embedded_server): (Arc<dyn WatchdogServerApi>, _) = if config.start_server {
            let embedded =
                Arc::new(WatchdogServer::start(store, scheduler, Some(config.clone())).await?);
            match transport::serve_server(embedded.clone(), "0.0.0.0", config.server_port()).await
            {
                Ok(endpoint) => endpoints.push(endpoint),
                Err(e) => {
                    let _ = embedded.shutdown().await;
                    return Err(e);
                }
            }
            let server: Arc<dyn WatchdogServerApi> = embedded.clone();
            (server, Some(embedded))
        } else {
            let endpoint =
                transport::serve_client(client.clone(), "0.0.0.0", config.client_port()).await?;
            let callback_url = endpoint.url_for_host(&inner.host);
            endpoints.push(endpoint);
            let server_url = format!("http://{}:{}", config.server_host, config.server_port());
            info!("连接远程看门狗服务端: {}", server_url);
            let server: Arc<dyn WatchdogServerApi> =
                Arc::new(RemoteWatchdogServer::new(server_url, callback_url));
            (server, None)
        };

        Self::register(inner, client, server, embedded_server, endpoints).await
    }

    /// 使用已有的服务端（进程内或远程代理）启动服务
    pub async fn connect(
        server: Arc<dyn WatchdogServerApi>,
        host: impl Into<String>,
        store: Arc<dyn DataStore>,
        scheduler: Arc<TransactionScheduler>,
    ) -> SchedulerResult<Self> {
        let inner = ServiceInner::new(host.into(), store, scheduler);
        let client: Arc<dyn WatchdogClient> = Arc::new(LocalWatchdogClient {
            inner: Arc::downgrade(&inner),
        });
        Self::register(inner, client, server, None, Vec::new()).await
    }

    async fn register(
        inner: Arc<ServiceInner>,
        client: Arc<dyn WatchdogClient>,
        server: Arc<dyn WatchdogServerApi>,
        embedded_server: Option<Arc<WatchdogServer>>,
        endpoints: Vec<HttpEndpoint>,
    ) -> SchedulerResult<Self> {
        let registration = match server.register_node(None, &inner.host, client).await {
            Ok(registration) => registration,
            Err(e) => {
                if let Some(embedded) = &embedded_server {
                    let _ = embedded.shutdown().await;
                }
                return Err(e);
            }
        };

        inner.local_node_id.send_replace(Some(registration.node_id));
        inner.alive.store(true, Ordering::SeqCst);
        info!(
            "本节点已注册: id={}, host={}, 续约间隔: {}ms",
            registration.node_id, inner.host, registration.renew_interval_ms
        );

        let renew_task = tokio::spawn(renew_loop(
            inner.clone(),
            server.clone(),
            registration.node_id,
            registration.renew_interval_ms,
            inner.shutdown_tx.subscribe(),
        ));

        Ok(Self {
            inner,
            local_node_id: registration.node_id,
            renew_interval_ms: registration.renew_interval_ms,
            server,
            embedded_server,
            endpoints,
            renew_task: tokio::sync::Mutex::new(Some(renew_task)),
        })
    }

    pub fn local_node_id(&self) -> u64 {
        self.local_node_id
    }

    pub fn renew_interval_ms(&self) -> u64 {
        self.renew_interval_ms
    }

    /// 本节点运行的服务端
    pub fn server(&self) -> Option<&Arc<WatchdogServer>> {
        self.embedded_server.as_ref()
    }

    /// 服务端或客户端回调端点的监听地址
    pub fn endpoints(&self) -> &[HttpEndpoint] {
        &self.endpoints
    }

    /// 本节点是否存活
    ///
    /// 同时核对本地标记与存储中的节点记录。记录缺失或已失败时以失败为准，
    /// 本地标记随之置为失败并通知监听器。
    pub async fn is_local_node_alive(&self) -> SchedulerResult<bool> {
        self.inner.check_state()?;
        if !self.inner.is_alive() {
            return Ok(false);
        }

        let record = self.get_node(self.local_node_id).await?;
        if record.as_ref().is_some_and(Node::is_alive) {
            return Ok(true);
        }
        warn!("存储中的本节点记录 {} 已失败，本地状态随之失败", self.local_node_id);
        self.inner.set_failed_then_notify();
        Ok(false)
    }

    /// 只检查本地标记
    pub fn is_local_node_alive_non_transactional(&self) -> SchedulerResult<bool> {
        self.inner.check_state()?;
        Ok(self.inner.is_alive())
    }

    pub async fn get_node(&self, node_id: u64) -> SchedulerResult<Option<Node>> {
        self.inner.check_state()?;
        let store = self.inner.store.clone();
        run_transactional(&self.inner.scheduler, "GetNode", move || {
            let store = store.clone();
            async move { node::get_node(store.as_ref(), node_id).await }
        })
        .await
    }

    /// 存储中的所有节点，按ID升序
    pub async fn get_nodes(&self) -> SchedulerResult<Vec<Node>> {
        self.inner.check_state()?;
        let store = self.inner.store.clone();
        run_transactional(&self.inner.scheduler, "GetNodes", move || {
            let store = store.clone();
            async move { node::get_nodes(store.as_ref()).await }
        })
        .await
    }

    pub fn add_node_listener(&self, listener: Arc<dyn NodeListener>) -> SchedulerResult<()> {
        self.inner.check_state()?;
        write(&self.inner.listeners).push(listener);
        Ok(())
    }

    /// 服务端当前是否认为指定节点存活
    pub async fn is_node_alive(&self, node_id: u64) -> SchedulerResult<bool> {
        self.inner.check_state()?;
        self.server.is_alive(node_id).await
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// 停止续约，关闭本节点的 HTTP 端点和服务端
    pub async fn shutdown(&self) -> SchedulerResult<()> {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::illegal_state("看门狗服务已关闭"));
        }

        info!("正在关闭看门狗服务");
        let _ = self.inner.shutdown_tx.send(true);
        if let Some(task) = self.renew_task.lock().await.take() {
            if let Err(e) = task.await {
                warn!("续约任务异常退出: {}", e);
            }
        }

        for endpoint in &self.endpoints {
            endpoint.stop();
        }
        if let Some(server) = &self.embedded_server {
            server.shutdown().await?;
        }
        info!("看门狗服务已关闭");
        Ok(())
    }
}

impl ServiceInner {
    fn new(
        host: String,
        store: Arc<dyn DataStore>,
        scheduler: Arc<TransactionScheduler>,
    ) -> Arc<Self> {
        let (local_node_id, _) = watch::channel(None);
        let (shutdown_tx, _) = watch::channel(false);
        Arc::new(Self {
            host,
            store,
            scheduler,
            local_node_id,
            alive: AtomicBool::new(false),
            listeners: RwLock::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            shutdown_tx,
        })
    }

    fn check_state(&self) -> SchedulerResult<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(SchedulerError::illegal_state("看门狗服务已关闭"));
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn current_node_id(&self) -> Option<u64> {
        *self.local_node_id.borrow()
    }

    /// 本地标记置为失败，仅第一次调用通知监听器
    fn set_failed_then_notify(self: &Arc<Self>) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(id) = self.current_node_id() else {
            return;
        };
        error!("本节点 {} 已失败", id);
        self.notify_node_listeners(Node::failed(id, self.host.clone()));
    }

    /// 每个监听器的通知作为独立任务调度，不在调用线程上执行
    fn notify_node_listeners(self: &Arc<Self>, node: Node) {
        let listeners: Vec<Arc<dyn NodeListener>> = read(&self.listeners).clone();
        for listener in listeners {
            let service = Arc::downgrade(self);
            let node_id = node.id;
            let node = node.clone();
            let runnable = KernelTask::new("NotifyNodeListener", move || {
                let service = service.clone();
                let listener = listener.clone();
                let node = node.clone();
                async move {
                    let Some(service) = service.upgrade() else {
                        return Ok(());
                    };
                    let is_local = service.current_node_id() == Some(node.id);
                    if service.is_shutdown() || !(service.is_alive() || is_local) {
                        return Ok(());
                    }
                    if node.alive {
                        listener.node_started(&node);
                    } else {
                        listener.node_failed(&node);
                    }
                    Ok(())
                }
            })
            .into_runnable();

            if let Err(e) = self
                .scheduler
                .schedule_task(runnable, Identity::new("watchdog"))
            {
                warn!("调度节点 {} 的监听器通知失败: {}", node_id, e);
            }
        }
    }

    async fn wait_for_registration(&self, timeout: Duration) -> Option<u64> {
        let mut rx = self.local_node_id.subscribe();
        let registered = tokio::time::timeout(timeout, rx.wait_for(Option::is_some)).await;
        match registered {
            Ok(Ok(id)) => *id,
            _ => None,
        }
    }
}

/// 进程内客户端，接收服务端推送的状态变化
struct LocalWatchdogClient {
    inner: Weak<ServiceInner>,
}

#[async_trait]
impl WatchdogClient for LocalWatchdogClient {
    async fn node_status_changes(
        &self,
        ids: &[u64],
        hosts: &[String],
        alive: &[bool],
    ) -> SchedulerResult<()> {
        check_status_arrays(ids, hosts, alive)?;
        let Some(inner) = self.inner.upgrade() else {
            return Ok(());
        };
        if inner.is_shutdown() {
            return Ok(());
        }

        // 注册响应可能晚于第一次推送到达
        let Some(local_id) = inner
            .wait_for_registration(Duration::from_secs(5))
            .await
        else {
            warn!("本节点尚未完成注册，忽略 {} 个节点状态变化", ids.len());
            return Ok(());
        };

        for ((&id, host), &is_alive) in ids.iter().zip(hosts).zip(alive) {
            if id == local_id {
                if !is_alive {
                    inner.set_failed_then_notify();
                }
                continue;
            }
            debug!("节点 {} ({}) 状态变化: alive={}", id, host, is_alive);
            inner.notify_node_listeners(Node {
                id,
                host: host.clone(),
                alive: is_alive,
            });
        }
        Ok(())
    }
}

async fn renew_loop(
    inner: Arc<ServiceInner>,
    server: Arc<dyn WatchdogServerApi>,
    node_id: u64,
    renew_interval_ms: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let start_wait = (renew_interval_ms / 2).max(1);
    let min_wait = renew_backoff_floor(start_wait);
    let mut next_wait = start_wait;
    let mut last_renew = current_time_millis();

    while inner.is_alive() {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(next_wait)) => {}
            _ = shutdown_rx.changed() => return,
        }
        if inner.is_shutdown() {
            return;
        }

        let mut renewed = false;
        match server.renew_node(node_id).await {
            Ok(true) => {
                renewed = true;
                next_wait = start_wait;
            }
            Ok(false) => {
                error!("服务端已判定本节点 {} 失败", node_id);
                inner.set_failed_then_notify();
                break;
            }
            Err(e) => {
                info!("向看门狗服务端续约失败: {}", e);
                next_wait = (next_wait / 2).max(min_wait);
            }
        }

        let now = current_time_millis();
        if now - last_renew > renew_interval_ms as i64 {
            error!(
                "本节点 {} 已 {}ms 未成功续约，超过续约间隔 {}ms",
                node_id,
                now - last_renew,
                renew_interval_ms
            );
            inner.set_failed_then_notify();
            break;
        }
        if renewed {
            last_renew = now;
        }
    }
    debug!("续约任务已退出");
}

/// 续约出错后的最短等待，不超过正常等待的一半，保证重试总是早于正常续约
fn renew_backoff_floor(start_wait: u64) -> u64 {
    MIN_RENEW_BACKOFF_MS.min(start_wait / 2).max(1)
}

fn local_host_name() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .unwrap_or_else(|| "localhost".to_string())
}
