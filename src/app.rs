use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use darkstar_core::{AppConfig, DataStore};
use darkstar_dispatcher::TransactionScheduler;
use darkstar_infrastructure::create_data_store;
use darkstar_watchdog::WatchdogService;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// 状态日志的输出间隔
const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// 主应用程序
///
/// 依次组装数据存储、事务调度器和看门狗服务，关闭时按相反顺序停止。
pub struct Application {
    config: AppConfig,
    store: Arc<dyn DataStore>,
    scheduler: Arc<TransactionScheduler>,
    watchdog: WatchdogService,
}

impl Application {
    /// 创建新的应用实例
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序");

        let store = create_data_store(&config.data_store)
            .await
            .context("创建数据存储失败")?;

        let scheduler = Arc::new(TransactionScheduler::from_config(config.scheduler.clone()));

        let watchdog = match WatchdogService::start(
            &config.watchdog,
            Arc::clone(&store),
            Arc::clone(&scheduler),
        )
        .await
        {
            Ok(watchdog) => watchdog,
            Err(e) => {
                if let Err(shutdown_err) = scheduler.shutdown().await {
                    warn!("关闭事务调度器失败: {shutdown_err}");
                }
                return Err(e).context("启动看门狗服务失败");
            }
        };

        for endpoint in watchdog.endpoints() {
            debug!("{}监听地址: {}", endpoint.name(), endpoint.local_addr());
        }

        Ok(Self {
            config,
            store,
            scheduler,
            watchdog,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DataStore> {
        &self.store
    }

    pub fn scheduler(&self) -> &Arc<TransactionScheduler> {
        &self.scheduler
    }

    pub fn watchdog(&self) -> &WatchdogService {
        &self.watchdog
    }

    /// 运行应用直到收到关闭信号，然后依次关闭看门狗服务和调度器
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.log_status();
                }
                _ = shutdown_rx.recv() => {
                    info!("收到关闭信号，停止应用组件");
                    break;
                }
            }
        }

        self.shutdown().await
    }

    fn log_status(&self) {
        match self.watchdog.is_local_node_alive_non_transactional() {
            Ok(true) => debug!(
                "节点 {} 存活，就绪任务: {}，等待中的依赖任务: {}",
                self.watchdog.local_node_id(),
                self.scheduler.ready_count(),
                self.scheduler.waiting_dependents()
            ),
            Ok(false) => warn!("本节点 {} 已被判定失败", self.watchdog.local_node_id()),
            Err(e) => debug!("看门狗服务不可用: {e}"),
        }
    }

    /// 关闭所有组件
    ///
    /// 看门狗服务先于调度器关闭，因为监听器通知依赖调度器执行。
    pub async fn shutdown(&self) -> Result<()> {
        let mut first_error = None;

        if !self.watchdog.is_shutdown() {
            if let Err(e) = self.watchdog.shutdown().await {
                error!("关闭看门狗服务失败: {e}");
                first_error.get_or_insert(anyhow::Error::new(e).context("关闭看门狗服务失败"));
            } else {
                info!("看门狗服务已关闭");
            }
        }

        if !self.scheduler.is_shutdown() {
            if let Err(e) = self.scheduler.shutdown().await {
                error!("关闭事务调度器失败: {e}");
                first_error.get_or_insert(anyhow::Error::new(e).context("关闭事务调度器失败"));
            } else {
                info!("事务调度器已关闭");
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
