//! 配置管理
//!
//! 加载顺序：内置默认值 → TOML 配置文件 → 环境变量（前缀 `DARKSTAR_`，层级分隔符 `__`）。

pub mod app_config;
pub mod data_store;
pub mod logging;
pub mod scheduler;
pub mod watchdog;

pub use app_config::AppConfig;
pub use data_store::{DataStoreBackend, DataStoreConfig};
pub use logging::{LogFormat, LoggingConfig};
pub use scheduler::{QueueKind, RetryPolicyKind, SchedulerConfig};
pub use watchdog::{
    WatchdogConfig, DEFAULT_RENEW_INTERVAL_MS, DEFAULT_SERVER_PORT, MAX_RENEW_INTERVAL_MS,
    MIN_RENEW_INTERVAL_MS,
};
