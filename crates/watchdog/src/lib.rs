//! # Darkstar Watchdog
//!
//! 集群节点存活检测。
//!
//! - [`WatchdogServer`]: 全局唯一的服务端，负责节点注册、续约和过期判定
//! - [`WatchdogService`]: 每个节点上的代理，注册本节点并定期续约，
//!   把服务端推送的状态变化转发给本地的 [`NodeListener`]
//! - [`transport`]: 基于 HTTP 的远程调用，服务端与客户端都可以跨进程部署
//!
//! ```rust,ignore
//! let service = WatchdogService::start(&config.watchdog, store, scheduler).await?;
//! service.add_node_listener(Arc::new(MyListener))?;
//! ```

pub mod api;
pub mod node;
pub mod server;
pub mod service;
pub mod transport;
mod txn;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use api::{
    check_status_arrays, NodeListener, Registration, WatchdogClient, WatchdogServerApi,
};
pub use node::{Node, NODE_KEY_PREFIX};
pub use server::WatchdogServer;
pub use service::{WatchdogService, MIN_RENEW_BACKOFF_MS};
pub use transport::{HttpEndpoint, RemoteWatchdogClient, RemoteWatchdogServer};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
