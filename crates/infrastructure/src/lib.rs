//! 持久化存储实现

pub mod memory_store;
pub mod sqlite_store;

use std::sync::Arc;

use darkstar_core::{DataStore, DataStoreBackend, DataStoreConfig, SchedulerResult};
use tracing::info;

pub use memory_store::MemoryDataStore;
pub use sqlite_store::SqliteDataStore;

/// 按配置创建数据存储
pub async fn create_data_store(config: &DataStoreConfig) -> SchedulerResult<Arc<dyn DataStore>> {
    match config.backend {
        DataStoreBackend::Memory => {
            info!("使用内存数据存储");
            Ok(Arc::new(MemoryDataStore::new()))
        }
        DataStoreBackend::Sqlite => {
            info!("使用SQLite数据存储: {}", config.url);
            let store = SqliteDataStore::connect(&config.url, config.max_connections).await?;
            Ok(Arc::new(store))
        }
    }
}
