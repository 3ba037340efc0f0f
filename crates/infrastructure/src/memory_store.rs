use std::collections::BTreeMap;

use async_trait::async_trait;
use darkstar_core::{BindingOp, DataStore, SchedulerResult};
use tokio::sync::RwLock;

/// 内存数据存储，进程退出后数据丢失
#[derive(Debug, Default)]
pub struct MemoryDataStore {
    bindings: RwLock<BTreeMap<String, String>>,
}

impl MemoryDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.bindings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.read().await.is_empty()
    }
}

#[async_trait]
impl DataStore for MemoryDataStore {
    async fn get_binding(&self, name: &str) -> SchedulerResult<Option<String>> {
        Ok(self.bindings.read().await.get(name).cloned())
    }

    async fn bound_names(&self, prefix: &str) -> SchedulerResult<Vec<String>> {
        let bindings = self.bindings.read().await;
        Ok(bindings
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, _)| name.clone())
            .collect())
    }

    async fn commit(&self, ops: Vec<BindingOp>) -> SchedulerResult<()> {
        let mut bindings = self.bindings.write().await;
        for op in ops {
            match op {
                BindingOp::Set { name, value } => {
                    bindings.insert(name, value);
                }
                BindingOp::Remove { name } => {
                    bindings.remove(&name);
                }
            }
        }
        Ok(())
    }
}
