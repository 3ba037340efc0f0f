//! 节点记录
//!
//! 每个节点在数据存储中对应一个绑定，名称为固定前缀加补零的节点ID，
//! 值为 (id, host, alive) 的 JSON。过期时间只存在于服务端内存中，不持久化。

use darkstar_core::{BindingOp, DataStore, SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};

/// 节点绑定名称前缀
pub const NODE_KEY_PREFIX: &str = "darkstar.watchdog.node.";

/// 集群中的一个节点
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Node {
    pub id: u64,
    pub host: String,
    pub alive: bool,
}

impl Node {
    /// 新注册的节点总是存活的
    pub fn new(id: u64, host: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
            alive: true,
        }
    }

    pub fn failed(id: u64, host: impl Into<String>) -> Self {
        Self {
            id,
            host: host.into(),
            alive: false,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive
    }

    /// 节点在存储中的绑定名称
    ///
    /// ID 补零到 20 位，使按名称排序与按 ID 排序一致。
    pub fn key(id: u64) -> String {
        format!("{NODE_KEY_PREFIX}{id:020}")
    }

    pub fn to_binding(&self) -> SchedulerResult<BindingOp> {
        Ok(BindingOp::set(Self::key(self.id), serde_json::to_string(self)?))
    }

    fn from_binding(name: &str, value: &str) -> SchedulerResult<Self> {
        serde_json::from_str(value).map_err(|e| {
            SchedulerError::Serialization(format!("无法解析节点记录 {name}: {e}"))
        })
    }
}

/// 持久化节点记录
pub async fn put_node(store: &dyn DataStore, node: &Node) -> SchedulerResult<()> {
    store.commit(vec![node.to_binding()?]).await
}

pub async fn get_node(store: &dyn DataStore, id: u64) -> SchedulerResult<Option<Node>> {
    let key = Node::key(id);
    match store.get_binding(&key).await? {
        Some(value) => Ok(Some(Node::from_binding(&key, &value)?)),
        None => Ok(None),
    }
}

/// 按ID升序返回所有持久化的节点
pub async fn get_nodes(store: &dyn DataStore) -> SchedulerResult<Vec<Node>> {
    let mut nodes = Vec::new();
    for name in store.bound_names(NODE_KEY_PREFIX).await? {
        if let Some(value) = store.get_binding(&name).await? {
            nodes.push(Node::from_binding(&name, &value)?);
        }
    }
    Ok(nodes)
}

/// 将节点标记为失败，节点不存在时返回 None
pub async fn mark_node_failed(store: &dyn DataStore, id: u64) -> SchedulerResult<Option<Node>> {
    let Some(mut node) = get_node(store, id).await? else {
        return Ok(None);
    };
    if node.alive {
        node.alive = false;
        put_node(store, &node).await?;
    }
    Ok(Some(node))
}

/// 将所有持久化节点标记为失败并在一次提交中写回
///
/// 返回全部节点（均已失败），服务端启动时用它们通知客户端。
pub async fn mark_all_nodes_failed(store: &dyn DataStore) -> SchedulerResult<Vec<Node>> {
    let mut nodes = get_nodes(store).await?;
    let mut ops = Vec::new();
    for node in nodes.iter_mut().filter(|node| node.alive) {
        node.alive = false;
        ops.push(node.to_binding()?);
    }
    if !ops.is_empty() {
        store.commit(ops).await?;
    }
    Ok(nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_orders_by_id() {
        assert!(Node::key(9) < Node::key(10));
        assert!(Node::key(10).starts_with(NODE_KEY_PREFIX));
    }

    #[test]
    fn test_json_record_has_no_expiration() {
        let node = Node::new(7, "host-a");
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["id"], 7);
        assert_eq!(json["host"], "host-a");
        assert_eq!(json["alive"], true);
        assert_eq!(json.as_object().unwrap().len(), 3);
    }

    #[test]
    fn test_bad_record_is_serialization_error() {
        let err = Node::from_binding("k", "not json").unwrap_err();
        assert!(matches!(err, SchedulerError::Serialization(_)));
    }
}
