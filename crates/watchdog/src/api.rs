//! 看门狗协议
//!
//! 节点与服务端之间的调用接口。进程内对象和 HTTP 代理实现同一组 trait，
//! 调用方不区分对端在本地还是远程。

use std::sync::Arc;

use async_trait::async_trait;
use darkstar_core::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};

use crate::node::Node;

/// 注册结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    pub node_id: u64,
    /// 节点必须在此间隔内续约
    pub renew_interval_ms: u64,
}

/// 看门狗服务端
#[async_trait]
pub trait WatchdogServerApi: Send + Sync {
    /// 注册节点
    ///
    /// `node_id` 为 None 时由服务端分配ID；指定的ID当前存活时返回
    /// `NodeAlreadyRegistered`，已失败的ID会被新分配的ID取代。
    async fn register_node(
        &self,
        node_id: Option<u64>,
        host: &str,
        client: Arc<dyn WatchdogClient>,
    ) -> SchedulerResult<Registration>;

    /// 续约，返回 false 表示节点已被判定失败
    async fn renew_node(&self, node_id: u64) -> SchedulerResult<bool>;

    /// 同 `renew_node`
    async fn ping(&self, node_id: u64) -> SchedulerResult<bool> {
        self.renew_node(node_id).await
    }

    async fn is_alive(&self, node_id: u64) -> SchedulerResult<bool>;
}

/// 接收服务端推送的节点状态变化
#[async_trait]
pub trait WatchdogClient: Send + Sync {
    /// 三个数组按下标对应同一个节点，长度不一致时返回错误
    async fn node_status_changes(
        &self,
        ids: &[u64],
        hosts: &[String],
        alive: &[bool],
    ) -> SchedulerResult<()>;
}

/// 本地服务对节点启动和失败的监听
pub trait NodeListener: Send + Sync {
    fn node_started(&self, node: &Node);

    fn node_failed(&self, node: &Node);
}

pub fn check_status_arrays(ids: &[u64], hosts: &[String], alive: &[bool]) -> SchedulerResult<()> {
    if ids.len() != hosts.len() || hosts.len() != alive.len() {
        return Err(SchedulerError::InvalidArgument(format!(
            "状态数组长度不一致: ids={}, hosts={}, alive={}",
            ids.len(),
            hosts.len(),
            alive.len()
        )));
    }
    Ok(())
}

/// 把节点列表拆成状态推送使用的三个数组
pub fn split_status_arrays(nodes: &[Node]) -> (Vec<u64>, Vec<String>, Vec<bool>) {
    let ids = nodes.iter().map(|node| node.id).collect();
    let hosts = nodes.iter().map(|node| node.host.clone()).collect();
    let alive = nodes.iter().map(|node| node.alive).collect();
    (ids, hosts, alive)
}
