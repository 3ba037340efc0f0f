//! 持久化存储抽象
//!
//! 存储只暴露名称到值的绑定：读取单个绑定、按前缀列出名称、原子地提交一组修改。
//! 提交要么全部生效，要么全部放弃。

use async_trait::async_trait;

use crate::SchedulerResult;

/// 一次提交中的单个绑定修改
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindingOp {
    Set { name: String, value: String },
    Remove { name: String },
}

impl BindingOp {
    pub fn set(name: impl Into<String>, value: impl Into<String>) -> Self {
        BindingOp::Set {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn remove(name: impl Into<String>) -> Self {
        BindingOp::Remove { name: name.into() }
    }

    pub fn name(&self) -> &str {
        match self {
            BindingOp::Set { name, .. } | BindingOp::Remove { name } => name,
        }
    }
}

/// 事务性键值存储
#[async_trait]
pub trait DataStore: Send + Sync {
    /// 读取绑定的值，不存在时返回 None
    async fn get_binding(&self, name: &str) -> SchedulerResult<Option<String>>;

    /// 以 `prefix` 开头的所有绑定名称，按名称升序
    async fn bound_names(&self, prefix: &str) -> SchedulerResult<Vec<String>>;

    /// 原子地应用一组修改
    async fn commit(&self, ops: Vec<BindingOp>) -> SchedulerResult<()>;
}
