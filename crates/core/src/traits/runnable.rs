use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::errors::TaskFailure;

/// 调度器执行的工作单元
///
/// 一次 `run` 即一次执行尝试；返回的 `TaskFailure` 交由重试策略裁决。
#[async_trait]
pub trait KernelRunnable: Send + Sync {
    /// 任务类型名称，用于日志
    fn base_task_type(&self) -> &str;

    async fn run(&self) -> Result<(), TaskFailure>;
}

type TaskBody = Box<dyn Fn() -> BoxFuture<'static, Result<(), TaskFailure>> + Send + Sync>;

/// 基于闭包的任务
pub struct KernelTask {
    task_type: String,
    body: TaskBody,
}

impl KernelTask {
    pub fn new<F, Fut>(task_type: impl Into<String>, body: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TaskFailure>> + Send + 'static,
    {
        Self {
            task_type: task_type.into(),
            body: Box::new(move || Box::pin(body())),
        }
    }

    pub fn into_runnable(self) -> Arc<dyn KernelRunnable> {
        Arc::new(self)
    }
}

#[async_trait]
impl KernelRunnable for KernelTask {
    fn base_task_type(&self) -> &str {
        &self.task_type
    }

    async fn run(&self) -> Result<(), TaskFailure> {
        (self.body)().await
    }
}
