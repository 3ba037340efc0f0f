use std::future::Future;
use std::sync::{Arc, Mutex};

use darkstar_core::{Identity, KernelTask, SchedulerError, SchedulerResult, TaskFailure};
use darkstar_dispatcher::TransactionScheduler;

use crate::lock;

/// 以事务任务的形式访问数据存储并取回结果
///
/// 瞬时存储错误按调度器的重试策略重试，`body` 每次重试都会被重新调用。
pub(crate) async fn run_transactional<T, F, Fut>(
    scheduler: &TransactionScheduler,
    task_type: &str,
    body: F,
) -> SchedulerResult<T>
where
    T: Send + 'static,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SchedulerResult<T>> + Send + 'static,
{
    let slot: Arc<Mutex<Option<T>>> = Arc::new(Mutex::new(None));
    let output = slot.clone();
    let runnable = KernelTask::new(task_type, move || {
        let output = output.clone();
        let attempt = body();
        async move {
            let value = attempt.await?;
            *lock(&output) = Some(value);
            Ok::<(), TaskFailure>(())
        }
    })
    .into_runnable();

    scheduler.run_task(runnable, Identity::new("watchdog")).await?;
    let value = lock(&slot).take();
    value.ok_or_else(|| SchedulerError::Internal(format!("事务 {task_type} 未产生结果")))
}
