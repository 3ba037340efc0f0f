//! 调度队列
//!
//! 队列负责任务的准入与就绪排序，消费者从中取出任务执行。
//! 两种排序策略共享同一契约：
//! - [`FifoSchedulerQueue`]：严格按就绪顺序
//! - [`WindowSchedulerQueue`]：按所有者窗口交错，防止单个所有者的突发任务饿死其他所有者

mod base;
mod fifo;
mod window;

use std::sync::Arc;

use async_trait::async_trait;
use darkstar_core::{QueueKind, SchedulerConfig, SchedulerResult};
use tracing::info;

pub use base::{BaseSchedulerQueue, ReadyStructure};
pub use fifo::{FifoReadyQueue, FifoSchedulerQueue};
pub use window::{WindowReadyQueue, WindowSchedulerQueue};

use crate::recurring::RecurringTaskHandle;
use crate::reservation::TaskReservation;
use crate::task::ScheduledTask;
use crate::timed_task_handler::TimedTaskConsumer;
use crate::timer::DeadlineTimer;

/// 调度队列接口
#[async_trait]
pub trait SchedulerQueue: TimedTaskConsumer + Send + Sync {
    /// 为一次性任务创建预留，周期任务会被拒绝
    fn reserve_task(&self, task: Arc<ScheduledTask>) -> SchedulerResult<TaskReservation>;

    /// 加入任务，开始时间在未来的任务先交给延迟处理
    fn add_task(&self, task: Arc<ScheduledTask>) -> SchedulerResult<()>;

    fn create_recurring_task_handle(
        &self,
        task: Arc<ScheduledTask>,
    ) -> SchedulerResult<RecurringTaskHandle>;

    /// 取出一个就绪任务；`wait` 为 true 时阻塞到有任务或队列关闭
    async fn get_next_task(&self, wait: bool) -> Option<Arc<ScheduledTask>>;

    /// 不阻塞地取出至多 `max` 个就绪任务，返回实际取出的数量
    fn get_next_tasks(&self, tasks: &mut Vec<Arc<ScheduledTask>>, max: usize) -> usize;

    fn get_ready_count(&self) -> usize;

    /// 周期句柄取消时的通知，已就绪的任务不会被移除
    fn notify_cancelled(&self, task: &ScheduledTask);

    fn shutdown(&self);

    fn name(&self) -> &str;
}

/// 按配置创建调度队列
pub fn create_scheduler_queue(config: &SchedulerConfig) -> Arc<dyn SchedulerQueue> {
    create_scheduler_queue_with_timer(config, DeadlineTimer::new())
}

pub fn create_scheduler_queue_with_timer(
    config: &SchedulerConfig,
    timer: DeadlineTimer,
) -> Arc<dyn SchedulerQueue> {
    let queue: Arc<dyn SchedulerQueue> = match config.queue {
        QueueKind::Fifo => FifoSchedulerQueue::with_timer(timer),
        QueueKind::Window => WindowSchedulerQueue::with_timer(timer),
    };
    info!("创建调度队列: {}", queue.name());
    queue
}
