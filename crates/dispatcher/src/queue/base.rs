use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use darkstar_core::{SchedulerError, SchedulerResult};
use tokio::sync::Notify;
use tracing::debug;

use super::SchedulerQueue;
use crate::recurring::RecurringTaskHandle;
use crate::reservation::TaskReservation;
use crate::task::ScheduledTask;
use crate::timed_task_handler::{TimedTaskConsumer, TimedTaskHandler};
use crate::timer::DeadlineTimer;

/// 就绪任务的存储结构，决定出队顺序
pub trait ReadyStructure: Default + Send + Sync + 'static {
    const NAME: &'static str;

    fn offer(&self, task: Arc<ScheduledTask>);

    fn poll(&self) -> Option<Arc<ScheduledTask>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 调度队列的公共实现：准入、延迟处理、阻塞等待与关闭
pub struct BaseSchedulerQueue<R: ReadyStructure> {
    ready: R,
    available: Notify,
    timed_handler: TimedTaskHandler,
    shutdown: AtomicBool,
    self_ref: Weak<Self>,
}

impl<R: ReadyStructure> BaseSchedulerQueue<R> {
    /// 创建队列并启动独立的定时器，必须在 tokio 运行时内调用
    pub fn new() -> Arc<Self> {
        Self::with_timer(DeadlineTimer::new())
    }

    pub fn with_timer(timer: DeadlineTimer) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let consumer: Weak<dyn TimedTaskConsumer> = weak.clone();
            Self {
                ready: R::default(),
                available: Notify::new(),
                timed_handler: TimedTaskHandler::new(consumer, timer),
                shutdown: AtomicBool::new(false),
                self_ref: weak.clone(),
            }
        })
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn shared(&self) -> SchedulerResult<Arc<dyn SchedulerQueue>> {
        match self.self_ref.upgrade() {
            Some(queue) => Ok(queue),
            None => Err(SchedulerError::illegal_state("调度队列已释放")),
        }
    }

    fn push_ready(&self, task: Arc<ScheduledTask>) {
        self.ready.offer(task);
        self.available.notify_one();
    }
}

impl<R: ReadyStructure> TimedTaskConsumer for BaseSchedulerQueue<R> {
    fn timed_task_ready(&self, task: Arc<ScheduledTask>) {
        self.push_ready(task);
    }
}

#[async_trait]
impl<R: ReadyStructure> SchedulerQueue for BaseSchedulerQueue<R> {
    fn reserve_task(&self, task: Arc<ScheduledTask>) -> SchedulerResult<TaskReservation> {
        if task.is_recurring() {
            return Err(SchedulerError::TaskRejected(
                "周期任务不能单独预留".to_string(),
            ));
        }
        if self.is_shutdown() {
            return Err(SchedulerError::TaskRejected("调度队列已关闭".to_string()));
        }
        Ok(TaskReservation::new(self.shared()?, task))
    }

    fn add_task(&self, task: Arc<ScheduledTask>) -> SchedulerResult<()> {
        if self.is_shutdown() {
            return Err(SchedulerError::TaskRejected("调度队列已关闭".to_string()));
        }

        if self.timed_handler.run_delayed_task(task.clone()) {
            return Ok(());
        }

        if task.is_recurring() {
            self.timed_task_ready(task);
        } else {
            self.push_ready(task);
        }
        Ok(())
    }

    fn create_recurring_task_handle(
        &self,
        task: Arc<ScheduledTask>,
    ) -> SchedulerResult<RecurringTaskHandle> {
        RecurringTaskHandle::new(self.shared()?, task)
    }

    async fn get_next_task(&self, wait: bool) -> Option<Arc<ScheduledTask>> {
        loop {
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(task) = self.ready.poll() {
                return Some(task);
            }
            if !wait || self.is_shutdown() {
                return None;
            }

            notified.await;
        }
    }

    fn get_next_tasks(&self, tasks: &mut Vec<Arc<ScheduledTask>>, max: usize) -> usize {
        let mut count = 0;
        while count < max {
            match self.ready.poll() {
                Some(task) => {
                    tasks.push(task);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    fn get_ready_count(&self) -> usize {
        self.ready.len()
    }

    fn notify_cancelled(&self, task: &ScheduledTask) {
        debug!(task_id = %task.id(), queue = R::NAME, "周期任务已取消");
    }

    fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.timed_handler.shutdown();
        self.available.notify_waiters();
        debug!(queue = R::NAME, "调度队列已关闭");
    }

    fn name(&self) -> &str {
        R::NAME
    }
}
