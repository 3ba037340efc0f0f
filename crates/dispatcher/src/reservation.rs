use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use darkstar_core::{SchedulerError, SchedulerResult};

use crate::queue::SchedulerQueue;
use crate::task::ScheduledTask;

/// 一次性任务的预留
///
/// `use_reservation()` 把任务加入队列，`cancel()` 丢弃任务，两者合计只能调用一次。
pub struct TaskReservation {
    queue: Arc<dyn SchedulerQueue>,
    task: Arc<ScheduledTask>,
    finished: AtomicBool,
}

impl TaskReservation {
    pub(crate) fn new(queue: Arc<dyn SchedulerQueue>, task: Arc<ScheduledTask>) -> Self {
        Self {
            queue,
            task,
            finished: AtomicBool::new(false),
        }
    }

    pub fn task(&self) -> &Arc<ScheduledTask> {
        &self.task
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn use_reservation(&self) -> SchedulerResult<()> {
        self.finish()?;
        self.queue.add_task(self.task.clone())
    }

    pub fn cancel(&self) -> SchedulerResult<()> {
        self.finish()?;
        self.task.cancel();
        Ok(())
    }

    fn finish(&self) -> SchedulerResult<()> {
        if self.finished.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::illegal_state("预留已完成"));
        }
        Ok(())
    }
}
