use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::base::{BaseSchedulerQueue, ReadyStructure};
use crate::lock;
use crate::task::ScheduledTask;

/// 先进先出的就绪队列，无容量限制
#[derive(Default)]
pub struct FifoReadyQueue {
    tasks: Mutex<VecDeque<Arc<ScheduledTask>>>,
}

impl ReadyStructure for FifoReadyQueue {
    const NAME: &'static str = "fifo";

    fn offer(&self, task: Arc<ScheduledTask>) {
        lock(&self.tasks).push_back(task);
    }

    fn poll(&self) -> Option<Arc<ScheduledTask>> {
        lock(&self.tasks).pop_front()
    }

    fn len(&self) -> usize {
        lock(&self.tasks).len()
    }
}

pub type FifoSchedulerQueue = BaseSchedulerQueue<FifoReadyQueue>;
