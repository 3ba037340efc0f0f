use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex};

use darkstar_core::Identity;

use super::base::{BaseSchedulerQueue, ReadyStructure};
use crate::lock;
use crate::task::ScheduledTask;

struct WindowEntry {
    window: u64,
    start_time: i64,
    seq: u64,
    task: Arc<ScheduledTask>,
}

impl WindowEntry {
    fn key(&self) -> (u64, i64, u64) {
        (self.window, self.start_time, self.seq)
    }
}

impl PartialEq for WindowEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for WindowEntry {}

impl PartialOrd for WindowEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for WindowEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
struct WindowHeap {
    entries: BinaryHeap<Reverse<WindowEntry>>,
    next_seq: u64,
    /// 最近一次出队任务的窗口，队列为空时作为当前窗口
    current_window: u64,
}

impl WindowHeap {
    fn min_window(&self) -> u64 {
        self.entries
            .peek()
            .map(|Reverse(entry)| entry.window)
            .unwrap_or(self.current_window)
    }
}

/// 按所有者窗口排序的就绪队列
///
/// 任务就绪时窗口号取 `max(队首窗口, 所有者的下一个窗口)`，随后所有者的下一个窗口加一。
/// 出队按窗口升序，窗口相同时按开始时间。每个所有者只有拿到第一个名额后才能拿第二个。
#[derive(Default)]
pub struct WindowReadyQueue {
    heap: Mutex<WindowHeap>,
    owners: Mutex<HashMap<Identity, Arc<Mutex<u64>>>>,
}

impl WindowReadyQueue {
    fn owner_window(&self, owner: &Identity) -> Arc<Mutex<u64>> {
        lock(&self.owners)
            .entry(owner.clone())
            .or_insert_with(|| Arc::new(Mutex::new(0)))
            .clone()
    }
}

impl ReadyStructure for WindowReadyQueue {
    const NAME: &'static str = "window";

    fn offer(&self, task: Arc<ScheduledTask>) {
        let owner_window = self.owner_window(task.owner());
        let mut next_window = lock(&owner_window);

        let mut heap = lock(&self.heap);
        let window = heap.min_window().max(*next_window);
        *next_window = window + 1;

        let seq = heap.next_seq;
        heap.next_seq += 1;
        heap.entries.push(Reverse(WindowEntry {
            window,
            start_time: task.start_time(),
            seq,
            task,
        }));
    }

    fn poll(&self) -> Option<Arc<ScheduledTask>> {
        let mut heap = lock(&self.heap);
        let Reverse(entry) = heap.entries.pop()?;
        heap.current_window = entry.window;
        Some(entry.task)
    }

    fn len(&self) -> usize {
        lock(&self.heap).entries.len()
    }
}

pub type WindowSchedulerQueue = BaseSchedulerQueue<WindowReadyQueue>;
