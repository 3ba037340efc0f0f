//! 共享的截止时间定时器
//!
//! 所有延迟回调放在一个最小堆里，由单个后台任务按截止时间依次触发。

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::lock;

type TimerCallback = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct TimerState {
    deadlines: BinaryHeap<Reverse<(Instant, u64)>>,
    callbacks: HashMap<u64, TimerCallback>,
    next_id: u64,
}

struct TimerInner {
    state: Mutex<TimerState>,
    wakeup: Notify,
    shutdown: AtomicBool,
}

/// 单个已登记的延迟回调
///
/// 取消是幂等的：第一次成功取消返回 true，之后（或回调已触发后）返回 false。
#[derive(Debug)]
pub struct TimerEntry {
    id: u64,
    timer: Weak<TimerInner>,
}

impl TimerEntry {
    pub fn cancel(&self) -> bool {
        match self.timer.upgrade() {
            Some(inner) => lock(&inner.state).callbacks.remove(&self.id).is_some(),
            None => false,
        }
    }
}

impl std::fmt::Debug for TimerInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerInner")
            .field("shutdown", &self.shutdown.load(Ordering::SeqCst))
            .finish()
    }
}

#[derive(Clone)]
pub struct DeadlineTimer {
    inner: Arc<TimerInner>,
}

impl DeadlineTimer {
    /// 创建定时器并启动后台任务，必须在 tokio 运行时内调用
    pub fn new() -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState::default()),
            wakeup: Notify::new(),
            shutdown: AtomicBool::new(false),
        });

        tokio::spawn(run_timer(inner.clone()));

        Self { inner }
    }

    /// 在 `delay` 之后调用 `callback`
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerEntry
    where
        F: FnOnce() + Send + 'static,
    {
        let deadline = Instant::now() + delay;
        let id = {
            let mut state = lock(&self.inner.state);
            let id = state.next_id;
            state.next_id += 1;
            state.deadlines.push(Reverse((deadline, id)));
            state.callbacks.insert(id, Box::new(callback));
            id
        };
        self.inner.wakeup.notify_one();

        TimerEntry {
            id,
            timer: Arc::downgrade(&self.inner),
        }
    }

    /// 尚未触发也未取消的回调数量
    pub fn pending(&self) -> usize {
        lock(&self.inner.state).callbacks.len()
    }

    /// 停止后台任务，未触发的回调全部丢弃
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut state = lock(&self.inner.state);
            state.callbacks.clear();
            state.deadlines.clear();
        }
        self.inner.wakeup.notify_one();
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }
}

impl Default for DeadlineTimer {
    fn default() -> Self {
        Self::new()
    }
}

async fn run_timer(inner: Arc<TimerInner>) {
    loop {
        if inner.shutdown.load(Ordering::SeqCst) {
            debug!("定时器已停止");
            return;
        }

        let notified = inner.wakeup.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        let now = Instant::now();
        let mut due = Vec::new();
        let next_deadline = {
            let mut state = lock(&inner.state);
            while let Some(Reverse((deadline, id))) = state.deadlines.peek().copied() {
                if deadline > now {
                    break;
                }
                state.deadlines.pop();
                // 已取消的条目只剩堆中的截止时间
                if let Some(callback) = state.callbacks.remove(&id) {
                    due.push(callback);
                }
            }
            state.deadlines.peek().map(|Reverse((deadline, _))| *deadline)
        };

        for callback in due {
            callback();
        }

        match next_deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => {}
                    _ = &mut notified => {}
                }
            }
            None => notified.await,
        }
    }
}
