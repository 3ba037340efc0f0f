//! Mock implementations of the core traits
//!
//! Hand-written doubles with observable counters, so tests can assert on how
//! often the scheduler ran a task or how many commits reached the store.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use darkstar_core::{
    BindingOp, DataStore, KernelRunnable, SchedulerError, SchedulerResult, TaskFailure,
};
use tokio::sync::Notify;

/// Runnable that counts its executions and always succeeds
#[derive(Debug, Default)]
pub struct CountingRunnable {
    runs: AtomicUsize,
    notify: Notify,
}

impl CountingRunnable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    /// Wait until the runnable has been executed at least `count` times
    pub async fn wait_for_runs(&self, count: usize, timeout: Duration) -> bool {
        let wait = async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();
                if self.runs() >= count {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, wait).await.is_ok()
    }
}

#[async_trait]
impl KernelRunnable for CountingRunnable {
    fn base_task_type(&self) -> &str {
        "CountingRunnable"
    }

    async fn run(&self) -> Result<(), TaskFailure> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }
}

/// Runnable that fails with scripted failures before succeeding
///
/// Each run pops the next failure from the script; once the script is empty
/// every run succeeds (or keeps failing with `repeat` when set).
#[derive(Debug, Default)]
pub struct FailingRunnable {
    script: Mutex<VecDeque<TaskFailure>>,
    repeat: Option<TaskFailure>,
    attempts: AtomicUsize,
    successes: AtomicUsize,
    delay: Option<Duration>,
}

impl FailingRunnable {
    /// Fail `times` times with `failure`, then succeed
    pub fn failing(times: usize, failure: TaskFailure) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(std::iter::repeat(failure).take(times).collect()),
            ..Default::default()
        })
    }

    /// Fail on every run
    pub fn always(failure: TaskFailure) -> Arc<Self> {
        Arc::new(Self {
            repeat: Some(failure),
            ..Default::default()
        })
    }

    /// Sleep for `delay` on every run, longer than a transaction timeout makes it time out
    pub fn sleeping(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay: Some(delay),
            ..Default::default()
        })
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KernelRunnable for FailingRunnable {
    fn base_task_type(&self) -> &str {
        "FailingRunnable"
    }

    async fn run(&self) -> Result<(), TaskFailure> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let scripted = self.script.lock().unwrap().pop_front();
        if let Some(failure) = scripted.or_else(|| self.repeat.clone()) {
            return Err(failure);
        }

        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// In-memory data store with commit failure injection
#[derive(Debug, Default)]
pub struct MockDataStore {
    bindings: Mutex<BTreeMap<String, String>>,
    failing_commits: AtomicUsize,
    fail_all: Mutex<bool>,
    commits: AtomicUsize,
}

impl MockDataStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `count` commits with a retryable error
    pub fn fail_next_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Fail every commit with a non-retryable error until switched off
    pub fn set_fail_all(&self, fail: bool) {
        *self.fail_all.lock().unwrap() = fail;
    }

    /// Number of successful commits
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.bindings.lock().unwrap().clone()
    }

    /// Write a binding directly, bypassing failure injection
    pub fn insert(&self, name: &str, value: &str) {
        self.bindings
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }
}

#[async_trait]
impl DataStore for MockDataStore {
    async fn get_binding(&self, name: &str) -> SchedulerResult<Option<String>> {
        Ok(self.bindings.lock().unwrap().get(name).cloned())
    }

    async fn bound_names(&self, prefix: &str) -> SchedulerResult<Vec<String>> {
        Ok(self
            .bindings
            .lock()
            .unwrap()
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn commit(&self, ops: Vec<BindingOp>) -> SchedulerResult<()> {
        if *self.fail_all.lock().unwrap() {
            return Err(SchedulerError::data_store("injected permanent failure", false));
        }

        let injected = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SchedulerError::data_store("injected transient failure", true));
        }

        let mut bindings = self.bindings.lock().unwrap();
        for op in ops {
            match op {
                BindingOp::Set { name, value } => {
                    bindings.insert(name, value);
                }
                BindingOp::Remove { name } => {
                    bindings.remove(&name);
                }
            }
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
