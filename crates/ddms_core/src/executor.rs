//! Bounded worker pool with delayed, repeating and cancellable tasks.
//!
//! The pool owns a multi-threaded tokio runtime. Closures run on the
//! blocking pool so they may use synchronous locks and sleeps; the async
//! side only drives timers.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::AbortHandle;

/// Identifier of a submitted task.
pub type TaskId = u64;

/// Never returned by the pool; use it as "no task".
pub const INVALID_TASK_ID: TaskId = 0;

/// Executor pool configuration.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Threads driving timers.
    pub min_threads: usize,
    /// Upper bound on threads running task bodies.
    pub max_threads: usize,
    /// Prefix for worker thread names.
    pub thread_name: String,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_threads: 5,
            max_threads: 12,
            thread_name: "ddms-worker".to_string(),
        }
    }
}

impl ExecutorConfig {
    /// Creates a configuration with explicit bounds.
    pub fn new(min_threads: usize, max_threads: usize) -> Self {
        Self {
            min_threads,
            max_threads,
            ..Self::default()
        }
    }

    /// Sets the thread name prefix.
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }
}

type TaskTable = Arc<Mutex<HashMap<TaskId, AbortHandle>>>;

/// Worker pool shared by every feature of the service.
pub struct ExecutorPool {
    runtime: Option<Runtime>,
    handle: Handle,
    tasks: TaskTable,
    next_id: AtomicU64,
}

impl ExecutorPool {
    /// Starts a pool with the given configuration.
    pub fn new(config: &ExecutorConfig) -> std::io::Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.min_threads.max(1))
            .max_blocking_threads(config.max_threads.max(1))
            .thread_name(config.thread_name.clone())
            .enable_all()
            .build()?;
        let handle = runtime.handle().clone();
        Ok(Self {
            runtime: Some(runtime),
            handle,
            tasks: Arc::new(Mutex::new(HashMap::new())),
            next_id: AtomicU64::new(INVALID_TASK_ID + 1),
        })
    }

    /// Runtime handle, for components that drive their own async work.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Runs `task` as soon as a worker is free.
    pub fn execute<F>(&self, task: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.allocate();
        let tasks = Arc::clone(&self.tasks);
        let mut table = self.tasks.lock();
        let join = self.handle.spawn_blocking(move || {
            task();
            tasks.lock().remove(&id);
        });
        table.insert(id, join.abort_handle());
        id
    }

    /// Runs `task` once after `delay`.
    ///
    /// Removing the task before the delay elapses prevents it from running.
    pub fn schedule<F>(&self, delay: Duration, task: F) -> TaskId
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.allocate();
        let tasks = Arc::clone(&self.tasks);
        let mut table = self.tasks.lock();
        let join = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if tokio::task::spawn_blocking(task).await.is_err() {
                tracing::warn!(task = id, "scheduled task panicked");
            }
            tasks.lock().remove(&id);
        });
        table.insert(id, join.abort_handle());
        id
    }

    /// Runs `task` every `interval` until removed.
    pub fn schedule_repeating<F>(&self, interval: Duration, task: F) -> TaskId
    where
        F: Fn() + Send + Sync + 'static,
    {
        let id = self.allocate();
        let task = Arc::new(task);
        let mut table = self.tasks.lock();
        let join = self.handle.spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let task = Arc::clone(&task);
                if tokio::task::spawn_blocking(move || task()).await.is_err() {
                    tracing::warn!(task = id, "repeating task panicked");
                }
            }
        });
        table.insert(id, join.abort_handle());
        id
    }

    /// Cancels a task that has not started yet.
    ///
    /// A task body already running is not interrupted. Returns false if the
    /// id is unknown or the task already finished.
    pub fn remove(&self, id: TaskId) -> bool {
        match self.tasks.lock().remove(&id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Returns true while the task is pending or running.
    pub fn is_pending(&self, id: TaskId) -> bool {
        self.tasks.lock().contains_key(&id)
    }

    /// Number of pending or running tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    fn allocate(&self) -> TaskId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        for (_, handle) in self.tasks.lock().drain() {
            handle.abort();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorPool")
            .field("tasks", &self.task_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;

    fn pool() -> ExecutorPool {
        ExecutorPool::new(&ExecutorConfig::new(1, 4)).unwrap()
    }

    #[test]
    fn execute_runs_task() {
        let pool = pool();
        let (tx, rx) = mpsc::channel();
        let id = pool.execute(move || tx.send(7).unwrap());
        assert_ne!(id, INVALID_TASK_ID);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
    }

    #[test]
    fn scheduled_task_fires_after_delay() {
        let pool = pool();
        let (tx, rx) = mpsc::channel();
        pool.schedule(Duration::from_millis(50), move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn removed_task_never_runs() {
        let pool = pool();
        let (tx, rx) = mpsc::channel::<()>();
        let id = pool.schedule(Duration::from_millis(300), move || tx.send(()).unwrap());
        assert!(pool.is_pending(id));
        assert!(pool.remove(id));
        assert!(!pool.remove(id));
        assert!(rx.recv_timeout(Duration::from_millis(600)).is_err());
    }

    #[test]
    fn repeating_task_runs_until_removed() {
        let pool = pool();
        let counter = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&counter);
        let id = pool.schedule_repeating(Duration::from_millis(20), move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(200));
        assert!(pool.remove(id));
        let after_remove = counter.load(Ordering::SeqCst);
        assert!(after_remove >= 2);
        std::thread::sleep(Duration::from_millis(100));
        assert!(counter.load(Ordering::SeqCst) <= after_remove + 1);
    }

    #[test]
    fn finished_tasks_leave_the_table() {
        let pool = pool();
        let (tx, rx) = mpsc::channel();
        let id = pool.execute(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        for _ in 0..50 {
            if !pool.is_pending(id) {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("task {id} never left the table");
    }
}
