//! Bounded-queue worker pool (C4).
//!
//! The worker-loop shape — pop, acquire a resource, do the work, release,
//! decide retry-or-done — is the same one `shipper`'s publish pipeline
//! drives sequentially; here it is generalized to N concurrent workers
//! pulling off one `std::sync::mpsc::sync_channel`, the teacher's usual
//! reach for bounded, blocking hand-off between threads instead of an
//! unbounded `Vec`-backed queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use agentrelay_lock::PerKeyLock;
use agentrelay_retry::{is_non_retryable, next_backoff, RetryStrategyConfig};
use agentrelay_store::TaskStore;
use agentrelay_types::{LogLevel, QueueEntry, Task, TaskStatus};

/// How long a worker blocks on the queue before re-checking the shutdown
/// flag. Keeps shutdown latency bounded without a dedicated wakeup signal.
const POP_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// How long a worker waits for a contested per-key lock before re-checking
/// shutdown. The design's §4.4 requires shutdown to be noticed even while a
/// worker is blocked waiting to acquire a key.
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum DispatcherError {
    #[error("dispatcher queue full")]
    QueueFull,
}

/// Runs one task to completion or failure. Implemented by [`crate::executor::AgentExecutor`]
/// in production and by fakes in tests, so the dispatcher's retry/backoff
/// logic is testable without spawning real subprocesses.
pub trait TaskExecutor: Send + Sync {
    fn run(&self, task_id: &str) -> anyhow::Result<()>;
}

pub struct DispatcherConfig {
    pub workers: u32,
    pub queue_size: u32,
    pub max_attempts: u32,
    pub retry: RetryStrategyConfig,
}

/// The bounded FIFO dispatcher: one `sync_channel` feeding a fixed pool of
/// worker threads, each serialized per `(owner, repo, number)` key via
/// [`PerKeyLock`].
pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    locks: PerKeyLock,
    executor: Arc<dyn TaskExecutor>,
    sender: SyncSender<QueueEntry>,
    receiver: Arc<Mutex<Receiver<QueueEntry>>>,
    shutdown: Arc<AtomicBool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    max_attempts: u32,
    retry: RetryStrategyConfig,
}

impl Dispatcher {
    /// Builds a dispatcher and immediately spawns its worker threads.
    pub fn start(
        config: DispatcherConfig,
        store: Arc<dyn TaskStore>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Arc<Self> {
        let (sender, receiver) = sync_channel(config.queue_size as usize);
        let dispatcher = Arc::new(Self {
            store,
            locks: PerKeyLock::new(),
            executor,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            shutdown: Arc::new(AtomicBool::new(false)),
            handles: Mutex::new(Vec::new()),
            max_attempts: config.max_attempts,
            retry: config.retry,
        });

        let mut handles = dispatcher.handles.lock().expect("handles poisoned");
        for _ in 0..config.workers {
            let worker_dispatcher = Arc::clone(&dispatcher);
            handles.push(std::thread::spawn(move || worker_dispatcher.worker_loop()));
        }
        drop(handles);

        dispatcher
    }

    /// Enqueues `task` for first-attempt execution. Fails with
    /// [`DispatcherError::QueueFull`] if the bounded queue has no room,
    /// leaving the caller to decide what to do with the rejected task (the
    /// design's §4.7 marks it `Failed` with a `QueueFull` log entry).
    pub fn enqueue(&self, task: Task) -> Result<(), DispatcherError> {
        self.enqueue_entry(QueueEntry::first_attempt(task))
    }

    fn enqueue_entry(&self, entry: QueueEntry) -> Result<(), DispatcherError> {
        match self.sender.try_send(entry) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(DispatcherError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(DispatcherError::QueueFull),
        }
    }

    /// Signals every worker to stop taking new work and joins them. Workers
    /// finish whatever task they are currently executing first; this does
    /// not preempt an in-flight executor run.
    pub fn shutdown(&self, _wait: Duration) {
        self.shutdown.store(true, Ordering::SeqCst);
        let mut handles = self.handles.lock().expect("handles poisoned");
        for handle in handles.drain(..) {
            let _ = handle.join();
        }
    }

    fn worker_loop(self: Arc<Self>) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return;
            }

            let entry = {
                let receiver = self.receiver.lock().expect("receiver poisoned");
                receiver.recv_timeout(POP_POLL_INTERVAL)
            };

            match entry {
                Ok(entry) => self.process_entry(entry),
                Err(_) => continue,
            }
        }
    }

    fn process_entry(&self, entry: QueueEntry) {
        let QueueEntry { task, backoff_attempt } = entry;
        let key = task.lock_key();

        let mut lock = None;
        while lock.is_none() {
            if self.shutdown.load(Ordering::SeqCst) {
                self.store.add_log(
                    &task.id,
                    LogLevel::Error,
                    "Dispatcher shutdown before execution",
                );
                self.store.update_status(&task.id, TaskStatus::Failed);
                return;
            }
            lock = self.locks.acquire_timeout(&key, LOCK_POLL_INTERVAL);
        }
        let lock = lock.expect("loop only exits with a lock held");

        let attempt = match self.store.begin_attempt(&task.id) {
            Some(attempt) => attempt,
            None => {
                drop(lock);
                return;
            }
        };

        let result = self.executor.run(&task.id);
        drop(lock);

        match result {
            Ok(()) => {
                self.store.update_status(&task.id, TaskStatus::Completed);
            }
            Err(err) => {
                self.store.add_log(&task.id, LogLevel::Error, &err.to_string());

                let exhausted = is_non_retryable(&err) || attempt >= self.max_attempts;
                if exhausted {
                    self.store.update_status(&task.id, TaskStatus::Failed);
                    return;
                }

                let delay = next_backoff(&self.retry, backoff_attempt + 1);
                std::thread::sleep(delay);

                let next_entry = QueueEntry {
                    task,
                    backoff_attempt: backoff_attempt + 1,
                };
                let next_id = next_entry.task.id.clone();
                if self.enqueue_entry(next_entry).is_err() {
                    self.store.add_log(
                        &next_id,
                        LogLevel::Error,
                        "retry dropped: dispatcher queue full",
                    );
                    self.store.update_status(&next_id, TaskStatus::Failed);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentrelay_store::InMemoryTaskStore;
    use std::sync::atomic::AtomicU32;
    use std::sync::Mutex as StdMutex;

    struct AlwaysSucceeds;
    impl TaskExecutor for AlwaysSucceeds {
        fn run(&self, _task_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct AlwaysFails;
    impl TaskExecutor for AlwaysFails {
        fn run(&self, _task_id: &str) -> anyhow::Result<()> {
            Err(anyhow::anyhow!("boom"))
        }
    }

    struct FailsNonRetryably;
    impl TaskExecutor for FailsNonRetryably {
        fn run(&self, _task_id: &str) -> anyhow::Result<()> {
            Err(agentrelay_retry::non_retryable(anyhow::anyhow!("401 unauthorized")))
        }
    }

    struct FailsThenSucceeds {
        calls: AtomicU32,
    }
    impl TaskExecutor for FailsThenSucceeds {
        fn run(&self, _task_id: &str) -> anyhow::Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(anyhow::anyhow!("connection reset"))
            } else {
                Ok(())
            }
        }
    }

    fn fast_retry() -> RetryStrategyConfig {
        RetryStrategyConfig {
            strategy: agentrelay_retry::RetryStrategyType::Constant,
            max_attempts: 3,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 1.0,
            jitter: 0.0,
        }
    }

    fn wait_for<F: Fn() -> bool>(cond: F) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("condition never became true");
    }

    #[test]
    fn successful_task_is_marked_completed() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let dispatcher = Dispatcher::start(
            DispatcherConfig {
                workers: 1,
                queue_size: 4,
                max_attempts: 3,
                retry: fast_retry(),
            },
            store.clone(),
            Arc::new(AlwaysSucceeds),
        );

        let task = Task::new("acme", "widgets", 1, false, "octocat", "/code");
        let id = task.id.clone();
        store.create(task.clone()).unwrap();
        dispatcher.enqueue(task).unwrap();

        wait_for(|| matches!(store.get(&id).map(|t| t.status), Some(TaskStatus::Completed)));
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn non_retryable_failure_is_marked_failed_after_one_attempt() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let dispatcher = Dispatcher::start(
            DispatcherConfig {
                workers: 1,
                queue_size: 4,
                max_attempts: 3,
                retry: fast_retry(),
            },
            store.clone(),
            Arc::new(FailsNonRetryably),
        );

        let task = Task::new("acme", "widgets", 1, false, "octocat", "/code");
        let id = task.id.clone();
        store.create(task.clone()).unwrap();
        dispatcher.enqueue(task).unwrap();

        wait_for(|| matches!(store.get(&id).map(|t| t.status), Some(TaskStatus::Failed)));
        assert_eq!(store.get(&id).unwrap().attempts, 1);
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn retryable_failure_exhausts_max_attempts_then_fails() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let dispatcher = Dispatcher::start(
            DispatcherConfig {
                workers: 1,
                queue_size: 4,
                max_attempts: 2,
                retry: fast_retry(),
            },
            store.clone(),
            Arc::new(AlwaysFails),
        );

        let task = Task::new("acme", "widgets", 1, false, "octocat", "/code");
        let id = task.id.clone();
        store.create(task.clone()).unwrap();
        dispatcher.enqueue(task).unwrap();

        wait_for(|| matches!(store.get(&id).map(|t| t.status), Some(TaskStatus::Failed)));
        assert_eq!(store.get(&id).unwrap().attempts, 2);
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn retryable_failure_succeeds_on_second_attempt() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
        let dispatcher = Dispatcher::start(
            DispatcherConfig {
                workers: 1,
                queue_size: 4,
                max_attempts: 3,
                retry: fast_retry(),
            },
            store.clone(),
            Arc::new(FailsThenSucceeds { calls: AtomicU32::new(0) }),
        );

        let task = Task::new("acme", "widgets", 1, false, "octocat", "/code");
        let id = task.id.clone();
        store.create(task.clone()).unwrap();
        dispatcher.enqueue(task).unwrap();

        wait_for(|| matches!(store.get(&id).map(|t| t.status), Some(TaskStatus::Completed)));
        assert_eq!(store.get(&id).unwrap().attempts, 2);
        dispatcher.shutdown(Duration::from_secs(1));
    }

    #[test]
    fn tasks_for_the_same_key_never_run_concurrently() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());

        struct TrackConcurrency {
            active: AtomicU32,
            max_seen: StdMutex<u32>,
        }
        impl TaskExecutor for TrackConcurrency {
            fn run(&self, _task_id: &str) -> anyhow::Result<()> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                let mut max_seen = self.max_seen.lock().unwrap();
                if now > *max_seen {
                    *max_seen = now;
                }
                drop(max_seen);
                std::thread::sleep(Duration::from_millis(20));
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let executor = Arc::new(TrackConcurrency {
            active: AtomicU32::new(0),
            max_seen: StdMutex::new(0),
        });

        let dispatcher = Dispatcher::start(
            DispatcherConfig {
                workers: 4,
                queue_size: 8,
                max_attempts: 3,
                retry: fast_retry(),
            },
            store.clone(),
            executor.clone(),
        );

        let mut ids = Vec::new();
        for _ in 0..4 {
            let task = Task::new("acme", "widgets", 1, false, "octocat", "/code");
            ids.push(task.id.clone());
            store.create(task.clone()).unwrap();
            dispatcher.enqueue(task).unwrap();
        }

        wait_for(|| {
            ids.iter()
                .all(|id| matches!(store.get(id).map(|t| t.status), Some(TaskStatus::Completed)))
        });
        dispatcher.shutdown(Duration::from_secs(1));

        assert_eq!(*executor.max_seen.lock().unwrap(), 1);
    }

    #[test]
    fn tasks_for_independent_keys_run_concurrently() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());

        struct TrackConcurrency {
            active: AtomicU32,
            max_seen: StdMutex<u32>,
        }
        impl TaskExecutor for TrackConcurrency {
            fn run(&self, _task_id: &str) -> anyhow::Result<()> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                let mut max_seen = self.max_seen.lock().unwrap();
                if now > *max_seen {
                    *max_seen = now;
                }
                drop(max_seen);
                std::thread::sleep(Duration::from_millis(50));
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let executor = Arc::new(TrackConcurrency {
            active: AtomicU32::new(0),
            max_seen: StdMutex::new(0),
        });

        let dispatcher = Dispatcher::start(
            DispatcherConfig {
                workers: 2,
                queue_size: 8,
                max_attempts: 1,
                retry: fast_retry(),
            },
            store.clone(),
            executor.clone(),
        );

        // Two distinct issue numbers give two distinct lock keys, so both
        // should be able to run on the worker pool's two threads at once.
        let mut ids = Vec::new();
        for number in [1u64, 2u64] {
            let task = Task::new("acme", "widgets", number, false, "octocat", "/code");
            ids.push(task.id.clone());
            store.create(task.clone()).unwrap();
            dispatcher.enqueue(task).unwrap();
        }

        wait_for(|| {
            ids.iter()
                .all(|id| matches!(store.get(id).map(|t| t.status), Some(TaskStatus::Completed)))
        });
        dispatcher.shutdown(Duration::from_secs(1));

        assert_eq!(*executor.max_seen.lock().unwrap(), 2);
    }

    #[test]
    fn queue_preserves_fifo_order_for_a_single_worker() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());

        struct RecordOrder {
            order: StdMutex<Vec<String>>,
        }
        impl TaskExecutor for RecordOrder {
            fn run(&self, task_id: &str) -> anyhow::Result<()> {
                self.order.lock().unwrap().push(task_id.to_string());
                Ok(())
            }
        }

        let executor = Arc::new(RecordOrder {
            order: StdMutex::new(Vec::new()),
        });

        let dispatcher = Dispatcher::start(
            DispatcherConfig {
                workers: 1,
                queue_size: 8,
                max_attempts: 1,
                retry: fast_retry(),
            },
            store.clone(),
            executor.clone(),
        );

        // Distinct keys so ordering is governed purely by FIFO pop order,
        // not by per-key serialization.
        let mut ids = Vec::new();
        for number in 0..5u64 {
            let task = Task::new("acme", "widgets", number, false, "octocat", "/code");
            ids.push(task.id.clone());
            store.create(task.clone()).unwrap();
            dispatcher.enqueue(task).unwrap();
        }

        wait_for(|| {
            ids.iter()
                .all(|id| matches!(store.get(id).map(|t| t.status), Some(TaskStatus::Completed)))
        });
        dispatcher.shutdown(Duration::from_secs(1));

        assert_eq!(*executor.order.lock().unwrap(), ids);
    }

    #[test]
    fn enqueue_past_capacity_reports_queue_full() {
        let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());

        struct Blocks;
        impl TaskExecutor for Blocks {
            fn run(&self, _task_id: &str) -> anyhow::Result<()> {
                std::thread::sleep(Duration::from_secs(2));
                Ok(())
            }
        }

        let dispatcher = Dispatcher::start(
            DispatcherConfig {
                workers: 1,
                queue_size: 1,
                max_attempts: 1,
                retry: fast_retry(),
            },
            store.clone(),
            Arc::new(Blocks),
        );

        for i in 0..3u64 {
            let task = Task::new("acme", "widgets", i, false, "octocat", "/code");
            store.create(task.clone()).unwrap();
            let _ = dispatcher.enqueue(task);
        }

        let overflow = Task::new("acme", "widgets", 99, false, "octocat", "/code");
        store.create(overflow.clone()).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        let result = dispatcher.enqueue(overflow);
        assert!(matches!(result, Err(DispatcherError::QueueFull)));
    }
}
