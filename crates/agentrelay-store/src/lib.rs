//! In-memory task store (C1).
//!
//! Adapted from the trait-abstraction style of `shipper::store::StateStore`
//! — a trait plus one concrete implementation, total (never-panicking)
//! mutator semantics — but with the filesystem persistence stripped out:
//! the design fixes "Persisted state layout: None", so `InMemoryTaskStore`
//! is the only implementation this crate ships.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use agentrelay_types::{LogLevel, Task, TaskStatus};

/// Operations over the task registry. A trait (rather than a bare struct)
/// so the dispatcher, executor, and UI depend on the contract, not the
/// storage strategy — mirrors how `shipper::store::StateStore` separates
/// the abstraction from `FileStore`.
pub trait TaskStore: Send + Sync {
    /// Inserts `task`. Fails only if `task.id` already exists.
    fn create(&self, task: Task) -> Result<(), String>;
    fn get(&self, id: &str) -> Option<Task>;
    /// Returns every task, newest-`created_at`-first; stable on ties.
    fn list(&self) -> Vec<Task>;
    fn update_status(&self, id: &str, status: TaskStatus);
    fn add_log(&self, id: &str, level: LogLevel, message: &str);
    /// Transitions a task to `Running` and increments its attempt counter
    /// atomically with respect to other mutators. Returns the new attempt
    /// count, or `None` if `id` is unknown.
    fn begin_attempt(&self, id: &str) -> Option<u32>;
    /// Records the branch/base-branch/comment-id a mode's `prepare` chose,
    /// for the inspection UI to surface. No-op if `id` is unknown.
    fn set_branch_info(&self, id: &str, comment_id: u64, branch: &str, base_branch: &str);
    /// For every `Pending` task matching `(owner, repo, number)` other than
    /// `keep_id`, transitions it to `Failed` with a terminal log entry.
    /// Returns the number of tasks superseded. `Running` tasks are
    /// untouched.
    fn supersede_older(&self, owner: &str, repo: &str, number: u64, keep_id: &str) -> usize;
}

struct Entry {
    task: Task,
    seq: u64,
}

/// `Arc<RwLock<HashMap<...>>>`-backed task registry: many concurrent
/// readers, single-writer-per-mutation, safe to clone cheaply across
/// dispatcher workers and the inspection UI.
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<String, Entry>>>,
    seq: Arc<AtomicU64>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }
}

impl TaskStore for InMemoryTaskStore {
    fn create(&self, task: Task) -> Result<(), String> {
        let mut tasks = self.tasks.write().expect("task store poisoned");
        if tasks.contains_key(&task.id) {
            return Err(format!("task id already exists: {}", task.id));
        }
        let seq = self.next_seq();
        tasks.insert(task.id.clone(), Entry { task, seq });
        Ok(())
    }

    fn get(&self, id: &str) -> Option<Task> {
        let tasks = self.tasks.read().expect("task store poisoned");
        tasks.get(id).map(|e| e.task.clone())
    }

    fn list(&self) -> Vec<Task> {
        let tasks = self.tasks.read().expect("task store poisoned");
        let mut entries: Vec<&Entry> = tasks.values().collect();
        entries.sort_by(|a, b| {
            b.task
                .created_at
                .cmp(&a.task.created_at)
                .then(a.seq.cmp(&b.seq))
        });
        entries.into_iter().map(|e| e.task.clone()).collect()
    }

    fn update_status(&self, id: &str, status: TaskStatus) {
        let mut tasks = self.tasks.write().expect("task store poisoned");
        if let Some(entry) = tasks.get_mut(id) {
            entry.task.set_status(status);
        }
    }

    fn add_log(&self, id: &str, level: LogLevel, message: &str) {
        let mut tasks = self.tasks.write().expect("task store poisoned");
        if let Some(entry) = tasks.get_mut(id) {
            entry.task.add_log(level, message);
        }
    }

    fn begin_attempt(&self, id: &str) -> Option<u32> {
        let mut tasks = self.tasks.write().expect("task store poisoned");
        let entry = tasks.get_mut(id)?;
        entry.task.attempts += 1;
        entry.task.set_status(TaskStatus::Running);
        let attempt = entry.task.attempts;
        entry
            .task
            .add_log(LogLevel::Info, format!("attempt {attempt} starting"));
        Some(attempt)
    }

    fn set_branch_info(&self, id: &str, comment_id: u64, branch: &str, base_branch: &str) {
        let mut tasks = self.tasks.write().expect("task store poisoned");
        if let Some(entry) = tasks.get_mut(id) {
            entry.task.comment_id = Some(comment_id);
            entry.task.branch = branch.to_string();
            entry.task.base_branch = base_branch.to_string();
            entry.task.updated_at = chrono::Utc::now();
        }
    }

    fn supersede_older(&self, owner: &str, repo: &str, number: u64, keep_id: &str) -> usize {
        let mut tasks = self.tasks.write().expect("task store poisoned");
        let mut count = 0;
        for entry in tasks.values_mut() {
            let task = &mut entry.task;
            if task.id != keep_id
                && task.repo_owner == owner
                && task.repo_name == repo
                && task.issue_number == number
                && task.status == TaskStatus::Pending
            {
                task.set_status(TaskStatus::Failed);
                task.add_log(LogLevel::Info, "Superseded by newer trigger");
                count += 1;
            }
        }
        count
    }
}
