//! Read-only inspection views (C8).
//!
//! Two views over the task store, nothing else: a list (newest first,
//! reusing [`agentrelay_store::TaskStore::list`]'s own ordering guarantee)
//! and a single-task detail with its full log stream. No mutation
//! endpoints exist here — HTML rendering and HTTP routing are out of scope,
//! same as the webhook crate; this module hands back plain data for
//! whatever template layer sits above it.

use agentrelay_store::TaskStore;
use agentrelay_types::{LogEntry, Task, TaskStatus};
use chrono::{DateTime, Utc};

/// One row of the task list view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSummary {
    pub id: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub issue_number: u64,
    pub status: TaskStatus,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            repo_owner: task.repo_owner.clone(),
            repo_name: task.repo_name.clone(),
            issue_number: task.issue_number,
            status: task.status,
            attempts: task.attempts,
            created_at: task.created_at,
        }
    }
}

/// The list page: every task, newest first (per `TaskStore::list`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskListView {
    pub tasks: Vec<TaskSummary>,
}

/// The detail page: a single task plus its full log stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDetailView {
    pub task: Task,
    pub logs: Vec<LogEntry>,
}

/// Renders the list view from the current store contents.
pub fn task_list_view(store: &dyn TaskStore) -> TaskListView {
    TaskListView {
        tasks: store.list().iter().map(TaskSummary::from).collect(),
    }
}

/// Renders the detail view for `task_id`, or `None` if it doesn't exist.
pub fn task_detail_view(store: &dyn TaskStore, task_id: &str) -> Option<TaskDetailView> {
    let task = store.get(task_id)?;
    let logs = task.logs.clone();
    Some(TaskDetailView { task, logs })
}
