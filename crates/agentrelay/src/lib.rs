//! Task dispatcher and execution pipeline behind agentrelay.
//!
//! This crate owns components C4-C8: the bounded-queue worker pool
//! ([`dispatcher`]), the per-task agent pipeline ([`executor`]), the
//! in-process comment-update tool server ([`comment_tool`]), mode
//! selection ([`modes`]), webhook-to-dispatch orchestration ([`intake`]),
//! and the read-only inspection views ([`ui`]). The task store (C1),
//! per-key locking (C2), and retry classification (C3) live in their own
//! crates (`agentrelay-store`, `agentrelay-lock`, `agentrelay-retry`) since
//! nothing here needs to mutate their internals directly.

pub mod collaborators;
pub mod comment_tool;
pub mod dispatcher;
pub mod executor;
pub mod intake;
pub mod modes;
pub mod ui;

pub use collaborators::{ChangedFile, CommentError, DataFetcher, FetchResult, GithubComments, GithubContext};
pub use comment_tool::{CommentToolServer, ToolRequest, ToolResponse};
pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherError, TaskExecutor};
pub use executor::{AgentCommandConfig, AgentExecutor, FileBlock};
pub use intake::{Intake, IntakeOutcome};
pub use modes::{CommandMode, Mode, ModeRegistry};
pub use ui::{TaskDetailView, TaskListView, TaskSummary};
