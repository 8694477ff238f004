//! Webhook intake orchestration (C7).
//!
//! `agentrelay-webhook` stays a pure leaf crate (trigger matching and
//! `Task` construction only); this module wires its output into the store
//! and dispatcher per the design's §4.7 six-step sequence, the same way
//! `shipper-cli`'s `main()` wires `shipper-registry` output into
//! `shipper-core`'s publish pipeline rather than folding everything into one
//! crate.

use std::sync::Arc;

use agentrelay_store::TaskStore;
use agentrelay_types::{LogLevel, TaskStatus};
use agentrelay_webhook::{translate, WebhookEvent};

use crate::dispatcher::{Dispatcher, DispatcherError};

/// What happened to a single intake call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    /// The comment didn't contain the trigger keyword; nothing was created.
    NoMatch,
    /// A task was created and handed to the dispatcher.
    Enqueued { task_id: String },
    /// A task was created but the dispatcher's queue was full; it was
    /// immediately marked `Failed`.
    QueueFull { task_id: String },
}

pub struct Intake {
    store: Arc<dyn TaskStore>,
    dispatcher: Arc<Dispatcher>,
    trigger_keyword: String,
}

impl Intake {
    pub fn new(store: Arc<dyn TaskStore>, dispatcher: Arc<Dispatcher>, trigger_keyword: impl Into<String>) -> Self {
        Self {
            store,
            dispatcher,
            trigger_keyword: trigger_keyword.into(),
        }
    }

    /// Translates, stores, supersedes, and enqueues per the design's §4.7
    /// steps 1-6.
    pub fn handle(&self, event: &WebhookEvent) -> IntakeOutcome {
        let Some(task) = translate(event, &self.trigger_keyword) else {
            return IntakeOutcome::NoMatch;
        };

        let task_id = task.id.clone();
        let owner = task.repo_owner.clone();
        let repo = task.repo_name.clone();
        let number = task.issue_number;

        if self.store.create(task.clone()).is_err() {
            // `Task::new` generates a fresh id per call; a collision here
            // would indicate a broken id generator, not a normal race.
            return IntakeOutcome::NoMatch;
        }

        self.store.supersede_older(&owner, &repo, number, &task_id);

        match self.dispatcher.enqueue(task) {
            Ok(()) => IntakeOutcome::Enqueued { task_id },
            Err(DispatcherError::QueueFull) => {
                self.store.add_log(&task_id, LogLevel::Error, "queue full");
                self.store.update_status(&task_id, TaskStatus::Failed);
                IntakeOutcome::QueueFull { task_id }
            }
        }
    }
}
