//! Mode detection and prepare (§4.5 step 4 of the design).
//!
//! A "mode" decides whether a triggering comment is meant for it, and if so,
//! produces the branch name, base branch, and initial coordinating comment
//! the executor needs before it can clone and run the agent. Only one mode
//! ships here — `CommandMode`, matching the literal `/code` trigger — but
//! the registry is open for more, mirroring how `shipper-registry` lets
//! `EncryptedOutputMode`/etc. register independently of the core engine.

use std::sync::Arc;

use agentrelay_types::{PrepareResult, Task};

use crate::collaborators::GithubComments;

/// A pluggable way of handling a triggering comment.
pub trait Mode: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this mode claims `trigger_body`. The registry tries modes in
    /// registration order and uses the first match.
    fn should_trigger(&self, trigger_body: &str) -> bool;

    /// Creates the initial coordinating comment and decides the branch
    /// names the executor will check out.
    fn prepare(&self, task: &Task, comments: &dyn GithubComments) -> anyhow::Result<PrepareResult>;
}

/// The default, built-in mode: any comment containing `/code`
/// (case-insensitively) is treated as a request to run the agent against
/// the current issue/PR.
pub struct CommandMode {
    keyword: String,
}

impl CommandMode {
    pub fn new(keyword: impl Into<String>) -> Self {
        Self {
            keyword: keyword.into(),
        }
    }
}

impl Default for CommandMode {
    fn default() -> Self {
        Self::new("/code")
    }
}

impl Mode for CommandMode {
    fn name(&self) -> &str {
        "command"
    }

    fn should_trigger(&self, trigger_body: &str) -> bool {
        trigger_body
            .to_lowercase()
            .contains(&self.keyword.to_lowercase())
    }

    fn prepare(&self, task: &Task, comments: &dyn GithubComments) -> anyhow::Result<PrepareResult> {
        let initial_body = format!(
            "agentrelay is working on this ({})...\n\n_Started for @{}._",
            task.id, task.trigger_user
        );
        let comment_id = comments
            .create(&task.repo_owner, &task.repo_name, task.issue_number, &initial_body)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        let base_branch = if task.base_branch.is_empty() {
            "main".to_string()
        } else {
            task.base_branch.clone()
        };
        let branch = format!("agentrelay/{}", task.id);

        Ok(PrepareResult {
            comment_id,
            branch,
            base_branch,
            agent_prompt: task.trigger_body.clone(),
        })
    }
}

/// An ordered set of modes tried in registration order.
#[derive(Clone, Default)]
pub struct ModeRegistry {
    modes: Vec<Arc<dyn Mode>>,
}

impl ModeRegistry {
    pub fn new() -> Self {
        Self { modes: Vec::new() }
    }

    /// A registry pre-populated with the built-in `CommandMode`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CommandMode::default()));
        registry
    }

    pub fn register(&mut self, mode: Arc<dyn Mode>) {
        self.modes.push(mode);
    }

    /// Returns the first registered mode that claims `trigger_body`.
    pub fn detect(&self, trigger_body: &str) -> Option<Arc<dyn Mode>> {
        self.modes
            .iter()
            .find(|m| m.should_trigger(trigger_body))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::InMemoryGithubComments;

    fn task() -> Task {
        Task::new("acme", "widgets", 42, false, "octocat", "/code please")
    }

    #[test]
    fn command_mode_triggers_case_insensitively() {
        let mode = CommandMode::default();
        assert!(mode.should_trigger("Please review /Code now"));
        assert!(!mode.should_trigger("just talking"));
    }

    #[test]
    fn command_mode_prepare_creates_comment_and_branch() {
        let mode = CommandMode::default();
        let comments = InMemoryGithubComments::new();
        let result = mode.prepare(&task(), &comments).unwrap();
        assert!(result.branch.starts_with("agentrelay/task_"));
        assert_eq!(result.base_branch, "main");
        assert!(comments.body_of(result.comment_id).unwrap().contains("octocat"));
    }

    #[test]
    fn command_mode_prepare_respects_existing_base_branch() {
        let mode = CommandMode::default();
        let comments = InMemoryGithubComments::new();
        let mut t = task();
        t.base_branch = "release/2.0".to_string();
        let result = mode.prepare(&t, &comments).unwrap();
        assert_eq!(result.base_branch, "release/2.0");
    }

    #[test]
    fn registry_detects_first_matching_mode() {
        let registry = ModeRegistry::with_defaults();
        let found = registry.detect("/code fix the bug").unwrap();
        assert_eq!(found.name(), "command");
    }

    #[test]
    fn registry_returns_none_when_nothing_matches() {
        let registry = ModeRegistry::with_defaults();
        assert!(registry.detect("just chatting").is_none());
    }
}
