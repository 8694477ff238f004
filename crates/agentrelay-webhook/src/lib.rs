//! Webhook-to-task translation (C7).
//!
//! HTTP framing, routing, and HMAC signature verification are out of scope
//! (the design's §1 treats them as collaborator responsibilities upstream
//! of this crate); what's left here is the pure function the design
//! describes in §4.7 step 1: does a verified event's comment body match the
//! trigger keyword, and if so, what `Task` does it produce.

use agentrelay_types::Task;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Repository {
    pub owner: String,
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IssueRef {
    pub number: u64,
    pub is_pr: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CommentRef {
    pub body: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SenderRef {
    pub login: String,
}

/// A verified webhook event, already past HMAC/signature checks.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebhookEvent {
    pub action: String,
    pub repository: Repository,
    pub issue: IssueRef,
    pub comment: CommentRef,
    pub sender: SenderRef,
}

/// Case-insensitive substring match against the trigger keyword (the
/// design's S5 scenario: `"Please review /Code now"` matches `/code`).
pub fn matches_trigger(comment_body: &str, trigger_keyword: &str) -> bool {
    comment_body
        .to_lowercase()
        .contains(&trigger_keyword.to_lowercase())
}

/// Builds the `Task` a matching event produces, or `None` if the comment
/// body doesn't contain the trigger keyword (the design's §4.7 step 1).
pub fn translate(event: &WebhookEvent, trigger_keyword: &str) -> Option<Task> {
    if !matches_trigger(&event.comment.body, trigger_keyword) {
        return None;
    }

    Some(Task::new(
        event.repository.owner.clone(),
        event.repository.name.clone(),
        event.issue.number,
        event.issue.is_pr,
        event.sender.login.clone(),
        event.comment.body.clone(),
    ))
}
