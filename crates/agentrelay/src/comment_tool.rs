//! Comment updater tool server (C6).
//!
//! The agent subprocess's only write path back to GitHub is this single
//! operation, exposed over a newline-delimited JSON protocol so it can sit
//! on any `Read + Write` pair — a pipe, a loopback socket, an in-memory
//! cursor in tests — without the executor caring which. The framing choice
//! mirrors `shipper-cli`'s line-oriented stdout protocol rather than
//! invent a length-prefixed binary one the design doesn't call for.

use std::io::{BufRead, Write};
use std::thread::sleep;
use std::time::Duration;

use agentrelay_retry::{calculate_delay, RetryStrategyConfig, RetryStrategyType};
use agentrelay_sanitizer::sanitize_comment_body;
use serde::{Deserialize, Serialize};

use crate::collaborators::GithubComments;

const MAX_RETRIES: u32 = 3;

fn retry_config() -> RetryStrategyConfig {
    RetryStrategyConfig {
        strategy: RetryStrategyType::Exponential,
        max_attempts: MAX_RETRIES,
        base_delay: Duration::from_millis(200),
        max_delay: Duration::from_secs(2),
        multiplier: 2.0,
        jitter: 0.0,
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolRequest {
    pub op: String,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolResponse {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolResponse {
    fn ok() -> Self {
        Self { ok: true, error: None }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(message.into()),
        }
    }
}

/// Serves `update_coordinating_comment` requests against a single
/// `(owner, repo, comment_id)` target for the duration of one task run.
pub struct CommentToolServer {
    comments: std::sync::Arc<dyn GithubComments>,
    owner: String,
    repo: String,
    comment_id: u64,
}

impl CommentToolServer {
    pub fn new(
        comments: std::sync::Arc<dyn GithubComments>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        comment_id: u64,
    ) -> Self {
        Self {
            comments,
            owner: owner.into(),
            repo: repo.into(),
            comment_id,
        }
    }

    /// Handles one decoded request, returning the response to frame back.
    pub fn handle_request(&self, req: &ToolRequest) -> ToolResponse {
        match req.op.as_str() {
            "update_coordinating_comment" => match sanitize_comment_body(&req.body) {
                Err(e) => ToolResponse::error(e),
                Ok(sanitized) => match self.update_with_retry(&sanitized) {
                    Ok(()) => ToolResponse::ok(),
                    Err(e) => ToolResponse::error(e.to_string()),
                },
            },
            other => ToolResponse::error(format!("unsupported operation: {other}")),
        }
    }

    fn update_with_retry(&self, body: &str) -> Result<(), crate::collaborators::CommentError> {
        let retry = retry_config();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.comments.update(&self.owner, &self.repo, self.comment_id, body) {
                Ok(()) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < MAX_RETRIES => {
                    sleep(calculate_delay(&retry, attempt));
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Reads one newline-delimited JSON request per line from `reader`,
    /// writes one newline-delimited JSON response per line to `writer`,
    /// until `reader` hits EOF.
    pub fn serve<R: BufRead, W: Write>(&self, reader: R, mut writer: W) -> anyhow::Result<()> {
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let response = match serde_json::from_str::<ToolRequest>(&line) {
                Ok(req) => self.handle_request(&req),
                Err(e) => ToolResponse::error(format!("malformed request: {e}")),
            };
            writeln!(writer, "{}", serde_json::to_string(&response)?)?;
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{CommentError, GithubComments, InMemoryGithubComments};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn server() -> (CommentToolServer, Arc<InMemoryGithubComments>, u64) {
        let comments = Arc::new(InMemoryGithubComments::new());
        let comment_id = comments.create("acme", "widgets", 1, "starting").unwrap();
        let server = CommentToolServer::new(comments.clone(), "acme", "widgets", comment_id);
        (server, comments, comment_id)
    }

    /// Fails its first `fail_count` updates with a retryable 503, then
    /// delegates to an in-memory double.
    struct FlakyGithubComments {
        fail_count: u32,
        attempts: AtomicU32,
        inner: InMemoryGithubComments,
    }

    impl GithubComments for FlakyGithubComments {
        fn create(&self, owner: &str, repo: &str, number: u64, body: &str) -> Result<u64, CommentError> {
            self.inner.create(owner, repo, number, body)
        }

        fn update(&self, owner: &str, repo: &str, comment_id: u64, body: &str) -> Result<(), CommentError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt <= self.fail_count {
                return Err(CommentError::Http {
                    status: 503,
                    message: "busy".to_string(),
                });
            }
            self.inner.update(owner, repo, comment_id, body)
        }

        fn add_label(&self, owner: &str, repo: &str, number: u64, label: &str) -> Result<(), CommentError> {
            self.inner.add_label(owner, repo, number, label)
        }
    }

    #[test]
    fn update_request_succeeds_and_persists_body() {
        let (server, comments, comment_id) = server();
        let req = ToolRequest {
            op: "update_coordinating_comment".to_string(),
            body: "progress: cloned repo".to_string(),
        };
        let resp = server.handle_request(&req);
        assert!(resp.ok);
        assert_eq!(comments.body_of(comment_id).unwrap(), "progress: cloned repo");
    }

    #[test]
    fn empty_body_is_rejected() {
        let (server, ..) = server();
        let req = ToolRequest {
            op: "update_coordinating_comment".to_string(),
            body: "   ".to_string(),
        };
        let resp = server.handle_request(&req);
        assert!(!resp.ok);
    }

    #[test]
    fn transient_failures_retry_with_exponential_backoff_then_succeed() {
        let comments = Arc::new(FlakyGithubComments {
            fail_count: 2,
            attempts: AtomicU32::new(0),
            inner: InMemoryGithubComments::new(),
        });
        let comment_id = comments.create("acme", "widgets", 1, "starting").unwrap();
        let server = CommentToolServer::new(comments.clone(), "acme", "widgets", comment_id);

        let req = ToolRequest {
            op: "update_coordinating_comment".to_string(),
            body: "progress".to_string(),
        };
        let start = std::time::Instant::now();
        let resp = server.handle_request(&req);
        let elapsed = start.elapsed();

        assert!(resp.ok);
        // Two retries at 200ms then 400ms (exponential, multiplier 2.0).
        assert!(elapsed >= Duration::from_millis(600), "elapsed={elapsed:?}");
        assert_eq!(comments.attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exhausted_retries_surface_the_terminal_error() {
        let comments = Arc::new(FlakyGithubComments {
            fail_count: u32::MAX,
            attempts: AtomicU32::new(0),
            inner: InMemoryGithubComments::new(),
        });
        let comment_id = comments.create("acme", "widgets", 1, "starting").unwrap();
        let server = CommentToolServer::new(comments.clone(), "acme", "widgets", comment_id);

        let req = ToolRequest {
            op: "update_coordinating_comment".to_string(),
            body: "progress".to_string(),
        };
        let resp = server.handle_request(&req);
        assert!(!resp.ok);
        assert_eq!(comments.attempts.load(Ordering::SeqCst), MAX_RETRIES);
    }

    #[test]
    fn unknown_operation_is_rejected() {
        let (server, ..) = server();
        let req = ToolRequest {
            op: "delete_everything".to_string(),
            body: String::new(),
        };
        let resp = server.handle_request(&req);
        assert!(!resp.ok);
        assert!(resp.error.unwrap().contains("unsupported"));
    }

    #[test]
    fn serve_processes_newline_delimited_requests() {
        let (server, comments, comment_id) = server();
        let input = "{\"op\":\"update_coordinating_comment\",\"body\":\"hi\"}\n";
        let mut output = Vec::new();
        server
            .serve(Cursor::new(input.as_bytes()), &mut output)
            .unwrap();
        let output = String::from_utf8(output).unwrap();
        assert!(output.contains("\"ok\":true"));
        assert_eq!(comments.body_of(comment_id).unwrap(), "hi");
    }

    #[test]
    fn serve_reports_malformed_json_without_stopping() {
        let (server, ..) = server();
        let input = "not json\n{\"op\":\"update_coordinating_comment\",\"body\":\"ok\"}\n";
        let mut output = Vec::new();
        server
            .serve(Cursor::new(input.as_bytes()), &mut output)
            .unwrap();
        let output = String::from_utf8(output).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("malformed request"));
        assert!(lines[1].contains("\"ok\":true"));
    }
}
