//! Collaborator interfaces the executor and comment tool consume.
//!
//! These mirror the design's §6 "Collaborator interfaces" table. None of
//! them ship a production HTTP implementation here — that's explicitly out
//! of scope (§1) — but each carries a simple in-memory fake so the pipeline
//! is exercisable end-to-end in tests, the same role `shipper-webhook`'s
//! `tiny_http`-backed fixture server plays for that crate's tests.

use std::collections::HashMap;
use std::sync::Mutex;

/// Error surfaced by [`GithubComments`], distinguishing retryable
/// (5xx/network) failures from terminal (4xx) ones per the design's §4.6.
#[derive(Debug, Clone)]
pub enum CommentError {
    Http { status: u16, message: String },
    Network(String),
}

impl std::fmt::Display for CommentError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommentError::Http { status, message } => write!(f, "http {status}: {message}"),
            CommentError::Network(message) => write!(f, "network error: {message}"),
        }
    }
}

impl std::error::Error for CommentError {}

impl CommentError {
    pub fn is_retryable(&self) -> bool {
        match self {
            CommentError::Http { status, .. } => *status >= 500,
            CommentError::Network(_) => true,
        }
    }
}

/// The single GitHub comment that mirrors a task's progress and outcome.
pub trait GithubComments: Send + Sync {
    fn create(&self, owner: &str, repo: &str, number: u64, body: &str) -> Result<u64, CommentError>;
    fn update(&self, owner: &str, repo: &str, comment_id: u64, body: &str) -> Result<(), CommentError>;
    fn add_label(&self, owner: &str, repo: &str, number: u64, label: &str) -> Result<(), CommentError>;
}

/// Issue/PR context fetched for prompt composition.
#[derive(Debug, Clone, Default)]
pub struct FetchResult {
    pub body: String,
    pub comments: Vec<String>,
    pub reviews: Vec<String>,
    pub changed_files: Vec<ChangedFile>,
}

#[derive(Debug, Clone)]
pub struct ChangedFile {
    pub path: String,
    pub sha: String,
}

/// Reference identifying the issue/PR a task targets, threaded through to
/// [`DataFetcher::fetch`].
#[derive(Debug, Clone)]
pub struct GithubContext {
    pub owner: String,
    pub repo: String,
    pub number: u64,
    pub is_pr: bool,
}

/// Fetches issue/PR metadata, comments, reviews, and changed files with
/// bounded pagination (cursor-bounded to 50 iterations per collection, per
/// the design's §6).
pub trait DataFetcher: Send + Sync {
    fn fetch(&self, ctx: &GithubContext) -> anyhow::Result<FetchResult>;
}

/// An in-memory [`GithubComments`] double: every call succeeds and is
/// recorded for assertions. Used by tests and by the CLI's local-simulation
/// mode, where there is no real GitHub API to call.
#[derive(Default)]
pub struct InMemoryGithubComments {
    next_id: Mutex<u64>,
    bodies: Mutex<HashMap<u64, String>>,
    labels: Mutex<HashMap<(String, String, u64), Vec<String>>>,
}

impl InMemoryGithubComments {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1),
            bodies: Mutex::new(HashMap::new()),
            labels: Mutex::new(HashMap::new()),
        }
    }

    pub fn body_of(&self, comment_id: u64) -> Option<String> {
        self.bodies.lock().expect("poisoned").get(&comment_id).cloned()
    }
}

impl GithubComments for InMemoryGithubComments {
    fn create(&self, _owner: &str, _repo: &str, _number: u64, body: &str) -> Result<u64, CommentError> {
        let mut next_id = self.next_id.lock().expect("poisoned");
        let id = *next_id;
        *next_id += 1;
        self.bodies.lock().expect("poisoned").insert(id, body.to_string());
        Ok(id)
    }

    fn update(&self, _owner: &str, _repo: &str, comment_id: u64, body: &str) -> Result<(), CommentError> {
        self.bodies
            .lock()
            .expect("poisoned")
            .insert(comment_id, body.to_string());
        Ok(())
    }

    fn add_label(&self, owner: &str, repo: &str, number: u64, label: &str) -> Result<(), CommentError> {
        self.labels
            .lock()
            .expect("poisoned")
            .entry((owner.to_string(), repo.to_string(), number))
            .or_default()
            .push(label.to_string());
        Ok(())
    }
}

/// An in-memory [`DataFetcher`] double returning a fixed result.
pub struct StaticDataFetcher(pub FetchResult);

impl DataFetcher for StaticDataFetcher {
    fn fetch(&self, _ctx: &GithubContext) -> anyhow::Result<FetchResult> {
        Ok(self.0.clone())
    }
}
