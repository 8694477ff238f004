//! Agent execution pipeline (C5).
//!
//! `AgentExecutor::run` is the eleven-step operation the design's §4.5 spells
//! out: resolve credentials, clone, let the matched mode post the starter
//! comment and name the branch, checkout, compose a prompt if the mode
//! didn't supply one, run the agent subprocess with its output streamed
//! sanitized into the task log, parse what it produced, finalize the
//! coordinating comment, and always clean up the clone. The
//! poll-then-classify subprocess handling comes straight from
//! `agentrelay-process`; the substring-based failure classification from
//! `agentrelay-retry` is lifted directly from `shipper::engine`'s
//! `classify_cargo_failure` technique.

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agentrelay_auth::AuthProvider;
use agentrelay_git::RepoCloner;
use agentrelay_retry::{classify_agent_failure, extract_hint, non_retryable};
use agentrelay_sanitizer::{escape_html, truncate_bytes};
use agentrelay_store::TaskStore;
use agentrelay_types::{ErrorKind, LogLevel};

use crate::collaborators::{DataFetcher, FetchResult, GithubComments, GithubContext};
use crate::comment_tool::CommentToolServer;
use crate::dispatcher::TaskExecutor;
use crate::modes::ModeRegistry;

/// How the agent subprocess is launched: which binary, fixed flags, and the
/// soft wall-clock budget before SIGTERM/SIGKILL escalation kicks in.
#[derive(Debug, Clone)]
pub struct AgentCommandConfig {
    pub program: String,
    pub args: Vec<String>,
    /// Default 30 minutes per the design's §4.5 step 8 ("implementation-defined").
    pub timeout: Duration,
    /// Whether this agent flavor reads its prompt off stdin rather than the
    /// `AGENTRELAY_PROMPT` environment variable. Step 7 calls for either,
    /// chosen per flavor; when set, stdin carries the prompt and is then
    /// closed, and the env var is omitted.
    pub stdin_prompt: bool,
}

impl Default for AgentCommandConfig {
    fn default() -> Self {
        Self {
            program: "true".to_string(),
            args: Vec::new(),
            timeout: Duration::from_secs(30 * 60),
            stdin_prompt: false,
        }
    }
}

/// A single declared file-change block parsed from the agent's output.
/// Informational only — the executor never pushes on the agent's behalf.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    pub path: String,
    pub content: String,
}

/// Runs one attempt of a task end-to-end against real collaborators.
pub struct AgentExecutor {
    store: Arc<dyn TaskStore>,
    auth: Arc<dyn AuthProvider>,
    cloner: Arc<dyn RepoCloner>,
    comments: Arc<dyn GithubComments>,
    fetcher: Arc<dyn DataFetcher>,
    modes: ModeRegistry,
    command: AgentCommandConfig,
    clone_base_dir: PathBuf,
}

impl AgentExecutor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn TaskStore>,
        auth: Arc<dyn AuthProvider>,
        cloner: Arc<dyn RepoCloner>,
        comments: Arc<dyn GithubComments>,
        fetcher: Arc<dyn DataFetcher>,
        modes: ModeRegistry,
        command: AgentCommandConfig,
        clone_base_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            auth,
            cloner,
            comments,
            fetcher,
            modes,
            command,
            clone_base_dir: clone_base_dir.into(),
        }
    }
}

impl TaskExecutor for AgentExecutor {
    fn run(&self, task_id: &str) -> anyhow::Result<()> {
        let task = self
            .store
            .get(task_id)
            .ok_or_else(|| anyhow::anyhow!("unknown task {task_id}"))?;

        // Step 1: resolve credentials.
        let (token, _expires_at) = self
            .auth
            .installation_token(&task.repo_owner, &task.repo_name)?;

        // Step 2: clone. Clone failures stay plain `anyhow::Error`s so the
        // dispatcher treats them as retryable by default.
        let repo_full_name = format!("{}/{}", task.repo_owner, task.repo_name);
        let initial_branch = if task.base_branch.is_empty() {
            "main"
        } else {
            task.base_branch.as_str()
        };
        let cloned = self
            .cloner
            .clone_repo(&repo_full_name, initial_branch, &token)?;
        let workdir = cloned.workdir.clone();
        let _cleanup = cloned.cleanup; // step 11: dropped on every exit path below

        // Steps 3+4: mode match and prepare (posts the starter comment,
        // names the branch).
        let mode = self
            .modes
            .detect(&task.trigger_body)
            .ok_or_else(|| non_retryable(anyhow::anyhow!("no trigger match")))?;
        let prepared = mode.prepare(&task, &*self.comments)?;
        self.store.set_branch_info(
            task_id,
            prepared.comment_id,
            &prepared.branch,
            &prepared.base_branch,
        );

        // Step 5: checkout.
        agentrelay_git::checkout_branch(&workdir, &prepared.branch, &prepared.base_branch)?;

        // Step 6: compose the agent prompt if the mode left it empty.
        let agent_prompt = if prepared.agent_prompt.trim().is_empty() {
            let ctx = GithubContext {
                owner: task.repo_owner.clone(),
                repo: task.repo_name.clone(),
                number: task.issue_number,
                is_pr: task.is_pr,
            };
            let fetched = self.fetcher.fetch(&ctx)?;
            compose_prompt(&task.trigger_body, &prepared.branch, prepared.comment_id, &fetched)
        } else {
            prepared.agent_prompt.clone()
        };

        // Step 7: launch the agent subprocess, with the comment tool
        // endpoint reachable over a loopback socket for its lifetime.
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let tool_addr = listener.local_addr()?;
        let tool_server = Arc::new(CommentToolServer::new(
            self.comments.clone(),
            &task.repo_owner,
            &task.repo_name,
            prepared.comment_id,
        ));
        let tool_thread = std::thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                if let Ok(reader_stream) = stream.try_clone() {
                    let reader = std::io::BufReader::new(reader_stream);
                    let _ = tool_server.serve(reader, stream);
                }
            }
        });

        let mut envs = vec![
            ("GITHUB_TOKEN".to_string(), token.clone()),
            ("AGENTRELAY_COMMENT_ID".to_string(), prepared.comment_id.to_string()),
            ("AGENTRELAY_TASK_ID".to_string(), task.id.clone()),
            ("AGENTRELAY_COMMENT_TOOL_ADDR".to_string(), tool_addr.to_string()),
        ];
        let stdin_prompt = if self.command.stdin_prompt {
            Some(agent_prompt.as_str())
        } else {
            envs.push(("AGENTRELAY_PROMPT".to_string(), agent_prompt.clone()));
            None
        };

        let store = self.store.clone();
        let task_id_owned = task_id.to_string();
        let output = agentrelay_process::run_command_streaming(
            &self.command.program,
            &self.command.args,
            &workdir,
            &envs,
            stdin_prompt,
            self.command.timeout,
            move |_kind, line| {
                store.add_log(&task_id_owned, LogLevel::Info, &escape_html(line));
            },
        )?;
        let _ = tool_thread.join();

        // Step 8: the timeout itself was already enforced inside
        // `run_command_streaming`; here we only classify the outcome.
        if output.timed_out {
            self.store.add_log(task_id, LogLevel::Error, "agent timed out");
            return Err(anyhow::anyhow!(ErrorKind::Transient(
                "agent timed out".to_string()
            )));
        }

        if !output.success() {
            let combined = output.combined_output();
            let classification = classify_agent_failure(output.exit_code.unwrap_or(-1), &combined);
            let hint = extract_hint(&combined);
            self.store.add_log(task_id, LogLevel::Hint, &hint);
            let err = anyhow::anyhow!(ErrorKind::AgentFailure {
                exit_code: output.exit_code.unwrap_or(-1),
                output_excerpt: truncate_bytes(&combined, 2000),
            });
            return if classification.retryable {
                Err(err)
            } else {
                Err(non_retryable(err))
            };
        }

        // Step 9: parse the agent's declared output.
        let combined = output.combined_output();
        let file_blocks = parse_file_blocks(&combined);
        let summary = parse_summary(&combined);
        if file_blocks.is_empty() && summary.is_none() {
            let attempts = self.store.get(task_id).map(|t| t.attempts).unwrap_or(1);
            let err = anyhow::anyhow!(ErrorKind::ParseEmpty);
            return if attempts <= 1 {
                Err(err)
            } else {
                Err(non_retryable(err))
            };
        }

        // Step 10: finalize the coordinating comment.
        let final_body = render_final_comment(&prepared.branch, summary.as_deref(), &file_blocks);
        self.comments
            .update(&task.repo_owner, &task.repo_name, prepared.comment_id, &final_body)
            .map_err(|e| anyhow::anyhow!(e.to_string()))?;

        Ok(())
        // Step 11: `_cleanup` is dropped here (and on every early return
        // above), removing the clone directory.
    }
}

fn compose_prompt(trigger_body: &str, branch: &str, comment_id: u64, fetched: &FetchResult) -> String {
    let mut prompt = String::new();
    prompt.push_str("## Request\n");
    prompt.push_str(trigger_body);
    prompt.push_str("\n\n## Context\n");
    prompt.push_str(&format!("Branch: {branch}\nCoordinating comment: {comment_id}\n\n"));
    if !fetched.body.is_empty() {
        prompt.push_str("### Issue/PR body\n");
        prompt.push_str(&fetched.body);
        prompt.push('\n');
    }
    if !fetched.comments.is_empty() {
        prompt.push_str("\n### Comments\n");
        for c in &fetched.comments {
            prompt.push_str("- ");
            prompt.push_str(c);
            prompt.push('\n');
        }
    }
    if !fetched.reviews.is_empty() {
        prompt.push_str("\n### Review comments\n");
        for r in &fetched.reviews {
            prompt.push_str("- ");
            prompt.push_str(r);
            prompt.push('\n');
        }
    }
    if !fetched.changed_files.is_empty() {
        prompt.push_str("\n### Changed files\n");
        for f in &fetched.changed_files {
            prompt.push_str(&format!("- {} ({})\n", f.path, f.sha));
        }
    }
    prompt
}

/// Extracts `<file path="…"><content>…</content></file>` blocks from the
/// agent's output. Malformed or unterminated blocks are skipped rather than
/// treated as an error — the executor only needs what did parse cleanly.
pub fn parse_file_blocks(output: &str) -> Vec<FileBlock> {
    let mut blocks = Vec::new();
    let mut rest = output;

    while let Some(start) = rest.find("<file path=\"") {
        let after_attr = &rest[start + "<file path=\"".len()..];
        let Some(quote_end) = after_attr.find('"') else {
            break;
        };
        let path = after_attr[..quote_end].to_string();
        let after_path = &after_attr[quote_end..];

        let Some(content_open) = after_path.find("<content>") else {
            rest = after_path;
            continue;
        };
        let after_content_open = &after_path[content_open + "<content>".len()..];
        let Some(content_end) = after_content_open.find("</content>") else {
            rest = after_content_open;
            continue;
        };
        let content = after_content_open[..content_end].to_string();
        let after_content = &after_content_open[content_end + "</content>".len()..];

        blocks.push(FileBlock { path, content });

        match after_content.find("</file>") {
            Some(close) => rest = &after_content[close + "</file>".len()..],
            None => rest = after_content,
        }
    }

    blocks
}

/// Extracts a summary per the design's fallback chain: a `<summary>` tag,
/// then a markdown `## Summary` section, then the final non-empty
/// paragraph.
pub fn parse_summary(output: &str) -> Option<String> {
    if let Some(start) = output.find("<summary>") {
        let after = &output[start + "<summary>".len()..];
        if let Some(end) = after.find("</summary>") {
            let text = after[..end].trim();
            if !text.is_empty() {
                return Some(text.to_string());
            }
        }
    }

    if let Some(start) = output.find("## Summary") {
        let after = &output[start + "## Summary".len()..];
        let end = after.find("\n## ").unwrap_or(after.len());
        let text = after[..end].trim();
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }

    output
        .split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .next_back()
        .map(str::to_string)
}

fn render_final_comment(branch: &str, summary: Option<&str>, file_blocks: &[FileBlock]) -> String {
    let mut body = String::new();
    body.push_str("agentrelay finished this task.\n\n");
    if let Some(summary) = summary {
        body.push_str("## Summary\n");
        body.push_str(summary);
        body.push_str("\n\n");
    }
    if !file_blocks.is_empty() {
        body.push_str("## Files touched\n");
        for block in file_blocks {
            body.push_str(&format!("- `{}`\n", block.path));
        }
        body.push('\n');
    }
    body.push_str(&format!("Branch: `{branch}`\n"));
    body
}
