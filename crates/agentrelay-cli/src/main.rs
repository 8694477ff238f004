use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use agentrelay::collaborators::{GithubComments, InMemoryGithubComments, StaticDataFetcher};
use agentrelay::dispatcher::{Dispatcher, DispatcherConfig};
use agentrelay::executor::{AgentCommandConfig, AgentExecutor};
use agentrelay::intake::{Intake, IntakeOutcome};
use agentrelay::modes::ModeRegistry;
use agentrelay_auth::EnvTokenAuth;
use agentrelay_config::{AppConfig, Provider};
use agentrelay_git::GitRepoCloner;
use agentrelay_store::{InMemoryTaskStore, TaskStore};
use agentrelay_webhook::WebhookEvent;

#[derive(Parser, Debug)]
#[command(name = "agentrelay", version)]
#[command(about = "Webhook-driven AI coding agent task dispatcher")]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print resolved environment configuration and collaborator diagnostics.
    Doctor,
    /// Dispatch a single webhook event (read from a JSON file) through the
    /// full intake/dispatcher/executor pipeline and wait for it to settle.
    ///
    /// This is a local/test-grade entrypoint: the real GitHub comment and
    /// HTTP webhook surfaces are out of scope for the core pipeline, so the
    /// comment and issue-data collaborators here are in-process fakes, not
    /// live API clients.
    Run {
        /// Path to a JSON-encoded webhook event (see `agentrelay_webhook::WebhookEvent`).
        event_path: PathBuf,
        /// Directory clones are materialized under.
        #[arg(long, default_value = "./agentrelay-clones")]
        clone_dir: PathBuf,
        /// How long to wait for the task to leave `Pending`/`Running`.
        #[arg(long, default_value_t = 600)]
        wait_secs: u64,
    },
}

struct CliReporter;

impl CliReporter {
    fn info(&self, msg: &str) {
        eprintln!("[info] {msg}");
    }

    fn warn(&self, msg: &str) {
        eprintln!("[warn] {msg}");
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.cmd {
        Commands::Doctor => run_doctor(),
        Commands::Run {
            event_path,
            clone_dir,
            wait_secs,
        } => run_event(&event_path, &clone_dir, Duration::from_secs(wait_secs)),
    }
}

fn run_doctor() -> Result<()> {
    let reporter = CliReporter;

    match agentrelay_config::load() {
        Ok(cfg) => {
            println!("provider: {:?}", cfg.provider);
            println!("port: {}", cfg.port);
            println!("trigger_keyword: {}", cfg.trigger_keyword);
            println!("github_api_base: {}", cfg.github_api_base);
            println!(
                "dispatcher: workers={} queue_size={} max_attempts={}",
                cfg.dispatcher.workers, cfg.dispatcher.queue_size, cfg.dispatcher.max_attempts
            );
            println!(
                "anthropic_api_key: {}",
                if cfg.anthropic_api_key.is_some() { "set" } else { "unset" }
            );
            println!(
                "openai_api_key: {}",
                if cfg.openai_api_key.is_some() { "set" } else { "unset" }
            );
        }
        Err(e) => {
            reporter.warn(&format!("configuration is invalid: {e}"));
        }
    }

    println!();
    print_cmd_version("git", &reporter);
    print_cmd_version(agent_program(Provider::Claude), &reporter);
    print_cmd_version(agent_program(Provider::Codex), &reporter);

    Ok(())
}

fn print_cmd_version(cmd: &str, reporter: &CliReporter) {
    match Command::new(cmd).arg("--version").output() {
        Ok(o) if o.status.success() => {
            let s = String::from_utf8_lossy(&o.stdout).trim().to_string();
            println!("{cmd}: {s}");
        }
        Ok(o) => {
            reporter.warn(&format!(
                "{cmd} --version failed: {}",
                String::from_utf8_lossy(&o.stderr).trim()
            ));
        }
        Err(e) => {
            reporter.warn(&format!("unable to run {cmd} --version: {e}"));
        }
    }
}

fn agent_program(provider: Provider) -> &'static str {
    match provider {
        Provider::Claude => "claude",
        Provider::Codex => "codex",
    }
}

fn agent_command(cfg: &AppConfig) -> AgentCommandConfig {
    let mut args = Vec::new();
    // Claude's `-p` (print mode) reads the prompt from stdin when no
    // positional prompt argument is given; codex's `exec` subcommand takes
    // it via the AGENTRELAY_PROMPT env var instead.
    let (program, stdin_prompt) = match cfg.provider {
        Provider::Claude => {
            args.push("-p".to_string());
            if let Some(model) = &cfg.claude_model {
                args.push("--model".to_string());
                args.push(model.clone());
            }
            ("claude", true)
        }
        Provider::Codex => {
            args.push("exec".to_string());
            if let Some(model) = &cfg.codex_model {
                args.push("--model".to_string());
                args.push(model.clone());
            }
            ("codex", false)
        }
    };
    AgentCommandConfig {
        program: program.to_string(),
        args,
        timeout: Duration::from_secs(30 * 60),
        stdin_prompt,
    }
}

fn run_event(event_path: &PathBuf, clone_dir: &PathBuf, wait: Duration) -> Result<()> {
    let reporter = CliReporter;
    let cfg = agentrelay_config::load().context("loading configuration")?;

    let raw = std::fs::read_to_string(event_path)
        .with_context(|| format!("reading event file {}", event_path.display()))?;
    let event: WebhookEvent =
        serde_json::from_str(&raw).with_context(|| format!("parsing {} as a webhook event", event_path.display()))?;

    let store: Arc<dyn TaskStore> = Arc::new(InMemoryTaskStore::new());
    let comments = Arc::new(InMemoryGithubComments::new());

    let executor = Arc::new(AgentExecutor::new(
        store.clone(),
        Arc::new(EnvTokenAuth::default()),
        Arc::new(GitRepoCloner::new(clone_dir.clone())),
        comments.clone(),
        Arc::new(StaticDataFetcher(Default::default())),
        ModeRegistry::with_defaults(),
        agent_command(&cfg),
        clone_dir.clone(),
    ));

    let dispatcher = Dispatcher::start(
        DispatcherConfig {
            workers: cfg.dispatcher.workers,
            queue_size: cfg.dispatcher.queue_size,
            max_attempts: cfg.dispatcher.max_attempts,
            retry: cfg.dispatcher.to_retry_strategy(),
        },
        store.clone(),
        executor,
    );

    let intake = Intake::new(store.clone(), dispatcher.clone(), cfg.trigger_keyword.clone());
    let outcome = intake.handle(&event);

    let task_id = match outcome {
        IntakeOutcome::NoMatch => {
            println!("no match: comment body did not contain {:?}", cfg.trigger_keyword);
            dispatcher.shutdown(Duration::from_secs(5));
            return Ok(());
        }
        IntakeOutcome::QueueFull { task_id } => {
            println!("queue full; task {task_id} marked failed");
            dispatcher.shutdown(Duration::from_secs(5));
            return Ok(());
        }
        IntakeOutcome::Enqueued { task_id } => task_id,
    };

    reporter.info(&format!("task {task_id} enqueued, waiting up to {wait:?}"));

    let deadline = std::time::Instant::now() + wait;
    let final_task = loop {
        let task = store.get(&task_id).expect("just-enqueued task disappeared");
        if !matches!(
            task.status,
            agentrelay_types::TaskStatus::Pending | agentrelay_types::TaskStatus::Running
        ) {
            break task;
        }
        if std::time::Instant::now() >= deadline {
            reporter.warn("timed out waiting for task to settle");
            break task;
        }
        std::thread::sleep(Duration::from_millis(200));
    };

    println!("status: {:?}", final_task.status);
    println!("attempts: {}", final_task.attempts);
    if let Some(comment_id) = final_task.comment_id {
        if let Some(body) = comments.body_of(comment_id) {
            println!();
            println!("{body}");
        }
    }
    for log in &final_task.logs {
        println!("[{:?}] {}", log.level, log.message);
    }

    dispatcher.shutdown(Duration::from_secs(5));
    Ok(())
}
