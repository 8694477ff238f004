//! Subprocess execution for agentrelay.
//!
//! The poll-loop timeout pattern (`try_wait` plus a deadline check) is
//! carried over verbatim from `shipper::process::run_command_with_timeout`
//! and `shipper-process`'s published twin. What's added on top, because the
//! design calls for it and the teacher never needed it for a one-shot
//! `cargo publish` child, is SIGTERM-then-SIGKILL escalation (grounded on
//! the `nix` crate's process-supervision usage elsewhere in this retrieval
//! pack) and line-by-line streaming of stdout/stderr into a caller-supplied
//! sink, since the executor appends agent output to the task log as it
//! arrives rather than only after the child exits.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERM_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Result of running a subprocess to completion or until it was killed.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Stdout and stderr concatenated, the shape the retry classifier
    /// pattern-matches against.
    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}

/// Which stream a streamed line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Runs `program` with `args` in `dir`, killing it if it outlives
/// `timeout`. Equivalent to [`run_command_streaming`] with a no-op sink.
pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    dir: &Path,
    timeout: Duration,
) -> Result<CommandOutput> {
    run_command_streaming(program, args, dir, &[], None, timeout, |_, _| {})
}

/// Runs `program` with `args` in `dir`, streaming each output line to
/// `on_line` as it is produced, and enforcing `timeout` via
/// SIGTERM-then-SIGKILL escalation.
///
/// `stdin_prompt` is `None` to close the child's stdin immediately, or
/// `Some(prompt)` to write `prompt` and close it, for the agent flavors
/// that read their prompt off stdin rather than an environment variable.
pub fn run_command_streaming(
    program: &str,
    args: &[String],
    dir: &Path,
    envs: &[(String, String)],
    stdin_prompt: Option<&str>,
    timeout: Duration,
    mut on_line: impl FnMut(StreamKind, &str),
) -> Result<CommandOutput> {
    let start = Instant::now();
    let deadline = start + timeout;

    let stdin_mode = if stdin_prompt.is_some() { Stdio::piped() } else { Stdio::null() };
    let mut child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .envs(envs.iter().cloned())
        .stdin(stdin_mode)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let (tx, rx) = mpsc::channel::<(StreamKind, String)>();
    spawn_line_reader(child.stdout.take(), StreamKind::Stdout, tx.clone());
    spawn_line_reader(child.stderr.take(), StreamKind::Stderr, tx.clone());
    drop(tx);

    // Written from its own thread, concurrently with the output readers
    // above, so a prompt larger than the pipe buffer can't deadlock against
    // a child that writes stdout before it has finished reading stdin.
    if let Some(prompt) = stdin_prompt {
        if let Some(mut stdin) = child.stdin.take() {
            let prompt = prompt.to_string();
            std::thread::spawn(move || {
                use std::io::Write as _;
                let _ = stdin.write_all(prompt.as_bytes());
            });
        }
    }

    let mut stdout = String::new();
    let mut stderr = String::new();
    let mut timed_out = false;

    loop {
        while let Ok((kind, line)) = rx.try_recv() {
            on_line(kind, &line);
            match kind {
                StreamKind::Stdout => {
                    stdout.push_str(&line);
                    stdout.push('\n');
                }
                StreamKind::Stderr => {
                    stderr.push_str(&line);
                    stderr.push('\n');
                }
            }
        }

        match child.try_wait().context("failed to poll child status")? {
            Some(_) => break,
            None => {
                if Instant::now() >= deadline {
                    timed_out = true;
                    terminate_with_escalation(&mut child);
                    break;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }

    // Drain whatever the reader threads already buffered after the child
    // exited or was killed.
    while let Ok((kind, line)) = rx.recv_timeout(Duration::from_millis(200)) {
        on_line(kind, &line);
        match kind {
            StreamKind::Stdout => {
                stdout.push_str(&line);
                stdout.push('\n');
            }
            StreamKind::Stderr => {
                stderr.push_str(&line);
                stderr.push('\n');
            }
        }
    }

    let exit_code = child.wait().ok().and_then(|s| s.code());

    Ok(CommandOutput {
        exit_code,
        stdout,
        stderr,
        timed_out,
        duration: start.elapsed(),
    })
}

fn spawn_line_reader<R>(
    pipe: Option<R>,
    kind: StreamKind,
    tx: mpsc::Sender<(StreamKind, String)>,
) where
    R: std::io::Read + Send + 'static,
{
    let Some(pipe) = pipe else { return };
    std::thread::spawn(move || {
        let reader = BufReader::new(pipe);
        for line in reader.lines().map_while(Result::ok) {
            if tx.send((kind, line)).is_err() {
                break;
            }
        }
    });
}

#[cfg(unix)]
fn terminate_with_escalation(child: &mut Child) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    let _ = signal::kill(pid, Signal::SIGTERM);

    let grace_deadline = Instant::now() + TERM_GRACE_PERIOD;
    while Instant::now() < grace_deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    let _ = child.kill();
    let _ = child.wait();
}

#[cfg(not(unix))]
fn terminate_with_escalation(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}
