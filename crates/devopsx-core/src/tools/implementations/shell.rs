//! Shell capability - run the payload with `sh -c` on the local machine

use async_trait::async_trait;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use regex::Regex;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::message::Message;
use crate::tools::output::CommandOutput;
use crate::tools::registry::{Capability, ToolContext};
use crate::tools::tooluse::ToolUse;

/// Raw bytes kept per stream; rendering elides further
const CAPTURE_LIMIT: usize = 2 * 1024 * 1024;
/// How long to keep reading pipes after the process ended
const DRAIN_GRACE: Duration = Duration::from_secs(2);
/// Time between SIGTERM and SIGKILL for a stopped process group
const KILL_GRACE: Duration = Duration::from_millis(500);

static ANSI_ESCAPE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b\[[\?0-9;]*[a-zA-Z]|\x1b\][^\x07]*\x07")
        .unwrap_or_else(|e| unreachable!("invalid ANSI pattern: {e}"))
});

pub struct ShellTool;

/// Bytes read from one pipe, capped at `CAPTURE_LIMIT`
#[derive(Default)]
struct Capture {
    bytes: Vec<u8>,
    skipped: usize,
}

impl Capture {
    fn extend(&mut self, chunk: &[u8]) {
        let room = CAPTURE_LIMIT.saturating_sub(self.bytes.len());
        let kept = chunk.len().min(room);
        self.bytes.extend_from_slice(&chunk[..kept]);
        self.skipped += chunk.len() - kept;
    }

    fn into_text(self) -> String {
        let mut text = strip_ansi(&String::from_utf8_lossy(&self.bytes));
        if self.skipped > 0 {
            text.push_str(&format!("\n[{} more bytes not captured]\n", self.skipped));
        }
        text
    }
}

/// Strip ANSI escape sequences from text
pub(crate) fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// How a local process ended
pub(crate) enum ProcessEnd {
    Exited(CommandOutput),
    TimedOut(CommandOutput),
    Interrupted(CommandOutput),
}

/// Read `pipe` to EOF into a shared capture. The capture stays readable if
/// the reader has to be abandoned.
fn spawn_capture<R>(pipe: Option<R>) -> (Arc<Mutex<Capture>>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let capture = Arc::new(Mutex::new(Capture::default()));
    let sink = Arc::clone(&capture);
    let handle = tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => sink.lock().extend(&chunk[..n]),
                Err(e) => {
                    tracing::debug!(error = %e, "Pipe read failed");
                    break;
                }
            }
        }
    });
    (capture, handle)
}

/// Wait for a reader to hit EOF. Background children that keep the pipe
/// open would block forever, so the reader is dropped after `DRAIN_GRACE`.
async fn finish_capture(capture: Arc<Mutex<Capture>>, mut reader: JoinHandle<()>) -> String {
    if timeout(DRAIN_GRACE, &mut reader).await.is_err() {
        tracing::debug!("Pipe still open after process exit, abandoning reader");
        reader.abort();
    }
    std::mem::take(&mut *capture.lock()).into_text()
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: &str) {
    let _ = std::process::Command::new("kill")
        .args(["-s", signal, "--", &format!("-{}", pid)])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
}

/// Stop the child and everything it started in its process group
async fn stop_process_group(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, "TERM");
        let _ = timeout(KILL_GRACE, child.wait()).await;
        signal_group(pid, "KILL");
    }
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Child already gone");
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return 128 + sig;
        }
    }
    status.code().unwrap_or(-1)
}

/// Run a program to completion, capturing stdout and stderr separately.
pub(crate) async fn run_process(
    mut cmd: Command,
    stdin: Option<&str>,
    limit: Duration,
    cancel: &CancellationToken,
) -> anyhow::Result<ProcessEnd> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .env("NO_COLOR", "1");

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| anyhow::anyhow!("Failed to spawn command: {}", e))?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input.as_bytes()).await?;
        drop(pipe);
    }

    let (stdout, stdout_reader) = spawn_capture(child.stdout.take());
    let (stderr, stderr_reader) = spawn_capture(child.stderr.take());

    enum Ending {
        Exited(i32),
        TimedOut,
        Interrupted,
    }

    let ending = tokio::select! {
        result = timeout(limit, child.wait()) => match result {
            Ok(Ok(status)) => Ending::Exited(exit_code(status)),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Process wait failed");
                Ending::Exited(-1)
            }
            Err(_) => Ending::TimedOut,
        },
        _ = cancel.cancelled() => Ending::Interrupted,
    };
    if !matches!(ending, Ending::Exited(_)) {
        stop_process_group(&mut child).await;
    }

    let mut output = CommandOutput {
        status: -1,
        stdout: finish_capture(stdout, stdout_reader).await,
        stderr: finish_capture(stderr, stderr_reader).await,
    };

    Ok(match ending {
        Ending::Exited(status) => {
            output.status = status;
            ProcessEnd::Exited(output)
        }
        Ending::TimedOut => ProcessEnd::TimedOut(output),
        Ending::Interrupted => ProcessEnd::Interrupted(output),
    })
}

/// Render a finished process the same way for every local capability
pub(crate) fn render_process_end(command: &str, end: ProcessEnd, limit: Duration) -> Message {
    match end {
        ProcessEnd::Exited(output) => Message::system(output.render(command)),
        ProcessEnd::TimedOut(output) => Message::system(format!(
            "{}Command timed out after {} seconds",
            output.render(command),
            limit.as_secs()
        )),
        ProcessEnd::Interrupted(output) => {
            Message::system(format!("{}Interrupted", output.render(command)))
        }
    }
}

pub(crate) fn shell_command(command: &str, working_dir: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    if working_dir.is_dir() {
        cmd.current_dir(working_dir);
    }
    cmd
}

/// Run a command locally after confirmation. Also backs `/shell`.
pub(crate) async fn execute_shell(command: &str, ctx: &ToolContext) -> anyhow::Result<Vec<Message>> {
    let command = command.trim();
    if command.is_empty() {
        return Ok(vec![Message::system("No command given")]);
    }

    if !ctx.preview_and_ask("Shell", command, "Run command?").await {
        return Ok(vec![Message::system("Shell execution cancelled.")]);
    }

    tracing::info!(command = %command, "Executing shell command");
    let limit = ctx
        .timeout
        .unwrap_or_else(|| ctx.runtime.config.tools.shell_timeout());
    let end = run_process(
        shell_command(command, &ctx.working_dir),
        None,
        limit,
        &ctx.cancel,
    )
    .await?;
    Ok(vec![render_process_end(command, end, limit)])
}

#[async_trait]
impl Capability for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute shell commands on the local machine"
    }

    fn block_types(&self) -> &[&str] {
        &["sh", "bash", "zsh"]
    }

    async fn execute(&self, tooluse: &ToolUse, ctx: &ToolContext) -> anyhow::Result<Vec<Message>> {
        execute_shell(&tooluse.content, ctx).await
    }
}
