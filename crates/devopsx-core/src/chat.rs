//! Conversation loop
//!
//! `Runtime` is the shared context every session, capability and delegation
//! reads from. `ChatSession` drives one transcript: it executes slash
//! commands, asks the provider for replies and runs the invocations found in
//! them.

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::commands;
use crate::config::Config;
use crate::constants::MAX_ITERATIONS;
use crate::delegation::Supervisor;
use crate::error::Error;
use crate::llm::mock::ScriptedProvider;
use crate::llm::{self, CompletionProvider, ReplyOutcome};
use crate::message::Message;
use crate::operator::{AutoConfirm, Operator};
use crate::paths::Paths;
use crate::reduce::ReduceOptions;
use crate::remote::{Connector, RemotePool, SshConnector, TargetStore};
use crate::tools::implementations::register_all_tools;
use crate::tools::{ToolContext, ToolRegistry};
use crate::transcript::Transcript;

/// Marker appended to a reply cut short by the operator
pub const INTERRUPT_MARKER: &str = "... ^C Interrupted";

/// Shared services for every session in the process
pub struct Runtime {
    pub paths: Paths,
    pub config: Config,
    pub registry: ToolRegistry,
    pub remote: Arc<RemotePool>,
    pub supervisor: Supervisor,
    pub provider: Arc<dyn CompletionProvider>,
    pub operator: Arc<dyn Operator>,
}

/// Builder for `Runtime`
pub struct RuntimeBuilder {
    paths: Paths,
    config: Option<Config>,
    provider: Option<Arc<dyn CompletionProvider>>,
    operator: Option<Arc<dyn Operator>>,
    connector: Option<Arc<dyn Connector>>,
}

impl RuntimeBuilder {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            config: None,
            provider: None,
            operator: None,
            connector: None,
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_provider(mut self, provider: Arc<dyn CompletionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_operator(mut self, operator: Arc<dyn Operator>) -> Self {
        self.operator = Some(operator);
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Load config and remote targets, register the built-in capabilities
    /// and start the keepalive task when inside a tokio runtime.
    pub fn build(self) -> anyhow::Result<Arc<Runtime>> {
        let config = match self.config {
            Some(config) => config,
            None => Config::load(&self.paths)?,
        };

        let store = TargetStore::load(&self.paths)?;
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(SshConnector) as Arc<dyn Connector>);
        let remote = Arc::new(RemotePool::new(store, connector, config.remote));
        if tokio::runtime::Handle::try_current().is_ok() {
            remote.spawn_keepalive();
        }

        let registry = ToolRegistry::new();
        register_all_tools(&registry);

        tracing::info!(
            model = %config.model,
            tools = registry.list().len(),
            targets = remote.targets().len(),
            "Runtime ready"
        );

        Ok(Arc::new(Runtime {
            paths: self.paths,
            config,
            registry,
            remote,
            supervisor: Supervisor::new(),
            provider: self
                .provider
                .unwrap_or_else(|| Arc::new(ScriptedProvider::default())),
            operator: self.operator.unwrap_or_else(|| Arc::new(AutoConfirm)),
        }))
    }
}

/// Seed messages for a new transcript: a system message naming the tools
pub fn initial_messages(registry: &ToolRegistry) -> Vec<Message> {
    let mut prompt = String::from(
        "You are devopsx, an assistant that operates machines through tools.\n\
         Invoke a tool with a fenced code block whose language is the tool name.\n\nTools:\n",
    );
    for (name, description, aliases) in registry.list() {
        if aliases.is_empty() {
            prompt.push_str(&format!("- {}: {}\n", name, description));
        } else {
            prompt.push_str(&format!("- {} ({}): {}\n", name, aliases.join(", "), description));
        }
    }
    vec![Message::system(prompt.trim_end()).with_quiet(true)]
}

/// What one `step` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing to do
    Idle,
    /// A slash command ran
    Command,
    /// The model replied. `ran_tools` is set when invocations produced results.
    Replied { ran_tools: bool },
    /// The operator interrupted
    Interrupted,
    /// `/exit` was given
    Exit,
    /// A command or the provider failed; the error was recorded
    Failed,
}

/// Interrupts whatever step is running. Cloned handles stay valid across
/// steps; each step starts on a fresh token once the previous one fired.
#[derive(Clone, Default)]
pub struct InterruptHandle {
    token: Arc<Mutex<CancellationToken>>,
}

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.token.lock().cancel();
    }

    fn current(&self) -> CancellationToken {
        self.token.lock().clone()
    }

    fn reset(&self) {
        let mut token = self.token.lock();
        if token.is_cancelled() {
            *token = CancellationToken::new();
        }
    }
}

pub struct ChatSession {
    runtime: Arc<Runtime>,
    transcript: Transcript,
    confirm: bool,
    stream: bool,
    working_dir: PathBuf,
    interrupt: InterruptHandle,
}

impl ChatSession {
    pub fn new(runtime: Arc<Runtime>, transcript: Transcript) -> Self {
        let confirm = runtime.config.tools.confirm;
        Self {
            runtime,
            transcript,
            confirm,
            stream: true,
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            interrupt: InterruptHandle::default(),
        }
    }

    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    pub fn with_working_dir(mut self, working_dir: PathBuf) -> Self {
        self.working_dir = working_dir;
        self
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn transcript_mut(&mut self) -> &mut Transcript {
        &mut self.transcript
    }

    pub fn confirm(&self) -> bool {
        self.confirm
    }

    pub fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }

    /// Context for running capabilities on behalf of this session
    pub fn tool_context(&self) -> ToolContext {
        ToolContext::new(Arc::clone(&self.runtime))
            .with_confirm(self.confirm)
            .with_cancel(self.interrupt.current())
            .with_working_dir(self.working_dir.clone())
    }

    /// Append to the transcript and show it to the operator
    pub fn append(&mut self, msg: Message) -> anyhow::Result<()> {
        if !msg.quiet {
            self.runtime.operator.show(&msg);
        }
        self.transcript.append(msg)?;
        Ok(())
    }

    /// Show a message without recording it
    pub fn notify(&self, content: impl Into<String>) {
        self.runtime.operator.show(&Message::system(content));
    }

    /// Run every invocation in `msg`, appending the results
    pub async fn execute_invocations(&mut self, msg: &Message) -> anyhow::Result<bool> {
        let ctx = self.tool_context();
        let results = self.runtime.registry.execute_msg(msg, &ctx).await;
        let ran = !results.is_empty();
        for result in results {
            self.append(result)?;
        }
        Ok(ran)
    }

    /// Run one cycle on the transcript's last message
    pub async fn step(&mut self) -> anyhow::Result<StepOutcome> {
        self.interrupt.reset();
        let cancel = self.interrupt.current();

        let Some(last) = self.transcript.last().cloned() else {
            return Ok(StepOutcome::Idle);
        };
        if last.is_command() {
            return match commands::handle(self, &last.content).await {
                Ok(outcome) => Ok(outcome),
                Err(e) => self.record_failure(e),
            };
        }

        let options = ReduceOptions::from(&self.runtime.config.context);
        let messages = self.transcript.prepare_messages(&options);
        let runtime = Arc::clone(&self.runtime);
        let outcome = match llm::reply(
            runtime.provider.as_ref(),
            &messages,
            &runtime.config.model,
            self.stream,
            &runtime.registry,
            &cancel,
            &|_| {},
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(e) => return self.record_failure(e.context("Completion failed")),
        };

        match outcome {
            ReplyOutcome::Interrupted(partial) => {
                self.append(Message::assistant(format!("{}{}", partial, INTERRUPT_MARKER)))?;
                self.append(Message::system("Interrupted"))?;
                Ok(StepOutcome::Interrupted)
            }
            ReplyOutcome::Complete(text) => {
                let reply = Message::assistant(text);
                self.append(reply.clone())?;
                let ran_tools = self.execute_invocations(&reply).await?;
                if cancel.is_cancelled() {
                    return Ok(StepOutcome::Interrupted);
                }
                Ok(StepOutcome::Replied { ran_tools })
            }
        }
    }

    /// Record a failed command or completion as a system message.
    /// Storage failures abort the step instead.
    fn record_failure(&mut self, e: anyhow::Error) -> anyhow::Result<StepOutcome> {
        if let Some(Error::Io { .. } | Error::Corrupt { .. }) = e.downcast_ref::<Error>() {
            return Err(e);
        }
        tracing::warn!(error = %format!("{:#}", e), "Step failed");
        self.append(Message::system(format!("Error: {:#}", e)))?;
        Ok(StepOutcome::Failed)
    }

    /// Keep stepping while replies run tools, up to the iteration bound.
    /// Returns `false` when the session should end.
    pub async fn drive(&mut self) -> anyhow::Result<bool> {
        for _ in 0..MAX_ITERATIONS {
            match self.step().await? {
                StepOutcome::Exit => return Ok(false),
                StepOutcome::Replied { ran_tools: true } => continue,
                StepOutcome::Idle
                | StepOutcome::Command
                | StepOutcome::Interrupted
                | StepOutcome::Failed
                | StepOutcome::Replied { ran_tools: false } => return Ok(true),
            }
        }
        tracing::warn!(limit = MAX_ITERATIONS, "Stopped after reaching the iteration limit");
        Ok(true)
    }

    /// Feed each prompt as a user message and drive the conversation
    pub async fn run(&mut self, prompts: Vec<String>) -> anyhow::Result<()> {
        for prompt in prompts {
            self.append(Message::user(prompt))?;
            if !self.drive().await? {
                break;
            }
        }
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::llm::mock::ScriptedReply;
    use crate::message::Role;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_reply_runs_tool_then_stops() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new([
            ScriptedReply::text("Saving.\n```notes.txt\nremember\n```\n"),
            ScriptedReply::text("Saved the file."),
        ]));
        let runtime = test_runtime_with_provider(dir.path(), provider.clone());
        let mut session = test_session(runtime, dir.path());

        session.run(vec!["write a note".to_string()]).await.unwrap();

        let roles: Vec<Role> = session.transcript().messages().iter().map(|m| m.role).collect();
        assert_eq!(
            roles,
            vec![Role::System, Role::User, Role::Assistant, Role::System, Role::Assistant]
        );
        assert_eq!(session.transcript().messages()[3].content, "Saved to notes.txt");
        assert_eq!(std::fs::read_to_string(dir.path().join("notes.txt")).unwrap(), "remember");
        assert_eq!(provider.call_count(), 2);
    }

    #[tokio::test]
    async fn test_interrupt_records_partial_reply() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new([ScriptedReply::chunks_then_stall([
            "Let me think",
        ])]));
        let runtime = test_runtime_with_provider(dir.path(), provider.clone());
        let mut session = test_session(runtime, dir.path());
        session.append(Message::user("hello")).unwrap();

        let handle = session.interrupt_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            handle.interrupt();
        });
        let outcome = session.step().await.unwrap();

        assert_eq!(outcome, StepOutcome::Interrupted);
        let messages = session.transcript().messages();
        let n = messages.len();
        assert_eq!(messages[n - 2].content, "Let me think... ^C Interrupted");
        assert_eq!(messages[n - 1].role, Role::System);
        assert_eq!(messages[n - 1].content, "Interrupted");

        // The same handle keeps working and the next step starts clean
        provider.push(ScriptedReply::text("Back again."));
        session.append(Message::user("continue")).unwrap();
        assert_eq!(session.step().await.unwrap(), StepOutcome::Replied { ran_tools: false });
        assert_eq!(session.transcript().last().unwrap().content, "Back again.");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_iteration_bound() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::default().with_fallback("```sh\ntrue\n```"));
        let runtime = test_runtime_with_provider(dir.path(), provider.clone());
        let mut session = test_session(runtime, dir.path());

        session.run(vec!["loop forever".to_string()]).await.unwrap();
        assert_eq!(provider.call_count(), MAX_ITERATIONS);
    }

    #[tokio::test]
    async fn test_command_errors_are_recorded() {
        let dir = TempDir::new().unwrap();
        let runtime = test_runtime(dir.path());
        let mut session = test_session(runtime, dir.path());

        session.append(Message::user("/diff nope")).unwrap();
        assert_eq!(session.step().await.unwrap(), StepOutcome::Failed);
        let last = session.transcript().last().unwrap();
        assert_eq!(last.role, Role::System);
        assert!(last.content.starts_with("Error: "));
        assert!(last.content.contains("nope"));

        session.append(Message::user("/undo abc")).unwrap();
        assert!(session.drive().await.unwrap());
        let last = session.transcript().last().unwrap();
        assert!(last.content.contains("Invalid count for undo: abc"));
    }

    #[tokio::test]
    async fn test_provider_error_is_recorded() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new([
            ScriptedReply::Error("overloaded".to_string()),
            ScriptedReply::text("Recovered."),
        ]));
        let runtime = test_runtime_with_provider(dir.path(), provider);
        let mut session = test_session(runtime, dir.path());

        session.run(vec!["hi".to_string()]).await.unwrap();
        let last = session.transcript().last().unwrap();
        assert_eq!(last.role, Role::System);
        assert!(last.content.contains("overloaded"));

        session.run(vec!["again".to_string()]).await.unwrap();
        assert_eq!(session.transcript().last().unwrap().content, "Recovered.");
    }

    #[tokio::test]
    async fn test_context_excludes_hidden_messages() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(ScriptedProvider::new([ScriptedReply::text("ok")]));
        let runtime = test_runtime_with_provider(dir.path(), provider.clone());
        let mut session = test_session(runtime, dir.path());
        session
            .append(Message::user("secret note").with_hidden(true))
            .unwrap();
        session.run(vec!["hi".to_string()]).await.unwrap();

        let seen = provider.seen();
        assert!(seen[0].iter().all(|m| m.content != "secret note"));
        assert_eq!(seen[0].last().unwrap().content, "hi");
    }
}
