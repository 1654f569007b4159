//! Capability registry and the execution boundary
//!
//! Capabilities are looked up by name or block-type alias. Execution never
//! fails outward: errors, panics and timeouts inside a capability become a
//! single system message.

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::chat::Runtime;
use crate::error::Error;
use crate::message::{Message, Role};
use crate::operator::Operator;
use crate::tools::tooluse::{self, ToolUse};

/// Context for capability execution
pub struct ToolContext {
    pub runtime: Arc<Runtime>,
    /// Ask the operator before side effects
    pub confirm: bool,
    /// Fired when the operator interrupts
    pub cancel: CancellationToken,
    pub working_dir: PathBuf,
    /// Optional per-call timeout
    pub timeout: Option<Duration>,
}

impl ToolContext {
    pub fn new(runtime: Arc<Runtime>) -> Self {
        let confirm = runtime.config.tools.confirm;
        Self {
            runtime,
            confirm,
            cancel: CancellationToken::new(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            timeout: None,
        }
    }

    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_working_dir(mut self, working_dir: PathBuf) -> Self {
        self.working_dir = working_dir;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn operator(&self) -> &dyn Operator {
        self.runtime.operator.as_ref()
    }

    /// Ask the operator, unless confirmation is disabled
    pub async fn ask(&self, question: &str) -> bool {
        if !self.confirm {
            tracing::debug!(question, "Skipping confirmation");
            return true;
        }
        self.operator().confirm(question).await
    }

    /// Show the payload, then ask
    pub async fn preview_and_ask(&self, title: &str, body: &str, question: &str) -> bool {
        if self.confirm {
            self.operator().preview(title, body);
        }
        self.ask(question).await
    }

    /// Resolve a path relative to the working directory, expanding `~`
    pub fn resolve_path(&self, path: &str) -> PathBuf {
        let expanded = match path.strip_prefix("~/") {
            Some(rest) => dirs::home_dir()
                .map(|home| home.join(rest))
                .unwrap_or_else(|| PathBuf::from(path)),
            None => PathBuf::from(path),
        };
        if expanded.is_absolute() {
            expanded
        } else {
            self.working_dir.join(expanded)
        }
    }
}

/// A named, registered unit of executable behavior
#[async_trait]
pub trait Capability: Send + Sync {
    /// Canonical name
    fn name(&self) -> &str;

    /// One-line summary shown by `/tools`
    fn description(&self) -> &str;

    /// Extra fence languages / tag names that resolve to this capability
    fn block_types(&self) -> &[&str] {
        &[]
    }

    /// Runs once at registration. A failing capability is not loaded.
    fn init(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Execute one invocation, producing zero or more system messages
    async fn execute(&self, tooluse: &ToolUse, ctx: &ToolContext) -> anyhow::Result<Vec<Message>>;
}

/// Registry for capabilities, keyed by name with an alias index
pub struct ToolRegistry {
    tools: RwLock<BTreeMap<String, Arc<dyn Capability>>>,
    aliases: RwLock<HashMap<String, String>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(BTreeMap::new()),
            aliases: RwLock::new(HashMap::new()),
        }
    }

    /// Initialize and register a capability
    pub fn register(&self, tool: Arc<dyn Capability>) -> anyhow::Result<()> {
        let name = tool.name().to_string();
        if let Err(e) = tool.init() {
            tracing::warn!(tool = %name, error = %e, "Capability failed to initialize");
            return Err(e);
        }

        {
            let mut aliases = self.aliases.write();
            aliases.insert(name.clone(), name.clone());
            for alias in tool.block_types() {
                aliases.insert((*alias).to_string(), name.clone());
            }
        }
        self.tools.write().insert(name.clone(), tool);
        tracing::debug!(tool = %name, "Registered capability");
        Ok(())
    }

    /// Canonical name for a block type or tag name
    pub fn resolve(&self, block_type: &str) -> Option<String> {
        self.aliases.read().get(block_type).cloned()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Capability>> {
        let canonical = self.resolve(name)?;
        self.tools.read().get(&canonical).cloned()
    }

    /// `(name, description, block types)` for every loaded capability
    pub fn list(&self) -> Vec<(String, String, Vec<String>)> {
        self.tools
            .read()
            .values()
            .map(|t| {
                (
                    t.name().to_string(),
                    t.description().to_string(),
                    t.block_types().iter().map(ToString::to_string).collect(),
                )
            })
            .collect()
    }

    /// Every invocation in `content`, in document order
    pub fn parse(&self, content: &str) -> Vec<Result<ToolUse, Error>> {
        tooluse::parse_invocations(content, &|name| self.resolve(name))
    }

    /// Streaming predicate: does `content` hold a complete supported invocation?
    pub fn has_complete_invocation(&self, content: &str) -> bool {
        tooluse::has_complete_invocation(content, &|name| self.resolve(name))
    }

    /// Execute one invocation. Always returns messages, never an error.
    pub async fn execute(&self, tooluse: &ToolUse, ctx: &ToolContext) -> Vec<Message> {
        let Some(tool) = self.get(&tooluse.tool) else {
            let err = Error::unregistered("tool", &tooluse.tool, "Use /tools to list the available tools.");
            return vec![Message::system(format!("An error occurred: {}", err))];
        };

        tracing::info!(tool = %tooluse.tool, args = ?tooluse.args, "Executing capability");
        let start = Instant::now();
        let run = AssertUnwindSafe(tool.execute(tooluse, ctx)).catch_unwind();

        let outcome = match ctx.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(tool = %tooluse.tool, timeout_secs = limit.as_secs(), "Capability timed out");
                    return vec![Message::system(format!(
                        "An error occurred: {}",
                        Error::Timeout(limit)
                    ))];
                }
            },
            None => run.await,
        };

        let messages = match outcome {
            Ok(Ok(messages)) => messages,
            Ok(Err(e)) => {
                tracing::warn!(tool = %tooluse.tool, error = %e, "Capability failed");
                vec![Message::system(format!("An error occurred: {}", e))]
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "capability panicked".to_string());
                tracing::error!(tool = %tooluse.tool, reason = %reason, "Capability panicked");
                vec![Message::system(format!("An error occurred: {}", reason))]
            }
        };

        tracing::debug!(
            tool = %tooluse.tool,
            elapsed_ms = start.elapsed().as_millis() as u64,
            results = messages.len(),
            "Capability finished"
        );
        messages
    }

    /// Execute every invocation in an assistant message, in order.
    ///
    /// Parse failures become system messages and do not stop the rest. An
    /// interrupt stops before the next invocation.
    pub async fn execute_msg(&self, msg: &Message, ctx: &ToolContext) -> Vec<Message> {
        if msg.role != Role::Assistant {
            return Vec::new();
        }

        let mut results = Vec::new();
        for item in self.parse(&msg.content) {
            if ctx.cancel.is_cancelled() {
                results.push(Message::system("Interrupted"));
                break;
            }
            match item {
                Ok(tooluse) => results.extend(self.execute(&tooluse, ctx).await),
                Err(e) => {
                    tracing::warn!(error = %e, "Skipping malformed tool use");
                    results.push(Message::system(format!("An error occurred: {}", e)));
                }
            }
        }
        results
    }
}
