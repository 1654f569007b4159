//! Slash commands
//!
//! A user message starting with `/` is handled here instead of being sent to
//! the model. The command message itself is discarded from the transcript;
//! only what the command produces is kept.

use tokio::fs;

use crate::chat::{ChatSession, StepOutcome};
use crate::constants::CMDFIX;
use crate::message::{len_tokens, Message, MessageDocument, Role};
use crate::tools::codeblock::extract_codeblocks;
use crate::tools::implementations::python::execute_python;
use crate::tools::implementations::shell::execute_shell;
use crate::transcript::generate_name;

const SUMMARIZE_PROMPT: &str =
    "Summarize the conversation so far in a few sentences. Keep decisions, open problems and file names.";

/// A slash command as listed by `/help`
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub primary: &'static str,
    pub aliases: &'static [&'static str],
    pub usage: &'static str,
    pub description: &'static str,
}

/// All available slash commands
pub fn all_commands() -> Vec<CommandSpec> {
    vec![
        CommandSpec {
            primary: "undo",
            aliases: &[],
            usage: "[n]",
            description: "Undo the last n messages (default 1)",
        },
        CommandSpec {
            primary: "log",
            aliases: &[],
            usage: "[--hidden]",
            description: "Show the conversation",
        },
        CommandSpec {
            primary: "edit",
            aliases: &[],
            usage: "",
            description: "Edit the conversation as TOML",
        },
        CommandSpec {
            primary: "rename",
            aliases: &[],
            usage: "<name|auto>",
            description: "Rename the conversation",
        },
        CommandSpec {
            primary: "fork",
            aliases: &[],
            usage: "<name>",
            description: "Copy the conversation to a new name",
        },
        CommandSpec {
            primary: "branch",
            aliases: &[],
            usage: "<name>",
            description: "Switch to a branch, creating it from the current one",
        },
        CommandSpec {
            primary: "diff",
            aliases: &[],
            usage: "<branch>",
            description: "Compare the current branch with another",
        },
        CommandSpec {
            primary: "summarize",
            aliases: &[],
            usage: "",
            description: "Ask the model for a summary of the conversation",
        },
        CommandSpec {
            primary: "save",
            aliases: &[],
            usage: "<path>",
            description: "Save the last code block the assistant wrote",
        },
        CommandSpec {
            primary: "shell",
            aliases: &["sh"],
            usage: "<command>",
            description: "Run a shell command",
        },
        CommandSpec {
            primary: "python",
            aliases: &["py"],
            usage: "<code>",
            description: "Run Python code",
        },
        CommandSpec {
            primary: "replay",
            aliases: &[],
            usage: "",
            description: "Re-run every tool use in the conversation",
        },
        CommandSpec {
            primary: "impersonate",
            aliases: &[],
            usage: "<text>",
            description: "Add an assistant message and run its tool uses",
        },
        CommandSpec {
            primary: "tokens",
            aliases: &[],
            usage: "",
            description: "Show the token count of the conversation",
        },
        CommandSpec {
            primary: "tools",
            aliases: &[],
            usage: "",
            description: "List available tools",
        },
        CommandSpec {
            primary: "agents",
            aliases: &[],
            usage: "",
            description: "List remote targets and their status",
        },
        CommandSpec {
            primary: "help",
            aliases: &[],
            usage: "",
            description: "Show this help",
        },
        CommandSpec {
            primary: "exit",
            aliases: &[],
            usage: "",
            description: "Exit",
        },
    ]
}

/// Canonical command name for `name`, if it is known
pub fn resolve_command(name: &str) -> Option<&'static str> {
    all_commands()
        .into_iter()
        .find(|c| c.primary == name || c.aliases.contains(&name))
        .map(|c| c.primary)
}

pub fn help_text() -> String {
    let mut out = String::from("Available commands:\n");
    for command in all_commands() {
        let mut names = format!("{}{}", CMDFIX, command.primary);
        for alias in command.aliases {
            names.push_str(&format!(", {}{}", CMDFIX, alias));
        }
        if !command.usage.is_empty() {
            names.push(' ');
            names.push_str(command.usage);
        }
        out.push_str(&format!("  {:<28} {}\n", names, command.description));
    }
    out.trim_end().to_string()
}

/// Split `/name rest` into the name and the remaining text
fn split_command(text: &str) -> (&str, &str) {
    let body = text.trim().trim_start_matches(CMDFIX);
    match body.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (body, ""),
    }
}

/// Execute the command held by the transcript's last message
pub async fn handle(session: &mut ChatSession, text: &str) -> anyhow::Result<StepOutcome> {
    let (name, rest) = split_command(text);
    tracing::info!(command = %name, "Running command");

    // `undo` consumes its own command message
    if name != "undo" {
        session.transcript_mut().discard_last_command()?;
    }

    let Some(command) = resolve_command(name) else {
        session.notify(format!("Unknown command: {}{}\n\n{}", CMDFIX, name, help_text()));
        return Ok(StepOutcome::Command);
    };

    match command {
        "undo" => undo(session, rest)?,
        "log" => show_log(session, rest == "--hidden"),
        "edit" => edit(session).await?,
        "rename" => rename(session, rest).await?,
        "fork" => fork(session, rest)?,
        "branch" => branch(session, rest)?,
        "diff" => diff(session, rest)?,
        "summarize" => summarize(session).await?,
        "save" => save_last_block(session, rest).await?,
        "shell" => {
            let ctx = session.tool_context();
            for msg in execute_shell(rest, &ctx).await? {
                session.append(msg)?;
            }
        }
        "python" => {
            let ctx = session.tool_context();
            for msg in execute_python(rest, &ctx).await? {
                session.append(msg)?;
            }
        }
        "replay" => replay(session).await,
        "impersonate" => impersonate(session, rest).await?,
        "tokens" => {
            let tokens = len_tokens(session.transcript().messages());
            session.notify(format!("Tokens used: {}", tokens));
        }
        "tools" => list_tools(session),
        "agents" => list_agents(session).await,
        "help" => session.notify(help_text()),
        "exit" => return Ok(StepOutcome::Exit),
        _ => session.notify(format!("Unknown command: {}{}", CMDFIX, name)),
    }
    Ok(StepOutcome::Command)
}

fn undo(session: &mut ChatSession, rest: &str) -> anyhow::Result<()> {
    let n = if rest.is_empty() {
        1
    } else {
        rest.parse::<usize>()
            .map_err(|_| anyhow::anyhow!("Invalid count for undo: {}", rest))?
    };
    let removed = session.transcript_mut().undo(n, false)?;
    for msg in &removed {
        session.notify(format!("Undid: {}", msg.format_line(Some(60))));
    }
    Ok(())
}

fn show_log(session: &ChatSession, show_hidden: bool) {
    let lines: Vec<String> = session
        .transcript()
        .messages()
        .iter()
        .filter(|m| show_hidden || !m.hidden)
        .map(|m| m.format_line(None))
        .collect();
    session.notify(lines.join("\n"));
}

async fn edit(session: &mut ChatSession) -> anyhow::Result<()> {
    let document = MessageDocument::to_toml(session.transcript().messages())?;
    let edited = session.runtime().operator.edit_text(&document).await?;
    if edited == document {
        session.notify("No changes made.");
        return Ok(());
    }
    match MessageDocument::from_toml(&edited) {
        Ok(messages) => {
            let count = messages.len();
            session.transcript_mut().edit(messages)?;
            session.notify(format!("Applied edit ({} messages).", count));
        }
        Err(e) => {
            tracing::warn!(error = %e, "Edited conversation did not parse");
            session.notify(format!("Edit discarded: {}", e));
        }
    }
    Ok(())
}

async fn rename(session: &mut ChatSession, rest: &str) -> anyhow::Result<()> {
    if rest.is_empty() || rest == "auto" {
        let name = generate_name();
        let question = format!("Rename conversation to {}?", name);
        if !session.tool_context().ask(&question).await {
            session.notify("Rename cancelled.");
            return Ok(());
        }
        session.transcript_mut().rename(&name, false)?;
    } else {
        session.transcript_mut().rename(rest, false)?;
    }
    let name = session.transcript().name().to_string();
    session.notify(format!("Renamed conversation to {}", name));
    Ok(())
}

fn fork(session: &mut ChatSession, rest: &str) -> anyhow::Result<()> {
    if rest.is_empty() {
        session.notify("Usage: /fork <name>");
        return Ok(());
    }
    let path = session.transcript().fork(rest)?;
    session.notify(format!("Forked conversation to {}", path.display()));
    Ok(())
}

fn branch(session: &mut ChatSession, rest: &str) -> anyhow::Result<()> {
    if rest.is_empty() {
        let branches = session.transcript().branches().join(", ");
        let current = session.transcript().current_branch().to_string();
        session.notify(format!("On branch {}. Branches: {}", current, branches));
        return Ok(());
    }
    session.transcript_mut().branch(rest)?;
    session.notify(format!("Switched to branch {}", rest));
    Ok(())
}

fn diff(session: &mut ChatSession, rest: &str) -> anyhow::Result<()> {
    if rest.is_empty() {
        session.notify("Usage: /diff <branch>");
        return Ok(());
    }
    match session.transcript().diff(rest)? {
        Some(diff) => session.notify(diff),
        None => session.notify(format!("No difference from {}", rest)),
    }
    Ok(())
}

async fn summarize(session: &mut ChatSession) -> anyhow::Result<()> {
    let options = crate::reduce::ReduceOptions::from(&session.runtime().config.context);
    let mut messages = session.transcript().prepare_messages(&options);
    messages.push(Message::user(SUMMARIZE_PROMPT));

    let runtime = std::sync::Arc::clone(session.runtime());
    let summary = runtime
        .provider
        .complete(&messages, &runtime.config.model)
        .await?;
    session.notify(summary);
    Ok(())
}

async fn save_last_block(session: &mut ChatSession, rest: &str) -> anyhow::Result<()> {
    if rest.is_empty() {
        session.notify("Usage: /save <path>");
        return Ok(());
    }

    let block = session
        .transcript()
        .messages()
        .iter()
        .rev()
        .filter(|m| m.role == Role::Assistant)
        .find_map(|m| extract_codeblocks(&m.content).pop());
    let Some(block) = block else {
        session.notify("No code block found to save.");
        return Ok(());
    };

    let ctx = session.tool_context();
    let path = ctx.resolve_path(rest);
    if path.exists() && !ctx.ask("File already exists, overwrite?").await {
        session.notify("Save cancelled.");
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::write(&path, &block.content).await?;
    tracing::info!(path = %path.display(), "Saved last code block");
    session.notify(format!("Saved code block to {}", path.display()));
    Ok(())
}

/// Results are shown but not recorded
async fn replay(session: &mut ChatSession) {
    let assistant: Vec<Message> = session
        .transcript()
        .messages()
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .cloned()
        .collect();

    let ctx = session.tool_context();
    let registry = &session.runtime().registry;
    for msg in &assistant {
        for result in registry.execute_msg(msg, &ctx).await {
            session.runtime().operator.show(&result);
        }
    }
}

async fn impersonate(session: &mut ChatSession, rest: &str) -> anyhow::Result<()> {
    let content = if rest.is_empty() {
        session.runtime().operator.edit_text("").await?
    } else {
        rest.to_string()
    };
    if content.trim().is_empty() {
        session.notify("Nothing to impersonate.");
        return Ok(());
    }

    let msg = Message::assistant(content);
    session.append(msg.clone())?;
    session.execute_invocations(&msg).await?;
    Ok(())
}

fn list_tools(session: &ChatSession) {
    let mut out = String::from("Available tools:\n");
    for (name, description, aliases) in session.runtime().registry.list() {
        out.push_str(&format!("  {}: {}\n", name, description));
        if !aliases.is_empty() {
            out.push_str(&format!("    block types: {}\n", aliases.join(", ")));
        }
    }
    session.notify(out.trim_end());
}

async fn list_agents(session: &ChatSession) {
    let pool = &session.runtime().remote;
    let targets = pool.targets();
    if targets.is_empty() {
        session.notify("No remote targets registered.");
        return;
    }
    let mut out = String::from("Remote targets:\n");
    for (key, target) in targets {
        let status = pool.status(&key).await;
        out.push_str(&format!("  {}: {} ({})\n", key, target, status));
    }
    session.notify(out.trim_end());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::testing::{test_runtime_with, test_session};
    use crate::llm::mock::{ScriptedProvider, ScriptedReply};
    use crate::operator::ScriptedOperator;
    use crate::remote::mock::MockConnector;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn session_with(
        dir: &TempDir,
        provider: ScriptedProvider,
        operator: Arc<ScriptedOperator>,
    ) -> ChatSession {
        let runtime = test_runtime_with(
            dir.path(),
            Arc::new(provider),
            operator,
            Arc::new(MockConnector::new()),
        );
        test_session(runtime, dir.path())
    }

    async fn command(session: &mut ChatSession, text: &str) -> StepOutcome {
        session.transcript_mut().append(Message::user(text)).unwrap();
        session.step().await.unwrap()
    }

    #[test]
    fn test_split_and_resolve() {
        assert_eq!(split_command("/undo 3"), ("undo", "3"));
        assert_eq!(split_command("/help"), ("help", ""));
        assert_eq!(resolve_command("sh"), Some("shell"));
        assert_eq!(resolve_command("py"), Some("python"));
        assert_eq!(resolve_command("nope"), None);
        assert!(help_text().contains("/impersonate <text>"));
    }

    #[tokio::test]
    async fn test_undo_removes_messages_and_itself() {
        let dir = TempDir::new().unwrap();
        let operator = Arc::new(ScriptedOperator::new());
        let mut session = session_with(&dir, ScriptedProvider::default(), operator);
        session.append(Message::user("one")).unwrap();
        session.append(Message::assistant("two")).unwrap();
        let before = session.transcript().len();

        assert_eq!(command(&mut session, "/undo 1").await, StepOutcome::Command);
        assert_eq!(session.transcript().len(), before - 1);
        assert_eq!(session.transcript().last().unwrap().content, "one");
    }

    #[tokio::test]
    async fn test_unknown_command_shows_help_and_is_discarded() {
        let dir = TempDir::new().unwrap();
        let operator = Arc::new(ScriptedOperator::new());
        let mut session = session_with(&dir, ScriptedProvider::default(), operator.clone());
        let before = session.transcript().len();

        command(&mut session, "/frobnicate").await;
        assert_eq!(session.transcript().len(), before);
        let shown = operator.shown();
        let last = shown.last().unwrap();
        assert!(last.content.starts_with("Unknown command: /frobnicate"));
        assert!(last.content.contains("/help"));
    }

    #[tokio::test]
    async fn test_exit() {
        let dir = TempDir::new().unwrap();
        let mut session = session_with(&dir, ScriptedProvider::default(), Arc::new(ScriptedOperator::new()));
        assert_eq!(command(&mut session, "/exit").await, StepOutcome::Exit);
    }

    #[tokio::test]
    async fn test_impersonate_runs_invocation() {
        let dir = TempDir::new().unwrap();
        let mut session = session_with(&dir, ScriptedProvider::default(), Arc::new(ScriptedOperator::new()));

        command(&mut session, "/impersonate ```out.txt\nhi\n```").await;
        let messages = session.transcript().messages();
        let n = messages.len();
        assert_eq!(messages[n - 2].role, Role::Assistant);
        assert_eq!(messages[n - 1].content, "Saved to out.txt");
        assert_eq!(std::fs::read_to_string(dir.path().join("out.txt")).unwrap(), "hi");
    }

    #[tokio::test]
    async fn test_save_last_code_block() {
        let dir = TempDir::new().unwrap();
        let mut session = session_with(&dir, ScriptedProvider::default(), Arc::new(ScriptedOperator::new()));
        session
            .append(Message::assistant("First\n```rust\nfn a() {}\n```\nthen\n```rust\nfn b() {}\n```"))
            .unwrap();

        command(&mut session, "/save lib.rs").await;
        assert_eq!(std::fs::read_to_string(dir.path().join("lib.rs")).unwrap(), "fn b() {}");
    }

    #[tokio::test]
    async fn test_edit_round_trips_through_toml() {
        let dir = TempDir::new().unwrap();
        let runtime_doc = {
            let messages = vec![Message::user("edited by hand")];
            MessageDocument::to_toml(&messages).unwrap()
        };
        let operator = Arc::new(ScriptedOperator::new().with_edit(runtime_doc));
        let mut session = session_with(&dir, ScriptedProvider::default(), operator);

        command(&mut session, "/edit").await;
        let messages = session.transcript().messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "edited by hand");
        assert!(session.transcript().branches().iter().any(|b| b.starts_with("main-edit-")));
    }

    #[tokio::test]
    async fn test_summarize_uses_provider() {
        let dir = TempDir::new().unwrap();
        let operator = Arc::new(ScriptedOperator::new());
        let provider = ScriptedProvider::new([ScriptedReply::text("We talked about cats.")]);
        let mut session = session_with(&dir, provider, operator.clone());
        session.append(Message::user("cats?")).unwrap();

        command(&mut session, "/summarize").await;
        assert_eq!(operator.shown().last().unwrap().content, "We talked about cats.");
    }

    #[tokio::test]
    async fn test_branch_and_diff() {
        let dir = TempDir::new().unwrap();
        let operator = Arc::new(ScriptedOperator::new());
        let mut session = session_with(&dir, ScriptedProvider::default(), operator.clone());

        command(&mut session, "/branch alt").await;
        assert_eq!(session.transcript().current_branch(), "alt");
        session.append(Message::user("only on alt")).unwrap();

        command(&mut session, "/diff main").await;
        let shown = operator.shown();
        assert!(shown.last().unwrap().content.contains("+ "));
        assert!(shown.last().unwrap().content.contains("only on alt"));
    }
}
