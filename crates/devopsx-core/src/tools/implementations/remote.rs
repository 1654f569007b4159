//! Remote tool - manage registered hosts and run commands on them
//!
//! ```text
//! agent add <ID> [-i <identity>] [-p <port>] <user>@<host>
//! agent delete <ID>
//! agent list
//! agent status <ID>
//! agent shell <ID>      (payload is the command)
//! agent <ID>            (shorthand for shell)
//! ```

use async_trait::async_trait;
use std::path::PathBuf;

use crate::message::Message;
use crate::remote::config::DEFAULT_SSH_PORT;
use crate::remote::{normalize_key, RemoteTarget};
use crate::tools::registry::{Capability, ToolContext};
use crate::tools::tooluse::ToolUse;

const USAGE: &str = "Usage: agent add <ID> [-i <identity>] [-p <port>] <user>@<host> | delete <ID> | list | status <ID> | shell <ID>";

pub struct RemoteTool;

/// Parsed `add` arguments
#[derive(Debug, Clone, PartialEq, Eq)]
struct AddArgs {
    key: String,
    target: RemoteTarget,
}

fn parse_add(args: &[String]) -> anyhow::Result<AddArgs> {
    let mut key = None;
    let mut destination = None;
    let mut identity: Option<PathBuf> = None;
    let mut port = DEFAULT_SSH_PORT;

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "-i" | "--identity" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("-i requires a path"))?;
                identity = Some(PathBuf::from(value));
            }
            "-p" | "--port" => {
                let value = iter
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("-p requires a port"))?;
                port = value
                    .parse()
                    .map_err(|_| anyhow::anyhow!("Invalid port: {}", value))?;
            }
            _ if key.is_none() => key = Some(arg.clone()),
            _ if destination.is_none() => destination = Some(arg.clone()),
            other => anyhow::bail!("Unexpected argument: {}", other),
        }
    }

    let (Some(key), Some(destination)) = (key, destination) else {
        anyhow::bail!("{}", USAGE);
    };
    let (user, host) = RemoteTarget::parse_destination(&destination)
        .ok_or_else(|| anyhow::anyhow!("Expected <user>@<host>, got '{}'", destination))?;

    let target = match identity {
        Some(path) => RemoteTarget::with_identity(&user, &host, port, path),
        None => RemoteTarget::with_password(&user, &host, port),
    };
    Ok(AddArgs {
        key: normalize_key(&key),
        target,
    })
}

fn required_key(args: &[String], verb: &str) -> anyhow::Result<String> {
    args.first()
        .map(|k| normalize_key(k))
        .ok_or_else(|| anyhow::anyhow!("`{}` needs a target ID. {}", verb, USAGE))
}

async fn add(args: &[String], ctx: &ToolContext) -> anyhow::Result<Message> {
    let AddArgs { key, target } = parse_add(args)?;
    let pool = &ctx.runtime.remote;
    if pool.is_registered(&key)
        && !ctx
            .ask(&format!("{} is already registered, replace it?", key))
            .await
    {
        return Ok(Message::system("Registration cancelled."));
    }

    let description = target.to_string();
    pool.register(&key, target, ctx.operator()).await?;
    Ok(Message::system(format!(
        "Registered {} ({}). Connection verified.",
        key, description
    )))
}

async fn list(ctx: &ToolContext) -> Message {
    let pool = &ctx.runtime.remote;
    let targets = pool.targets();
    if targets.is_empty() {
        return Message::system("No remote targets registered.");
    }
    let mut out = String::from("Registered targets:\n");
    for (key, target) in targets {
        let auth = match &target.identity_file {
            Some(path) => format!("identity {}", path.display()),
            None => "password".to_string(),
        };
        let status = pool.status(&key).await;
        out.push_str(&format!("- {}: {} [{}] {}\n", key, target, auth, status));
    }
    Message::system(out.trim_end())
}

/// Run the payload on `key`, interruptible through the context's token
async fn run_on(key: &str, command: &str, ctx: &ToolContext) -> anyhow::Result<Message> {
    let command = command.trim();
    if command.is_empty() {
        return Ok(Message::system("No command given"));
    }
    let pool = &ctx.runtime.remote;
    if !pool.is_registered(key) {
        anyhow::bail!(
            "{} is not registered. Add it with `agent add {} <user>@<host>`.",
            key,
            key
        );
    }

    let title = format!("Remote ({})", key);
    if !ctx.preview_and_ask(&title, command, "Run command?").await {
        return Ok(Message::system("Remote execution cancelled."));
    }

    let output = tokio::select! {
        output = pool.run(key, command, false, ctx.operator()) => output?,
        _ = ctx.cancel.cancelled() => {
            tracing::info!(key, "Remote command interrupted");
            return Ok(Message::system("Interrupted"));
        }
    };
    Ok(Message::system(output.render(command)))
}

#[async_trait]
impl Capability for RemoteTool {
    fn name(&self) -> &str {
        "remote"
    }

    fn description(&self) -> &str {
        "Register remote hosts over SSH and run commands on them"
    }

    fn block_types(&self) -> &[&str] {
        &["agent", "subagent"]
    }

    async fn execute(&self, tooluse: &ToolUse, ctx: &ToolContext) -> anyhow::Result<Vec<Message>> {
        let Some((verb, rest)) = tooluse.args.split_first() else {
            anyhow::bail!("{}", USAGE);
        };

        let msg = match verb.as_str() {
            "add" => add(rest, ctx).await?,
            "delete" | "rm" => {
                let key = required_key(rest, verb)?;
                ctx.runtime.remote.deregister(&key).await?;
                Message::system(format!("Removed {}", key))
            }
            "list" | "ls" => list(ctx).await,
            "status" => {
                let key = required_key(rest, verb)?;
                let status = ctx.runtime.remote.status(&key).await;
                Message::system(format!("{}: {}", key, status))
            }
            "shell" | "run" => {
                let key = required_key(rest, verb)?;
                run_on(&key, &tooluse.content, ctx).await?
            }
            other if ctx.runtime.remote.is_registered(&normalize_key(other)) => {
                run_on(&normalize_key(other), &tooluse.content, ctx).await?
            }
            other => anyhow::bail!("Unknown agent command '{}'. {}", other, USAGE),
        };
        Ok(vec![msg])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::testing::test_runtime_with;
    use crate::llm::mock::ScriptedProvider;
    use crate::operator::ScriptedOperator;
    use crate::remote::mock::MockConnector;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;

    fn args(line: &str) -> Vec<String> {
        line.split_whitespace().map(ToString::to_string).collect()
    }

    fn setup(dir: &TempDir, operator: Arc<ScriptedOperator>) -> (ToolContext, Arc<MockConnector>) {
        let connector = Arc::new(MockConnector::new());
        let runtime = test_runtime_with(
            dir.path(),
            Arc::new(ScriptedProvider::default()),
            operator,
            Arc::clone(&connector),
        );
        (ToolContext::new(runtime).with_confirm(false), connector)
    }

    async fn run(ctx: &ToolContext, line: &str, payload: &str) -> Vec<Message> {
        let tooluse = ToolUse::new("remote", args(line), payload);
        RemoteTool.execute(&tooluse, ctx).await.unwrap()
    }

    #[test]
    fn test_parse_add_with_options() {
        let parsed = parse_add(&args("web1 -i /keys/id -p 2222 deploy@web1.internal")).unwrap();
        assert_eq!(parsed.key, "WEB1");
        assert_eq!(parsed.target.user, "deploy");
        assert_eq!(parsed.target.hostname, "web1.internal");
        assert_eq!(parsed.target.port, 2222);
        assert_eq!(parsed.target.identity_file, Some(PathBuf::from("/keys/id")));
        assert!(!parsed.target.password_authentication);
    }

    #[test]
    fn test_parse_add_without_identity_uses_password() {
        let parsed = parse_add(&args("db root@10.0.0.5")).unwrap();
        assert!(parsed.target.password_authentication);
        assert_eq!(parsed.target.port, DEFAULT_SSH_PORT);
        assert!(parse_add(&args("db")).is_err());
        assert!(parse_add(&args("db rootathost")).is_err());
        assert!(parse_add(&args("db -p abc root@host")).is_err());
    }

    #[tokio::test]
    async fn test_add_then_shorthand_run() {
        let dir = TempDir::new().unwrap();
        let (ctx, connector) = setup(&dir, Arc::new(ScriptedOperator::new()));

        let added = run(&ctx, "add web1 -i /keys/id deploy@web1.internal", "").await;
        assert!(added[0].content.starts_with("Registered WEB1"));

        let out = run(&ctx, "web1", "echo hello").await;
        assert!(out[0].content.contains("hello"));
        assert_eq!(connector.connect_count(), 1);

        let status = run(&ctx, "status web1", "").await;
        assert_eq!(status[0].content, "WEB1: Connected");
    }

    #[tokio::test]
    async fn test_password_target_asks_for_secret() {
        let dir = TempDir::new().unwrap();
        let operator = Arc::new(ScriptedOperator::new().with_secrets(["s3cret"]));
        let (ctx, connector) = setup(&dir, Arc::clone(&operator));

        run(&ctx, "add db root@db.internal", "").await;
        assert_eq!(connector.secrets(), vec![Some("s3cret".to_string())]);
        let saved = std::fs::read_to_string(ctx.runtime.paths.agents_file()).unwrap();
        assert!(!saved.contains("s3cret"));
        assert!(saved.contains("password_authentication = true"));
    }

    #[tokio::test]
    async fn test_delete_and_unknown_target() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = setup(&dir, Arc::new(ScriptedOperator::new()));
        run(&ctx, "add web1 -i /keys/id deploy@web1", "").await;

        let removed = run(&ctx, "rm web1", "").await;
        assert_eq!(removed[0].content, "Removed WEB1");
        let status = run(&ctx, "status web1", "").await;
        assert_eq!(status[0].content, "WEB1: Not Registered");

        let tooluse = ToolUse::new("remote", args("shell web1"), "ls");
        assert!(RemoteTool.execute(&tooluse, &ctx).await.is_err());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_reported() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = setup(&dir, Arc::new(ScriptedOperator::new()));
        run(&ctx, "add web1 -i /keys/id deploy@web1", "").await;

        let out = run(&ctx, "shell web1", "exit 3").await;
        assert!(out[0].content.contains("Return code: 3"));
    }

    #[tokio::test]
    async fn test_interrupt_returns_interrupted() {
        let dir = TempDir::new().unwrap();
        let (ctx, _) = setup(&dir, Arc::new(ScriptedOperator::new()));
        run(&ctx, "add web1 -i /keys/id deploy@web1", "").await;

        let token = ctx.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        });
        let out = run(&ctx, "web1", "sleep 5").await;
        assert_eq!(out[0].content, "Interrupted");
    }
}
