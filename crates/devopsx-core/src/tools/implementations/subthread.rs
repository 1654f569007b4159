//! Subthread tool - delegate a sub-task to a concurrent conversation

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::message::Message;
use crate::tools::registry::{Capability, ToolContext};
use crate::tools::tooluse::ToolUse;

const USAGE: &str = "Usage: subthread spawn <id>... (payload is the prompt) | status <id> | wait [<id>] [<secs>] | list";

pub struct SubthreadTool;

/// `wait` arguments: an optional id and an optional timeout in seconds.
///
/// A lone number is the timeout for waiting on everything, unless a
/// delegation with that id exists.
fn parse_wait(
    args: &[String],
    default_secs: u64,
    is_known: impl Fn(&str) -> bool,
) -> anyhow::Result<(Option<String>, Duration)> {
    let parse_secs = |arg: &str| {
        arg.parse::<u64>()
            .map_err(|_| anyhow::anyhow!("Invalid timeout: {}. {}", arg, USAGE))
    };
    let (id, secs) = match args {
        [] => (None, default_secs),
        [only] if is_known(only.as_str()) => (Some(only.clone()), default_secs),
        [only] => match only.parse::<u64>() {
            Ok(value) => (None, value),
            Err(_) => (Some(only.clone()), default_secs),
        },
        [id, timeout] => (Some(id.clone()), parse_secs(timeout.as_str())?),
        [_, _, extra, ..] => anyhow::bail!("Unexpected argument: {}. {}", extra, USAGE),
    };
    Ok((id, Duration::from_secs(secs)))
}

fn required_id<'a>(args: &'a [String], verb: &str) -> anyhow::Result<&'a str> {
    args.first()
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("`{}` needs an id. {}", verb, USAGE))
}

async fn wait(args: &[String], ctx: &ToolContext) -> anyhow::Result<Message> {
    let runtime = &ctx.runtime;
    let known = runtime.supervisor.ids();
    let (id, timeout) = parse_wait(args, runtime.config.delegation.default_wait_secs, |arg| {
        known.iter().any(|id| id == arg)
    })?;

    let ids = match id {
        Some(id) => vec![id],
        None => runtime.supervisor.ids(),
    };
    if ids.is_empty() {
        return Ok(Message::system("No subthreads to wait for."));
    }

    let results = tokio::select! {
        results = runtime.supervisor.wait_all(runtime, &ids, timeout) => results,
        _ = ctx.cancel.cancelled() => return Ok(Message::system("Interrupted")),
    };

    let mut out = String::new();
    for (id, result) in results {
        let line = match result {
            Ok(status) => format!("{}: {}", id, status),
            Err(e) => format!("{}: {}", id, e),
        };
        out.push_str(&line);
        out.push('\n');
    }
    Ok(Message::system(out.trim_end()))
}

#[async_trait]
impl Capability for SubthreadTool {
    fn name(&self) -> &str {
        "subthread"
    }

    fn description(&self) -> &str {
        "Delegate a sub-task to a concurrent conversation and collect its result"
    }

    fn block_types(&self) -> &[&str] {
        &["delegate"]
    }

    async fn execute(&self, tooluse: &ToolUse, ctx: &ToolContext) -> anyhow::Result<Vec<Message>> {
        let Some((verb, rest)) = tooluse.args.split_first() else {
            anyhow::bail!("{}", USAGE);
        };
        let supervisor = &ctx.runtime.supervisor;

        let msg = match verb.as_str() {
            "spawn" => {
                let id = required_id(rest, verb)?;
                let prompt = tooluse.content.trim();
                if prompt.is_empty() {
                    anyhow::bail!("`spawn {}` needs a prompt as payload", id);
                }
                let title = format!("Subthread ({})", rest.join(", "));
                if !ctx.preview_and_ask(&title, prompt, "Spawn subthread?").await {
                    return Ok(vec![Message::system("Subthread spawn cancelled.")]);
                }
                // Several ids share the prompt and run side by side
                let batch: Vec<(String, String)> = rest
                    .iter()
                    .map(|id| (id.clone(), prompt.to_string()))
                    .collect();
                supervisor.spawn_batch(&ctx.runtime, &batch, ctx.confirm)?;
                Message::system(format!("Spawned subthread {}", rest.join(", ")))
            }
            "status" => {
                let id = required_id(rest, verb)?;
                let status = supervisor.status(&ctx.runtime, id)?;
                Message::system(format!("{}: {}", id, status))
            }
            "wait" => wait(rest, ctx).await?,
            "list" => {
                let items = supervisor.list();
                if items.is_empty() {
                    Message::system("No subthreads.")
                } else {
                    let lines: Vec<String> = items
                        .iter()
                        .map(|(id, prompt)| format!("- {}: {}", id, prompt.lines().next().unwrap_or("")))
                        .collect();
                    Message::system(lines.join("\n"))
                }
            }
            other => anyhow::bail!("Unknown subthread command '{}'. {}", other, USAGE),
        };
        Ok(vec![msg])
    }
}
