//! Save and append tools - write a payload to a file

use async_trait::async_trait;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::message::Message;
use crate::tools::registry::{Capability, ToolContext};
use crate::tools::tooluse::ToolUse;

pub struct SaveTool;
pub struct AppendTool;

fn target_name(tooluse: &ToolUse) -> anyhow::Result<String> {
    let name = tooluse.args.join(" ");
    if name.trim().is_empty() {
        anyhow::bail!("No filename provided");
    }
    Ok(name)
}

/// Write `code` to `name`, asking before the write, an overwrite and a
/// missing parent folder.
pub(crate) async fn save_file(name: &str, code: &str, ctx: &ToolContext) -> anyhow::Result<Message> {
    let code = code.trim_start_matches('\n');

    if !ctx.ask(&format!("Save to {}?", name)).await {
        return Ok(Message::system("Save cancelled."));
    }

    let path = ctx.resolve_path(name);
    if path.exists() && !ctx.ask("File exists, overwrite?").await {
        return Ok(Message::system("Save cancelled."));
    }

    if let Some(parent) = path.parent().filter(|p| !p.exists()) {
        if !ctx.ask("Folder doesn't exist, create it?").await {
            return Ok(Message::system("Save cancelled."));
        }
        info!("Save tool: creating parent directory {:?}", parent);
        fs::create_dir_all(parent)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create directory: {}", e))?;
    }

    fs::write(&path, code)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to write file: {}", e))?;
    info!(path = %path.display(), bytes = code.len(), "Saved file");
    Ok(Message::system(format!("Saved to {}", name)))
}

async fn append_file(name: &str, code: &str, ctx: &ToolContext) -> anyhow::Result<Message> {
    let code = code.trim_start_matches('\n');

    if !ctx.ask(&format!("Append to {}?", name)).await {
        return Ok(Message::system("Append cancelled."));
    }

    let path = ctx.resolve_path(name);
    if !path.exists() {
        return Ok(Message::system(format!(
            "File {} doesn't exist, can't append to it.",
            name
        )));
    }

    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to open file: {}", e))?;
    file.write_all(code.as_bytes()).await?;
    file.flush().await?;
    Ok(Message::system(format!("Appended to {}", name)))
}

#[async_trait]
impl Capability for SaveTool {
    fn name(&self) -> &str {
        "save"
    }

    fn description(&self) -> &str {
        "Create or overwrite a file. A fence named after a path saves to that path."
    }

    async fn execute(&self, tooluse: &ToolUse, ctx: &ToolContext) -> anyhow::Result<Vec<Message>> {
        let name = target_name(tooluse)?;
        Ok(vec![save_file(&name, &tooluse.content, ctx).await?])
    }
}

#[async_trait]
impl Capability for AppendTool {
    fn name(&self) -> &str {
        "append"
    }

    fn description(&self) -> &str {
        "Append to an existing file"
    }

    async fn execute(&self, tooluse: &ToolUse, ctx: &ToolContext) -> anyhow::Result<Vec<Message>> {
        let name = target_name(tooluse)?;
        Ok(vec![append_file(&name, &tooluse.content, ctx).await?])
    }
}
