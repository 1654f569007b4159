//! Patch tool - edit files with conflict-marker hunks
//!
//! ```text
//! <<<<<<< ORIGINAL
//! old lines
//! =======
//! new lines
//! >>>>>>> UPDATED
//! ```
//!
//! Placeholder lines such as `# ...` or `// ...` split a hunk into chunks
//! that are each located independently.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use similar::TextDiff;
use tokio::fs;

use crate::message::Message;
use crate::tools::registry::{Capability, ToolContext};
use crate::tools::tooluse::ToolUse;

const ORIGINAL: &str = "<<<<<<< ORIGINAL\n";
const DIVIDER: &str = "\n=======\n";
const UPDATED: &str = "\n>>>>>>> UPDATED";

static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?m)^[ \t]*(#|//|") \.\.\. ?.*$"#)
        .unwrap_or_else(|e| unreachable!("invalid placeholder pattern: {e}"))
});

pub struct PatchTool;

/// One find-and-replace chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    pub original: String,
    pub updated: String,
}

impl Hunk {
    /// Replace the single occurrence of `original` in `content`
    pub fn apply(&self, content: &str) -> Result<String, String> {
        match content.matches(self.original.as_str()).count() {
            0 => return Err("original chunk not found in file".to_string()),
            1 => {}
            _ => return Err("original chunk not unique".to_string()),
        }
        let patched = content.replacen(self.original.as_str(), &self.updated, 1);
        if patched == content {
            return Err("patch did not change the file".to_string());
        }
        Ok(patched)
    }
}

fn split_raw(payload: &str) -> Result<Vec<Hunk>, String> {
    let payload = payload.trim();
    let mut hunks = Vec::new();

    let mut starts: Vec<usize> = payload.match_indices(ORIGINAL).map(|(i, _)| i).collect();
    if starts.is_empty() {
        return Err(format!("invalid patch, no `{}`", ORIGINAL.trim()));
    }
    starts.push(payload.len());

    for window in starts.windows(2) {
        let section = &payload[window[0] + ORIGINAL.len()..window[1]];
        let (original, rest) = section
            .split_once(DIVIDER)
            .ok_or_else(|| "invalid patch format, missing divider".to_string())?;
        let (updated, _) = rest
            .split_once(UPDATED)
            .ok_or_else(|| "invalid patch format, missing end marker".to_string())?;
        hunks.push(Hunk {
            original: original.to_string(),
            updated: updated.to_string(),
        });
    }
    Ok(hunks)
}

/// Parse a payload into hunks, expanding placeholder-separated chunks
pub fn parse_hunks(payload: &str) -> Result<Vec<Hunk>, String> {
    let mut hunks = Vec::new();
    for hunk in split_raw(payload)? {
        if !PLACEHOLDER.is_match(&hunk.original) && !PLACEHOLDER.is_match(&hunk.updated) {
            hunks.push(hunk);
            continue;
        }

        let originals: Vec<&str> = PLACEHOLDER.split(&hunk.original).collect();
        let updateds: Vec<&str> = PLACEHOLDER.split(&hunk.updated).collect();
        if originals.len() != updateds.len() {
            return Err(
                "different number of placeholders in original and updated chunks".to_string(),
            );
        }
        for (original, updated) in originals.into_iter().zip(updateds) {
            if original != updated {
                hunks.push(Hunk {
                    original: original.to_string(),
                    updated: updated.to_string(),
                });
            }
        }
    }
    Ok(hunks)
}

/// Apply every hunk in order
pub fn apply_patch(payload: &str, content: &str) -> Result<String, String> {
    parse_hunks(payload)?
        .iter()
        .try_fold(content.to_string(), |acc, hunk| hunk.apply(&acc))
}

fn preview(path: &str, before: &str, after: &str) -> String {
    TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(3)
        .header(path, path)
        .to_string()
}

#[async_trait]
impl Capability for PatchTool {
    fn name(&self) -> &str {
        "patch"
    }

    fn description(&self) -> &str {
        "Modify part of a file using ORIGINAL/UPDATED conflict markers"
    }

    async fn execute(&self, tooluse: &ToolUse, ctx: &ToolContext) -> anyhow::Result<Vec<Message>> {
        let name = tooluse.args.join(" ");
        if name.trim().is_empty() {
            anyhow::bail!("No filename provided");
        }
        let path = ctx.resolve_path(&name);
        if !path.exists() {
            return Ok(vec![Message::system(format!(
                "Patch failed: file not found: {}",
                name
            ))]);
        }

        let before = fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read file: {}", e))?;
        let after = match apply_patch(&tooluse.content, &before) {
            Ok(after) => after,
            Err(reason) => {
                tracing::debug!(path = %name, reason = %reason, "Patch rejected");
                return Ok(vec![Message::system(format!("Patch failed: {}", reason))]);
            }
        };

        let diff = preview(&name, &before, &after);
        if !ctx
            .preview_and_ask("Patch", &diff, &format!("Apply patch to {}?", name))
            .await
        {
            return Ok(vec![Message::system("Patch not applied.")]);
        }

        fs::write(&path, &after)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to write file: {}", e))?;

        let mut result = format!("Patch successfully applied to {}", name);
        if after.len() > 1000 && tooluse.content.len() > after.len() {
            result.push_str(
                "\nNote: The patch was larger than the file. Prefer smaller patches or the save tool.",
            );
        }
        Ok(vec![Message::system(result)])
    }
}
