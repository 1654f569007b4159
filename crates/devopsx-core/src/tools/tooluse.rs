//! Parsing model output into tool invocations
//!
//! Two syntaxes are recognized:
//!
//! - Fenced: ```` ```<block-type> [args...] ```` followed by the payload
//! - Tagged: a `<tool-use>` wrapper whose children are `<name attr="...">payload</name>`
//!
//! Invocations are returned in document order. Malformed tagged input turns
//! into an error entry so the remaining invocations still run.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::Error;
use crate::tools::codeblock::{extract_codeblocks, looks_like_path, Codeblock};

/// Name of the capability that path-like block types resolve to
pub const SAVE_TOOL: &str = "save";

const WRAPPER_OPEN: &str = "<tool-use>";
const WRAPPER_CLOSE: &str = "</tool-use>";

static CHILD_OPEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"<([A-Za-z_][\w.-]*)((?:\s+[\w.:-]+\s*=\s*(?:"[^"]*"|'[^']*'))*)\s*(/?)>"#)
        .unwrap_or_else(|e| unreachable!("invalid child tag pattern: {e}"))
});
static ATTRIBUTE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"([\w.:-]+)\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .unwrap_or_else(|e| unreachable!("invalid attribute pattern: {e}"))
});

/// A parsed unit of work. Never persisted; only its results are.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUse {
    /// Canonical capability name
    pub tool: String,
    pub args: Vec<String>,
    pub content: String,
}

impl ToolUse {
    pub fn new(tool: impl Into<String>, args: Vec<String>, content: impl Into<String>) -> Self {
        Self {
            tool: tool.into(),
            args,
            content: content.into(),
        }
    }

    /// Convert a fenced block, if its block type resolves to a capability.
    pub fn from_codeblock(
        block: &Codeblock,
        resolve: &dyn Fn(&str) -> Option<String>,
    ) -> Option<Self> {
        let block_type = block.block_type();
        if block_type.is_empty() {
            return None;
        }

        if let Some(tool) = resolve(block_type) {
            return Some(Self::new(tool, block.args(), block.content.clone()));
        }

        if looks_like_path(block_type) {
            let tool = resolve(SAVE_TOOL)?;
            let mut args = vec![block_type.to_string()];
            args.extend(block.args());
            return Some(Self::new(tool, args, block.content.clone()));
        }

        None
    }
}

/// Scan content for every invocation in document order.
///
/// `resolve` maps a block type or tag name to a canonical capability name.
/// Fenced blocks with unknown types are ordinary markdown and are skipped;
/// tagged children with unknown names yield `Error::Unregistered`.
pub fn parse_invocations(
    content: &str,
    resolve: &dyn Fn(&str) -> Option<String>,
) -> Vec<Result<ToolUse, Error>> {
    let mut found: Vec<(usize, Result<ToolUse, Error>)> = Vec::new();
    let tagged_regions = scan_tagged(content, resolve, &mut found);

    for block in extract_codeblocks(content) {
        let inside_tagged = tagged_regions
            .iter()
            .any(|(start, end)| block.start >= *start && block.start < *end);
        if inside_tagged {
            continue;
        }
        if let Some(tooluse) = ToolUse::from_codeblock(&block, resolve) {
            found.push((block.start, Ok(tooluse)));
        }
    }

    found.sort_by_key(|(offset, _)| *offset);
    found.into_iter().map(|(_, item)| item).collect()
}

/// Whether the text so far holds at least one complete, supported invocation.
/// Evaluated after every streamed increment.
pub fn has_complete_invocation(content: &str, resolve: &dyn Fn(&str) -> Option<String>) -> bool {
    parse_invocations(content, resolve)
        .iter()
        .any(|item| item.is_ok())
}

/// Parse `<tool-use>` wrappers, returning the byte ranges they cover.
fn scan_tagged(
    content: &str,
    resolve: &dyn Fn(&str) -> Option<String>,
    found: &mut Vec<(usize, Result<ToolUse, Error>)>,
) -> Vec<(usize, usize)> {
    let mut regions = Vec::new();
    let mut cursor = 0;

    while let Some(rel) = content[cursor..].find(WRAPPER_OPEN) {
        let open = cursor + rel;
        let inner_start = open + WRAPPER_OPEN.len();
        let Some(close_rel) = content[inner_start..].find(WRAPPER_CLOSE) else {
            found.push((
                open,
                Err(Error::Parse(format!(
                    "unterminated {} block (missing {})",
                    WRAPPER_OPEN, WRAPPER_CLOSE
                ))),
            ));
            regions.push((open, content.len()));
            break;
        };
        let inner_end = inner_start + close_rel;
        let region_end = inner_end + WRAPPER_CLOSE.len();
        regions.push((open, region_end));

        parse_children(content, inner_start, inner_end, resolve, found);
        cursor = region_end;
    }

    regions
}

fn parse_children(
    content: &str,
    inner_start: usize,
    inner_end: usize,
    resolve: &dyn Fn(&str) -> Option<String>,
    found: &mut Vec<(usize, Result<ToolUse, Error>)>,
) {
    let inner = &content[inner_start..inner_end];
    let mut pos = 0;

    while let Some(caps) = CHILD_OPEN.captures_at(inner, pos) {
        let Some(whole) = caps.get(0) else { break };
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let attrs = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
        let self_closing = caps.get(3).is_some_and(|m| !m.as_str().is_empty());
        let offset = inner_start + whole.start();
        let args = parse_attributes(attrs);

        let (payload, next) = if self_closing {
            (String::new(), whole.end())
        } else {
            let closing = format!("</{}>", name);
            match inner[whole.end()..].find(&closing) {
                Some(rel) => {
                    let body = &inner[whole.end()..whole.end() + rel];
                    (trim_payload(body), whole.end() + rel + closing.len())
                }
                None => {
                    found.push((
                        offset,
                        Err(Error::Parse(format!("unclosed <{}> in tool-use block", name))),
                    ));
                    return;
                }
            }
        };

        let item = match resolve(name) {
            Some(tool) => Ok(ToolUse::new(tool, args, payload)),
            None => Err(Error::unregistered(
                "tool",
                name,
                "Use /tools to list the available tools.",
            )),
        };
        found.push((offset, item));
        pos = next;
    }
}

/// Attribute values in declaration order
fn parse_attributes(attrs: &str) -> Vec<String> {
    ATTRIBUTE
        .captures_iter(attrs)
        .map(|caps| {
            let value = caps
                .get(2)
                .or_else(|| caps.get(3))
                .map(|m| m.as_str())
                .unwrap_or_default();
            decode_entities(value)
        })
        .collect()
}

/// Drop the newline right after the opening tag and right before the closing one.
fn trim_payload(body: &str) -> String {
    let body = body
        .strip_prefix("\r\n")
        .or_else(|| body.strip_prefix('\n'))
        .unwrap_or(body);
    let body = body
        .strip_suffix("\r\n")
        .or_else(|| body.strip_suffix('\n'))
        .unwrap_or(body);
    decode_entities(body)
}

fn decode_entities(text: &str) -> String {
    if !text.contains('&') {
        return text.to_string();
    }
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
