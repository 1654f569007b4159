//! Fenced code block extraction
//!
//! A block opens on a line starting with three backticks and closes on a bare
//! fence line. An opening fence with an info string inside a block nests, so
//! markdown documents that contain code can themselves be saved verbatim.
//! Unclosed blocks are not reported.

const FENCE: &str = "```";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Codeblock {
    /// Info string after the opening fence (`bash`, `hello.py`, `agent add D1 ...`)
    pub lang: String,
    /// Body between the fences, without the final newline
    pub content: String,
    /// Byte offset of the opening fence line
    pub start: usize,
    /// Byte offset just past the closing fence line
    pub end: usize,
}

impl Codeblock {
    /// First token of the info string
    pub fn block_type(&self) -> &str {
        self.lang.split_whitespace().next().unwrap_or("")
    }

    /// Remaining tokens of the info string
    pub fn args(&self) -> Vec<String> {
        self.lang
            .split_whitespace()
            .skip(1)
            .map(ToString::to_string)
            .collect()
    }
}

/// Path-like names resolve to the save capability
pub fn looks_like_path(name: &str) -> bool {
    name.contains('.') || name.contains('/')
}

/// Extract every closed fenced block, outermost only, in document order.
pub fn extract_codeblocks(text: &str) -> Vec<Codeblock> {
    let mut blocks = Vec::new();
    let mut offset = 0;
    let mut depth = 0usize;
    let mut lang = String::new();
    let mut open_at = 0;
    let mut body_start = 0;

    for line in text.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim_end_matches(['\n', '\r']);

        let Some(info) = trimmed.trim_start().strip_prefix(FENCE) else {
            continue;
        };
        let info = info.trim();

        if depth == 0 {
            if info.starts_with('`') {
                continue;
            }
            depth = 1;
            lang = info.to_string();
            open_at = line_start;
            body_start = offset;
        } else if info.is_empty() {
            depth -= 1;
            if depth == 0 {
                let body = &text[body_start..line_start.max(body_start)];
                let body = body
                    .strip_suffix('\n')
                    .map(|b| b.strip_suffix('\r').unwrap_or(b))
                    .unwrap_or(body);
                blocks.push(Codeblock {
                    lang: std::mem::take(&mut lang),
                    content: body.to_string(),
                    start: open_at,
                    end: offset,
                });
            }
        } else {
            depth += 1;
        }
    }

    blocks
}
