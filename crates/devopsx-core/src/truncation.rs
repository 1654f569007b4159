//! Head/tail elision for long text
//!
//! Used by the context reducer on oversized messages and by the shell and
//! remote capabilities on long command output. The middle of the text is
//! replaced by a marker, keeping both edges.

use crate::constants::ELISION_MARKER;

/// Result of an elision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TruncationResult {
    pub text: String,
    pub was_truncated: bool,
}

impl TruncationResult {
    fn untouched(text: &str) -> Self {
        Self {
            text: text.to_string(),
            was_truncated: false,
        }
    }

    fn elided(text: String) -> Self {
        Self {
            text,
            was_truncated: true,
        }
    }
}

/// Keep the first `head` and last `tail` lines, with the marker between.
pub fn elide_lines(text: &str, head: usize, tail: usize) -> TruncationResult {
    let lines: Vec<&str> = text.lines().collect();
    let lines_total = lines.len();

    // Eliding fewer than two lines would not shorten anything
    if lines_total <= head + tail + 1 {
        return TruncationResult::untouched(text);
    }

    let mut kept: Vec<&str> = Vec::with_capacity(head + tail + 1);
    kept.extend_from_slice(&lines[..head]);
    kept.push(ELISION_MARKER);
    kept.extend_from_slice(&lines[lines_total - tail..]);

    let mut out = kept.join("\n");
    if text.ends_with('\n') {
        out.push('\n');
    }

    TruncationResult::elided(out)
}

/// Keep the first `head` and last `tail` characters, with the marker between.
/// Handles content with few but very long lines.
pub fn elide_chars(text: &str, head: usize, tail: usize) -> TruncationResult {
    let total_chars = text.chars().count();
    if total_chars <= head + tail + ELISION_MARKER.len() {
        return TruncationResult::untouched(text);
    }

    let head_end = byte_offset(text, head);
    let tail_start = byte_offset(text, total_chars - tail);
    let out = format!(
        "{}\n{}\n{}",
        &text[..head_end],
        ELISION_MARKER,
        &text[tail_start..]
    );

    TruncationResult::elided(out)
}

/// Byte offset of the char at `char_index`, or the end of the string.
fn byte_offset(text: &str, char_index: usize) -> usize {
    text.char_indices()
        .nth(char_index)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}
