//! Context reduction
//!
//! Fits a message sequence into a token budget in two passes:
//!
//! 1. **Reduce**: any single unprotected message above the per-message
//!    threshold has its middle elided. Code blocks are elided individually
//!    first so their fences and edges survive.
//! 2. **Limit**: if the sequence still exceeds the budget, unprotected
//!    messages are dropped oldest-first until it fits.
//!
//! Pinned and system messages are never touched. When they alone exceed the
//! budget the result exceeds it too.
//!
//! Both passes are pure functions of their input.

use crate::config::ContextConfig;
use crate::constants::CHARS_PER_TOKEN;
use crate::message::{estimate_tokens, len_tokens, Message};
use crate::tools::codeblock::extract_codeblocks;
use crate::truncation::{elide_chars, elide_lines};

/// Reducer settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReduceOptions {
    pub budget_tokens: usize,
    pub message_threshold_tokens: usize,
    pub head_lines: usize,
    pub tail_lines: usize,
}

impl From<&ContextConfig> for ReduceOptions {
    fn from(config: &ContextConfig) -> Self {
        Self {
            budget_tokens: config.budget_tokens,
            message_threshold_tokens: config.message_threshold_tokens,
            head_lines: config.head_lines,
            tail_lines: config.tail_lines,
        }
    }
}

impl Default for ReduceOptions {
    fn default() -> Self {
        Self::from(&ContextConfig::default())
    }
}

/// Run both passes
pub fn reduce(messages: &[Message], options: &ReduceOptions) -> Vec<Message> {
    let reduced = reduce_log(messages, options);
    limit_log(&reduced, options.budget_tokens)
}

/// Elide the middle of every oversized unprotected message
pub fn reduce_log(messages: &[Message], options: &ReduceOptions) -> Vec<Message> {
    messages
        .iter()
        .map(|msg| {
            if msg.is_protected() || msg.tokens() <= options.message_threshold_tokens {
                return msg.clone();
            }
            let content = truncate_content(&msg.content, options);
            tracing::debug!(
                role = %msg.role,
                before = msg.tokens(),
                after = estimate_tokens(&content),
                "Elided oversized message"
            );
            msg.replace_content(content)
        })
        .collect()
}

/// Drop unprotected messages oldest-first until the total fits `budget`
pub fn limit_log(messages: &[Message], budget: usize) -> Vec<Message> {
    let mut total = len_tokens(messages);
    if total <= budget {
        return messages.to_vec();
    }

    let mut keep = vec![true; messages.len()];
    for (idx, msg) in messages.iter().enumerate() {
        if total <= budget {
            break;
        }
        if msg.is_protected() {
            continue;
        }
        keep[idx] = false;
        total -= msg.tokens();
    }

    if total > budget {
        tracing::warn!(
            total,
            budget,
            "Pinned and system messages alone exceed the context budget"
        );
    }

    messages
        .iter()
        .zip(keep)
        .filter_map(|(msg, keep)| keep.then(|| msg.clone()))
        .collect()
}

/// Shrink one message's content to roughly the per-message threshold.
fn truncate_content(content: &str, options: &ReduceOptions) -> String {
    let threshold = options.message_threshold_tokens;

    let mut content = elide_codeblocks(content, options);
    if estimate_tokens(&content) > threshold {
        content = elide_lines(&content, options.head_lines, options.tail_lines).text;
    }
    if estimate_tokens(&content) > threshold {
        let keep_chars = threshold.saturating_mul(CHARS_PER_TOKEN) / 2;
        let half = keep_chars.saturating_sub(4);
        content = elide_chars(&content, half, half).text;
    }
    content
}

/// Elide the middle of each fenced block body, keeping the fences.
fn elide_codeblocks(content: &str, options: &ReduceOptions) -> String {
    let blocks = extract_codeblocks(content);
    if blocks.is_empty() {
        return content.to_string();
    }

    let mut out = String::with_capacity(content.len());
    let mut cursor = 0;
    for block in blocks {
        let elided = elide_lines(&block.content, options.head_lines, options.tail_lines);
        if !elided.was_truncated {
            continue;
        }
        out.push_str(&content[cursor..block.start]);
        out.push_str("```");
        out.push_str(&block.lang);
        out.push('\n');
        out.push_str(&elided.text);
        out.push_str("\n```\n");
        cursor = block.end;
    }
    out.push_str(&content[cursor..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::ELISION_MARKER;

    fn options(budget: usize, threshold: usize) -> ReduceOptions {
        ReduceOptions {
            budget_tokens: budget,
            message_threshold_tokens: threshold,
            head_lines: 2,
            tail_lines: 2,
        }
    }

    fn long_output(lines: usize) -> String {
        (0..lines)
            .map(|i| format!("output line number {:04}", i))
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[test]
    fn test_reduce_elides_oversized_message() {
        let msgs = vec![
            Message::system("You are a helpful assistant."),
            Message::user(long_output(200)),
        ];
        let reduced = reduce_log(&msgs, &options(100_000, 50));
        assert_eq!(reduced[0], msgs[0]);
        assert!(reduced[1].content.contains(ELISION_MARKER));
        assert!(reduced[1].content.starts_with("output line number 0000"));
        assert!(reduced[1].content.ends_with("output line number 0199"));
        assert!(reduced[1].tokens() < msgs[1].tokens());
    }

    #[test]
    fn test_reduce_keeps_codeblock_fences() {
        let content = format!(
            "Here is the file:\n```main.py\n{}\n```\nand the page:\n```index.html\n{}\n```",
            long_output(100),
            long_output(100)
        );
        let msgs = vec![Message::user(content)];
        let reduced = reduce_log(&msgs, &options(100_000, 100));
        let text = &reduced[0].content;
        assert!(text.contains("```main.py"));
        assert!(text.contains("```index.html"));
        assert!(text.contains(ELISION_MARKER));
        assert!(reduced[0].tokens() < msgs[0].tokens());
    }

    #[test]
    fn test_reduce_exempts_pinned_and_system() {
        let msgs = vec![
            Message::system(long_output(200)),
            Message::assistant(long_output(200)).with_pinned(true),
        ];
        let reduced = reduce_log(&msgs, &options(10, 10));
        assert_eq!(reduced, msgs);
    }

    #[test]
    fn test_reduce_handles_single_huge_line() {
        let msgs = vec![Message::user("x".repeat(10_000))];
        let reduced = reduce_log(&msgs, &options(100_000, 100));
        assert!(reduced[0].tokens() <= 101);
    }

    #[test]
    fn test_limit_drops_oldest_unprotected_first() {
        let msgs = vec![
            Message::system("sys"),
            Message::user("a".repeat(400)),
            Message::assistant("b".repeat(400)),
            Message::user("c".repeat(40)),
        ];
        let limited = limit_log(&msgs, 100);
        let contents: Vec<_> = limited.iter().map(|m| m.content.chars().next()).collect();
        assert_eq!(contents, vec![Some('s'), Some('c')]);
        assert!(len_tokens(&limited) <= 100);
    }

    #[test]
    fn test_limit_preserves_order_and_pins() {
        let msgs = vec![
            Message::user("old pinned").with_pinned(true),
            Message::user("x".repeat(800)),
            Message::assistant("recent"),
        ];
        let limited = limit_log(&msgs, 20);
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].content, "old pinned");
        assert_eq!(limited[1].content, "recent");
    }

    #[test]
    fn test_limit_budget_exceeded_by_protected_only() {
        let msgs = vec![
            Message::system("s".repeat(400)),
            Message::user("u".repeat(40)),
            Message::assistant("p".repeat(400)).with_pinned(true),
        ];
        let limited = limit_log(&msgs, 50);
        assert_eq!(limited.len(), 2);
        assert!(limited.iter().all(Message::is_protected));
    }

    #[test]
    fn test_reduce_is_deterministic() {
        let msgs = vec![
            Message::system("setup"),
            Message::user(long_output(300)),
            Message::assistant(long_output(50)),
            Message::user("short"),
        ];
        let opts = options(200, 60);
        let first = reduce(&msgs, &opts);
        let second = reduce(&msgs, &opts);
        assert_eq!(first, second);
        assert!(len_tokens(&first) <= 200);
    }

    #[test]
    fn test_reduce_budget_holds_for_mixed_input() {
        let mut msgs = vec![Message::system("be brief")];
        for i in 0..30 {
            msgs.push(Message::user(format!("question {}", i)));
            msgs.push(Message::assistant(long_output(i * 3)));
        }
        let opts = options(500, 80);
        let out = reduce(&msgs, &opts);
        assert!(len_tokens(&out) <= 500);
        assert_eq!(out[0].content, "be brief");
        let newest = reduce_log(&msgs, &opts).pop().unwrap();
        assert_eq!(out.last().unwrap().content, newest.content);
    }
}
