//! Captured command output and its transcript rendering
//!
//! Shared by the local shell and remote execution so both report results the
//! same way.

use crate::truncation::elide_lines;

/// Lines kept at each end of stdout/stderr when shown in the transcript
pub const OUTPUT_HEAD_LINES: usize = 100;
pub const OUTPUT_TAIL_LINES: usize = 100;

/// Exit status plus separately captured streams
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Stdout shortened to a head/tail window
    pub fn stdout_window(&self, head: usize, tail: usize) -> String {
        elide_lines(self.stdout.trim(), head, tail).text
    }

    /// Stderr shortened to a head/tail window
    pub fn stderr_window(&self, head: usize, tail: usize) -> String {
        elide_lines(self.stderr.trim(), head, tail).text
    }

    /// Transcript rendering: the command, then each non-empty stream
    pub fn render(&self, command: &str) -> String {
        let stdout = self.stdout_window(OUTPUT_HEAD_LINES, OUTPUT_TAIL_LINES);
        let stderr = self.stderr_window(OUTPUT_HEAD_LINES, OUTPUT_TAIL_LINES);

        let mut msg = format_block_smart("Ran command", command, "bash");
        msg.push_str("\n\n");
        if !stdout.is_empty() {
            msg.push_str(&format_block_smart("stdout", &stdout, ""));
            msg.push_str("\n\n");
        }
        if !stderr.is_empty() {
            msg.push_str(&format_block_smart("stderr", &stderr, ""));
            msg.push_str("\n\n");
        }
        if stdout.is_empty() && stderr.is_empty() {
            msg.push_str("No output\n");
        }
        if !self.success() {
            msg.push_str(&format!("Return code: {}\n", self.status));
        }
        msg
    }
}

/// Inline code for one-liners, a fenced block otherwise
pub fn format_block_smart(header: &str, content: &str, lang: &str) -> String {
    let content = content.trim_end();
    if content.contains('\n') {
        format!("{}:\n```{}\n{}\n```", header, lang, content)
    } else {
        format!("{}: `{}`", header, content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_one_liner() {
        let out = CommandOutput {
            status: 0,
            stdout: "hi\n".to_string(),
            stderr: String::new(),
        };
        assert_eq!(out.render("echo hi"), "Ran command: `echo hi`\n\nstdout: `hi`\n\n");
    }

    #[test]
    fn test_render_no_output_and_failure() {
        let out = CommandOutput {
            status: 2,
            ..Default::default()
        };
        let text = out.render("false");
        assert!(text.contains("No output"));
        assert!(text.contains("Return code: 2"));
    }

    #[test]
    fn test_render_multiline_blocks() {
        let out = CommandOutput {
            status: 0,
            stdout: "a\nb\n".to_string(),
            stderr: "warn\n".to_string(),
        };
        let text = out.render("ls\npwd");
        assert!(text.starts_with("Ran command:\n```bash\nls\npwd\n```"));
        assert!(text.contains("stdout:\n```\na\nb\n```"));
        assert!(text.contains("stderr: `warn`"));
    }

    #[test]
    fn test_windows_are_independent() {
        let out = CommandOutput {
            status: 0,
            stdout: (0..50).map(|i| i.to_string()).collect::<Vec<_>>().join("\n"),
            stderr: "short".to_string(),
        };
        assert!(out.stdout_window(2, 2).contains("[...]"));
        assert_eq!(out.stderr_window(2, 2), "short");
    }
}
