//! Python tool - run a code block with the local interpreter

use async_trait::async_trait;
use tokio::process::Command;

use super::save::save_file;
use super::shell::{run_process, ProcessEnd};
use crate::message::Message;
use crate::tools::output::{CommandOutput, OUTPUT_HEAD_LINES, OUTPUT_TAIL_LINES};
use crate::tools::registry::{Capability, ToolContext};
use crate::tools::tooluse::ToolUse;

const INTERPRETER: &str = "python3";
/// Where declined code is offered to be saved instead
const FALLBACK_FILE: &str = "save.py";

pub struct PythonTool;

fn render(output: &CommandOutput) -> String {
    let mut msg = String::from("Executed code block.\n\n");
    let stdout = output.stdout_window(OUTPUT_HEAD_LINES, OUTPUT_TAIL_LINES);
    let stderr = output.stderr_window(OUTPUT_HEAD_LINES, OUTPUT_TAIL_LINES);
    if !stdout.is_empty() {
        msg.push_str(&format!("stdout:\n```\n{}\n```\n\n", stdout));
    }
    if !stderr.is_empty() {
        msg.push_str(&format!("stderr:\n```\n{}\n```\n\n", stderr));
    }
    if !output.success() {
        msg.push_str(&format!("Exit code: {}\n", output.status));
    }
    msg
}

/// Run `code` through the interpreter, or offer to save it when declined.
pub(crate) async fn execute_python(code: &str, ctx: &ToolContext) -> anyhow::Result<Vec<Message>> {
    let code = code.trim();
    if !ctx.preview_and_ask("Python", code, "Execute code?").await {
        return Ok(vec![save_file(FALLBACK_FILE, code, ctx).await?]);
    }

    let mut cmd = Command::new(INTERPRETER);
    cmd.arg("-");
    if ctx.working_dir.is_dir() {
        cmd.current_dir(&ctx.working_dir);
    }

    let limit = ctx
        .timeout
        .unwrap_or_else(|| ctx.runtime.config.tools.shell_timeout());
    tracing::info!(bytes = code.len(), "Executing python code block");
    let message = match run_process(cmd, Some(code), limit, &ctx.cancel).await? {
        ProcessEnd::Exited(output) => render(&output),
        ProcessEnd::TimedOut(output) => format!(
            "{}Execution timed out after {} seconds",
            render(&output),
            limit.as_secs()
        ),
        ProcessEnd::Interrupted(output) => format!("{}Interrupted", render(&output)),
    };
    Ok(vec![Message::system(message)])
}

#[async_trait]
impl Capability for PythonTool {
    fn name(&self) -> &str {
        "python"
    }

    fn description(&self) -> &str {
        "Execute Python code with the local python3 interpreter"
    }

    fn block_types(&self) -> &[&str] {
        &["py", "ipython"]
    }

    async fn execute(&self, tooluse: &ToolUse, ctx: &ToolContext) -> anyhow::Result<Vec<Message>> {
        execute_python(&tooluse.content, ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chat::testing::test_runtime_with_operator;
    use crate::operator::ScriptedOperator;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_render_sections() {
        let out = CommandOutput {
            status: 1,
            stdout: "42\n".to_string(),
            stderr: "Traceback\n".to_string(),
        };
        let text = render(&out);
        assert!(text.starts_with("Executed code block.\n\n"));
        assert!(text.contains("stdout:\n```\n42\n```"));
        assert!(text.contains("stderr:\n```\nTraceback\n```"));
        assert!(text.contains("Exit code: 1"));
    }

    #[tokio::test]
    async fn test_decline_offers_save() {
        let dir = TempDir::new().unwrap();
        let operator = Arc::new(ScriptedOperator::new().with_answers([false, true]));
        let runtime = test_runtime_with_operator(dir.path(), operator.clone());
        let ctx = ToolContext::new(runtime)
            .with_confirm(true)
            .with_working_dir(dir.path().to_path_buf());

        let msgs = execute_python("print(1)", &ctx).await.unwrap();
        assert_eq!(msgs[0].content, "Saved to save.py");
        assert_eq!(operator.asked(), vec!["Execute code?", "Save to save.py?"]);
        assert_eq!(
            std::fs::read_to_string(dir.path().join("save.py")).unwrap(),
            "print(1)"
        );
    }

    #[tokio::test]
    async fn test_decline_both_runs_nothing() {
        let dir = TempDir::new().unwrap();
        let operator = Arc::new(ScriptedOperator::new());
        let runtime = test_runtime_with_operator(dir.path(), operator);
        let ctx = ToolContext::new(runtime)
            .with_confirm(true)
            .with_working_dir(dir.path().to_path_buf());

        let msgs = execute_python("print(1)", &ctx).await.unwrap();
        assert_eq!(msgs[0].content, "Save cancelled.");
        assert!(!dir.path().join("save.py").exists());
    }
}
