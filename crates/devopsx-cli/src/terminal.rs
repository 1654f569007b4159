//! Operator backed by the controlling terminal

use async_trait::async_trait;
use crossterm::event::{self, Event, KeyCode, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::process::Command;

use devopsx_core::message::{Message, Role};
use devopsx_core::operator::Operator;

/// Reads answers from stdin and prints to stdout
pub struct TerminalOperator {
    /// Scratch directory for `/edit`
    scratch_dir: PathBuf,
}

impl TerminalOperator {
    pub fn new(scratch_dir: PathBuf) -> Self {
        Self { scratch_dir }
    }
}

/// Read one line from stdin. `None` on EOF.
pub fn read_line(prompt: &str) -> io::Result<Option<String>> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut line = String::new();
    if io::stdin().lock().read_line(&mut line)? == 0 {
        return Ok(None);
    }
    Ok(Some(line.trim_end_matches(['\n', '\r']).to_string()))
}

/// Read a line without echo. `None` on Esc or Ctrl-C.
fn read_hidden(prompt: &str) -> io::Result<Option<String>> {
    print!("{}", prompt);
    io::stdout().flush()?;
    terminal::enable_raw_mode()?;
    let result = read_hidden_raw();
    let _ = terminal::disable_raw_mode();
    println!();
    result
}

fn read_hidden_raw() -> io::Result<Option<String>> {
    let mut secret = String::new();
    loop {
        let Event::Key(key) = event::read()? else {
            continue;
        };
        if key.kind != KeyEventKind::Press {
            continue;
        }
        match key.code {
            KeyCode::Enter => return Ok(Some(secret)),
            KeyCode::Esc => return Ok(None),
            KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => return Ok(None),
            KeyCode::Backspace => {
                secret.pop();
            }
            KeyCode::Char(c) => secret.push(c),
            _ => {}
        }
    }
}

fn edit_in_editor(path: &PathBuf, text: &str) -> anyhow::Result<String> {
    std::fs::write(path, text)?;
    let editor = std::env::var("EDITOR").unwrap_or_else(|_| "vi".to_string());
    let mut parts = editor.split_whitespace();
    let program = parts.next().unwrap_or("vi");
    let status = Command::new(program).args(parts).arg(path).status()?;
    if !status.success() {
        anyhow::bail!("Editor exited with {}", status);
    }
    let edited = std::fs::read_to_string(path)?;
    let _ = std::fs::remove_file(path);
    Ok(edited)
}

#[async_trait]
impl Operator for TerminalOperator {
    async fn confirm(&self, question: &str) -> bool {
        let prompt = format!("{} [y/N] ", question);
        let answer = tokio::task::spawn_blocking(move || read_line(&prompt)).await;
        matches!(answer, Ok(Ok(Some(a))) if matches!(a.trim().to_lowercase().as_str(), "y" | "yes"))
    }

    async fn secret(&self, prompt: &str) -> Option<String> {
        let prompt = format!("{} ", prompt);
        match tokio::task::spawn_blocking(move || read_hidden(&prompt)).await {
            Ok(Ok(secret)) => secret,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "Failed to read secret");
                None
            }
            Err(_) => None,
        }
    }

    async fn edit_text(&self, text: &str) -> anyhow::Result<String> {
        std::fs::create_dir_all(&self.scratch_dir)?;
        let path = self.scratch_dir.join("edit.toml");
        let text = text.to_string();
        tokio::task::spawn_blocking(move || edit_in_editor(&path, &text)).await?
    }

    fn preview(&self, title: &str, body: &str) {
        println!("\n{}:\n```\n{}\n```\n", title, body);
    }

    fn show(&self, message: &Message) {
        match message.role {
            Role::Assistant => println!("Assistant: {}\n", message.content),
            Role::System => println!("System: {}\n", message.content),
            Role::User => println!("User: {}\n", message.content),
        }
    }
}
