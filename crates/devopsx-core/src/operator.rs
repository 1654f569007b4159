//! The human at the terminal, as seen by capabilities
//!
//! Capabilities never read stdin directly. They ask the `Operator` to confirm
//! an action, supply a secret or edit a document, which lets tests script the
//! answers.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::message::Message;

#[async_trait]
pub trait Operator: Send + Sync {
    /// Ask a yes/no question. Anything but an explicit yes is a no.
    async fn confirm(&self, question: &str) -> bool;

    /// Collect a secret such as a password. `None` when the operator declines.
    async fn secret(&self, prompt: &str) -> Option<String>;

    /// Open text for editing and return the result
    async fn edit_text(&self, text: &str) -> anyhow::Result<String>;

    /// Show what is about to be executed
    fn preview(&self, title: &str, body: &str);

    /// Display a message produced by the runtime
    fn show(&self, message: &Message);
}

/// Says yes to everything and never has a secret. Used for `--no-confirm`
/// runs and delegated sub-conversations.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoConfirm;

#[async_trait]
impl Operator for AutoConfirm {
    async fn confirm(&self, _question: &str) -> bool {
        true
    }

    async fn secret(&self, _prompt: &str) -> Option<String> {
        None
    }

    async fn edit_text(&self, text: &str) -> anyhow::Result<String> {
        Ok(text.to_string())
    }

    fn preview(&self, _title: &str, _body: &str) {}

    fn show(&self, _message: &Message) {}
}

/// Replays queued answers and records every question asked
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    answers: Mutex<VecDeque<bool>>,
    secrets: Mutex<VecDeque<String>>,
    edits: Mutex<VecDeque<String>>,
    asked: Mutex<Vec<String>>,
    shown: Mutex<Vec<Message>>,
}

impl ScriptedOperator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_answers(self, answers: impl IntoIterator<Item = bool>) -> Self {
        self.answers.lock().extend(answers);
        self
    }

    pub fn with_secrets(self, secrets: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.secrets
            .lock()
            .extend(secrets.into_iter().map(Into::into));
        self
    }

    pub fn with_edit(self, edited: impl Into<String>) -> Self {
        self.edits.lock().push_back(edited.into());
        self
    }

    /// Questions and secret prompts in the order they were asked
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().clone()
    }

    pub fn shown(&self) -> Vec<Message> {
        self.shown.lock().clone()
    }
}

#[async_trait]
impl Operator for ScriptedOperator {
    async fn confirm(&self, question: &str) -> bool {
        self.asked.lock().push(question.to_string());
        self.answers.lock().pop_front().unwrap_or(false)
    }

    async fn secret(&self, prompt: &str) -> Option<String> {
        self.asked.lock().push(prompt.to_string());
        self.secrets.lock().pop_front()
    }

    async fn edit_text(&self, text: &str) -> anyhow::Result<String> {
        Ok(self
            .edits
            .lock()
            .pop_front()
            .unwrap_or_else(|| text.to_string()))
    }

    fn preview(&self, _title: &str, _body: &str) {}

    fn show(&self, message: &Message) {
        self.shown.lock().push(message.clone());
    }
}
