//! Conversation message record
//!
//! Messages are immutable once appended. Flags default to false and are
//! omitted from the persisted form when unset.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::{CHARS_PER_TOKEN, CMDFIX};

/// Author of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };
        f.write_str(name)
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    /// Kept in the transcript but never sent to the model
    #[serde(default, alias = "hide", skip_serializing_if = "is_false")]
    pub hidden: bool,
    /// Never evicted by context reduction
    #[serde(default, skip_serializing_if = "is_false")]
    pub pinned: bool,
    /// Not echoed to the terminal
    #[serde(default, skip_serializing_if = "is_false")]
    pub quiet: bool,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp: Utc::now(),
            hidden: false,
            pinned: false,
            quiet: false,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn with_hidden(mut self, hidden: bool) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_pinned(mut self, pinned: bool) -> Self {
        self.pinned = pinned;
        self
    }

    pub fn with_quiet(mut self, quiet: bool) -> Self {
        self.quiet = quiet;
        self
    }

    /// Same message with different content, keeping role, timestamp and flags
    pub fn replace_content(&self, content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..self.clone()
        }
    }

    /// Whether this is a user message addressed to the command dispatcher
    pub fn is_command(&self) -> bool {
        self.role == Role::User && self.content.starts_with(CMDFIX)
    }

    /// Whether the reducer must keep this message regardless of budget
    pub fn is_protected(&self) -> bool {
        self.pinned || self.role == Role::System
    }

    /// Estimated token count of the content
    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.content)
    }

    /// One-line rendering used by `/log` and the CLI
    pub fn format_line(&self, max_len: Option<usize>) -> String {
        let content = match max_len {
            Some(limit) if self.content.chars().count() > limit => {
                let head: String = self.content.chars().take(limit).collect();
                format!("{}...", head)
            }
            _ => self.content.clone(),
        };
        format!("{}: {}", self.role, content)
    }
}

/// Deterministic chars/4 token estimate
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Total estimated tokens across a message list
pub fn len_tokens(messages: &[Message]) -> usize {
    messages.iter().map(Message::tokens).sum()
}

/// Serializable wrapper used when a branch is edited as a TOML document
#[derive(Debug, Serialize, Deserialize)]
pub struct MessageDocument {
    #[serde(default)]
    pub messages: Vec<Message>,
}

impl MessageDocument {
    pub fn to_toml(messages: &[Message]) -> anyhow::Result<String> {
        let doc = MessageDocument {
            messages: messages.to_vec(),
        };
        Ok(toml::to_string_pretty(&doc)?)
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Vec<Message>> {
        let doc: MessageDocument = toml::from_str(text)?;
        Ok(doc.messages)
    }
}
