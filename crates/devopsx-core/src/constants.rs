//! Shared constants

/// Prefix that marks a user message as a slash command
pub const CMDFIX: &str = "/";

/// Characters per estimated token
pub const CHARS_PER_TOKEN: usize = 4;

/// Elision marker placed where content was removed
pub const ELISION_MARKER: &str = "[...]";

/// Name of the branch every transcript starts with
pub const MAIN_BRANCH: &str = "main";

/// Upper bound on automatic step cycles in one non-interactive run
pub const MAX_ITERATIONS: usize = 50;

pub mod files {
    pub const CONVERSATION_FILE: &str = "conversation.jsonl";
    pub const BRANCHES_DIR: &str = "branches";
    pub const CONFIG_FILE: &str = "config.toml";
    pub const AGENTS_FILE: &str = "agents.toml";
    pub const APP_DIR_NAME: &str = "devopsx";
}
