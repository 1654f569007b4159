//! Centralized path utilities
//!
//! All application paths hang off a `Paths` value that is passed explicitly,
//! so tests can root everything in a temporary directory.

use std::path::{Path, PathBuf};

use crate::constants::files;

/// Environment variable that relocates every devopsx directory under one root
pub const HOME_ENV: &str = "DEVOPSX_HOME";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    /// Config files (`config.toml`, `agents.toml`)
    pub config_dir: PathBuf,
    /// One directory per conversation
    pub logs_dir: PathBuf,
}

impl Paths {
    /// Resolve default locations (`$DEVOPSX_HOME`, else the platform dirs)
    pub fn from_env() -> Self {
        if let Some(root) = std::env::var_os(HOME_ENV) {
            return Self::rooted(PathBuf::from(root));
        }

        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(files::APP_DIR_NAME);
        let logs_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(files::APP_DIR_NAME)
            .join("logs");
        Self {
            config_dir,
            logs_dir,
        }
    }

    /// Place config and logs under a single directory
    pub fn rooted(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            config_dir: root.join("config"),
            logs_dir: root.join("logs"),
        }
    }

    /// Get the config file (<config_dir>/config.toml)
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(files::CONFIG_FILE)
    }

    /// Get the remote targets file (<config_dir>/agents.toml)
    pub fn agents_file(&self) -> PathBuf {
        self.config_dir.join(files::AGENTS_FILE)
    }

    /// Get the directory holding one conversation
    pub fn conversation_dir(&self, name: &str) -> PathBuf {
        self.logs_dir.join(name)
    }

    /// Directory for the CLI's own diagnostic log
    pub fn diagnostics_dir(&self) -> PathBuf {
        self.logs_dir.join(".diagnostics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rooted_layout() {
        let paths = Paths::rooted("/tmp/x");
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/x/config/config.toml"));
        assert_eq!(paths.agents_file(), PathBuf::from("/tmp/x/config/agents.toml"));
        assert_eq!(
            paths.conversation_dir("chat"),
            PathBuf::from("/tmp/x/logs/chat")
        );
    }
}
