//! Runtime configuration
//!
//! Parses `config.toml` from the config directory. A missing file yields
//! defaults; environment variables are applied on top.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::paths::Paths;

/// Environment variable overriding `model`
pub const MODEL_ENV: &str = "MODEL";
/// Environment variable overriding `context.budget_tokens`
pub const BUDGET_ENV: &str = "DEVOPSX_CONTEXT_BUDGET";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model identifier handed to the completion provider
    pub model: String,
    pub context: ContextConfig,
    pub tools: ToolsConfig,
    pub remote: RemoteConfig,
    pub delegation: DelegationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: "local/mock".to_string(),
            context: ContextConfig::default(),
            tools: ToolsConfig::default(),
            remote: RemoteConfig::default(),
            delegation: DelegationConfig::default(),
        }
    }
}

/// Context reducer thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub budget_tokens: usize,
    pub message_threshold_tokens: usize,
    pub head_lines: usize,
    pub tail_lines: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            budget_tokens: 100_000,
            message_threshold_tokens: 4_000,
            head_lines: 10,
            tail_lines: 10,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Ask the operator before side effects
    pub confirm: bool,
    pub shell_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            confirm: true,
            shell_timeout_secs: 120,
        }
    }
}

impl ToolsConfig {
    pub fn shell_timeout(&self) -> Duration {
        Duration::from_secs(self.shell_timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub keepalive_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            keepalive_secs: 60,
            connect_timeout_secs: 4,
        }
    }
}

impl RemoteConfig {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationConfig {
    pub default_wait_secs: u64,
}

impl Default for DelegationConfig {
    fn default() -> Self {
        Self {
            default_wait_secs: 60,
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides
    pub fn load(paths: &Paths) -> Result<Self> {
        let mut config = Self::load_from_path(&paths.config_file())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a specific file. A missing file yields defaults.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply overrides from a variable lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(model) = lookup(MODEL_ENV).filter(|m| !m.trim().is_empty()) {
            self.model = model.trim().to_string();
        }
        if let Some(budget) = lookup(BUDGET_ENV) {
            match budget.trim().parse::<usize>() {
                Ok(value) => self.context.budget_tokens = value,
                Err(_) => tracing::warn!(value = %budget, "Ignoring invalid {}", BUDGET_ENV),
            }
        }
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
