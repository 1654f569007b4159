//! Persisted remote targets (`agents.toml`)
//!
//! Keys are normalized to upper case. A target stores either an identity file
//! or a flag requesting interactive password authentication. Passwords are
//! never written to disk.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::paths::Paths;

pub const DEFAULT_SSH_PORT: u16 = 22;

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Connection parameters for one remote host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTarget {
    pub hostname: String,
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    #[serde(default)]
    pub password_authentication: bool,
}

impl RemoteTarget {
    pub fn with_identity(user: &str, hostname: &str, port: u16, identity: PathBuf) -> Self {
        Self {
            hostname: hostname.to_string(),
            user: user.to_string(),
            port,
            identity_file: Some(identity),
            password_authentication: false,
        }
    }

    pub fn with_password(user: &str, hostname: &str, port: u16) -> Self {
        Self {
            hostname: hostname.to_string(),
            user: user.to_string(),
            port,
            identity_file: None,
            password_authentication: true,
        }
    }

    /// Parse `user@host`
    pub fn parse_destination(destination: &str) -> Option<(String, String)> {
        let (user, host) = destination.split_once('@')?;
        if user.is_empty() || host.is_empty() {
            return None;
        }
        Some((user.to_string(), host.to_string()))
    }

    /// Whether connecting requires a secret from the operator
    pub fn needs_secret(&self) -> bool {
        self.password_authentication
    }
}

impl fmt::Display for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.hostname, self.port)
    }
}

/// Normalize a target key (`web1` and `WEB1` address the same host)
pub fn normalize_key(key: &str) -> String {
    key.trim().to_uppercase()
}

/// On-disk set of registered targets
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TargetStore {
    targets: BTreeMap<String, RemoteTarget>,
    /// Backing file. `None` for an ephemeral store.
    path: Option<PathBuf>,
}

impl TargetStore {
    /// In-memory store that is never persisted
    pub fn ephemeral() -> Self {
        Self::default()
    }

    /// Load the store from the config directory
    pub fn load(paths: &Paths) -> Result<Self> {
        Self::load_from_path(&paths.agents_file())
    }

    /// Load from a specific file. A missing file is an empty store.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut store = if path.exists() {
            let content = fs::read_to_string(path)
                .map_err(|source| Error::io("reading remote targets", path, source))?;
            let raw: BTreeMap<String, RemoteTarget> = toml::from_str(&content)
                .map_err(|e| Error::Parse(format!("{}: {}", path.display(), e)))?;
            Self {
                targets: raw
                    .into_iter()
                    .map(|(key, target)| (normalize_key(&key), target))
                    .collect(),
                path: None,
            }
        } else {
            Self::default()
        };
        store.path = Some(path.to_path_buf());
        Ok(store)
    }

    /// Persist with owner-only permissions
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| Error::io("creating config directory", parent, source))?;
        }
        let contents = toml::to_string_pretty(&self.targets)
            .map_err(|e| Error::Parse(format!("serializing remote targets: {}", e)))?;
        fs::write(path, contents).map_err(|source| Error::io("writing remote targets", path, source))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Ok(metadata) = fs::metadata(path) {
                let mut permissions = metadata.permissions();
                permissions.set_mode(0o600);
                let _ = fs::set_permissions(path, permissions);
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&RemoteTarget> {
        self.targets.get(&normalize_key(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.targets.contains_key(&normalize_key(key))
    }

    pub fn insert(&mut self, key: &str, target: RemoteTarget) {
        self.targets.insert(normalize_key(key), target);
    }

    pub fn remove(&mut self, key: &str) -> Option<RemoteTarget> {
        self.targets.remove(&normalize_key(key))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RemoteTarget)> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_round_trip_normalizes_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agents.toml");
        let mut store = TargetStore::load_from_path(&path).unwrap();
        assert!(store.is_empty());

        store.insert("web1", RemoteTarget::with_password("deploy", "10.0.0.5", 2222));
        store.save().unwrap();

        let loaded = TargetStore::load_from_path(&path).unwrap();
        let target = loaded.get("WEB1").unwrap();
        assert_eq!(target.port, 2222);
        assert!(target.needs_secret());
        assert!(loaded.contains("Web1"));

        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("[WEB1]"));
        assert!(!raw.contains("identity_file"));
    }

    #[test]
    fn test_hand_written_file_defaults_port() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agents.toml");
        std::fs::write(
            &path,
            "[db]\nhostname = \"db.internal\"\nuser = \"root\"\nidentity_file = \"/keys/id\"\n",
        )
        .unwrap();
        let store = TargetStore::load_from_path(&path).unwrap();
        let target = store.get("DB").unwrap();
        assert_eq!(target.port, DEFAULT_SSH_PORT);
        assert_eq!(target.identity_file.as_deref(), Some(Path::new("/keys/id")));
        assert!(!target.password_authentication);
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_file_is_private() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agents.toml");
        let mut store = TargetStore::load_from_path(&path).unwrap();
        store.insert("a", RemoteTarget::with_password("u", "h", 22));
        store.save().unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn test_parse_destination() {
        assert_eq!(
            RemoteTarget::parse_destination("root@example.com"),
            Some(("root".to_string(), "example.com".to_string()))
        );
        assert!(RemoteTarget::parse_destination("example.com").is_none());
        assert!(RemoteTarget::parse_destination("@host").is_none());
    }
}
