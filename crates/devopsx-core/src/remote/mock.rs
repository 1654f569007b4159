//! In-process remote transport for tests and dry runs
//!
//! `MockSession` understands a handful of commands:
//!
//! - `echo <text>` prints `<text>`
//! - `exit <n>` returns status `n`
//! - `disconnect` fails and marks the session dead
//! - `sleep <secs>` waits before returning
//! - `sudo -S ...` fails like sudo when stdin does not hold the password
//!   set with `MockConnector::with_sudo_password`
//!
//! Anything else succeeds with no output. Every executed command is recorded.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::config::RemoteTarget;
use super::session::{Connector, RemoteSession};
use crate::error::{Error, Result};
use crate::tools::output::CommandOutput;

/// One executed command and the stdin it received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRecord {
    pub key: String,
    pub command: String,
    pub stdin: Option<String>,
}

/// Connector that never touches the network
#[derive(Default)]
pub struct MockConnector {
    connects: AtomicUsize,
    unreachable: Mutex<HashSet<String>>,
    log: Arc<Mutex<Vec<ExecRecord>>>,
    secrets: Mutex<Vec<Option<String>>>,
    sudo_password: Option<String>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connections to `hostname` fail
    pub fn with_unreachable(self, hostname: &str) -> Self {
        self.unreachable.lock().insert(hostname.to_string());
        self
    }

    /// Password that elevated commands must receive on stdin
    pub fn with_sudo_password(mut self, password: &str) -> Self {
        self.sudo_password = Some(password.to_string());
        self
    }

    /// Number of sessions opened so far
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Secrets handed to `connect`, in order
    pub fn secrets(&self) -> Vec<Option<String>> {
        self.secrets.lock().clone()
    }

    /// Every command executed on any session from this connector
    pub fn executed(&self) -> Vec<ExecRecord> {
        self.log.lock().clone()
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        key: &str,
        target: &RemoteTarget,
        secret: Option<&str>,
        _timeout: Duration,
    ) -> Result<Arc<dyn RemoteSession>> {
        self.secrets.lock().push(secret.map(ToString::to_string));
        if self.unreachable.lock().contains(&target.hostname) {
            return Err(Error::connection(key, "connection refused"));
        }
        if target.needs_secret() && secret.is_none() {
            return Err(Error::connection(key, "authentication failed"));
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockSession {
            key: key.to_string(),
            alive: AtomicBool::new(true),
            log: Arc::clone(&self.log),
            sudo_password: self.sudo_password.clone(),
        }))
    }
}

pub struct MockSession {
    key: String,
    alive: AtomicBool,
    log: Arc<Mutex<Vec<ExecRecord>>>,
    sudo_password: Option<String>,
}

#[async_trait]
impl RemoteSession for MockSession {
    async fn exec(&self, command: &str, stdin: Option<&str>) -> Result<CommandOutput> {
        if !self.is_alive() {
            return Err(Error::connection(&self.key, "session closed"));
        }
        self.log.lock().push(ExecRecord {
            key: self.key.clone(),
            command: command.to_string(),
            stdin: stdin.map(ToString::to_string),
        });

        if let (Some(expected), true) = (&self.sudo_password, command.starts_with("sudo -S")) {
            let given = stdin.unwrap_or("").trim_end_matches('\n');
            if given != expected {
                return Ok(CommandOutput {
                    status: 1,
                    stdout: String::new(),
                    stderr: "Sorry, try again.\nsudo: 1 incorrect password attempt\n".to_string(),
                });
            }
        }

        let (program, rest) = command.trim().split_once(' ').unwrap_or((command.trim(), ""));
        match program {
            "echo" => Ok(CommandOutput {
                status: 0,
                stdout: format!("{}\n", rest),
                stderr: String::new(),
            }),
            "exit" => Ok(CommandOutput {
                status: rest.trim().parse().unwrap_or(1),
                ..Default::default()
            }),
            "disconnect" => {
                self.alive.store(false, Ordering::SeqCst);
                Err(Error::connection(&self.key, "connection reset by peer"))
            }
            "sleep" => {
                let secs: f64 = rest.trim().parse().unwrap_or(0.0);
                tokio::time::sleep(Duration::from_secs_f64(secs)).await;
                Ok(CommandOutput::default())
            }
            _ => Ok(CommandOutput::default()),
        }
    }

    async fn keepalive(&self) -> Result<()> {
        if self.is_alive() {
            Ok(())
        } else {
            Err(Error::connection(&self.key, "session closed"))
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
