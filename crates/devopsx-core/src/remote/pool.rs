//! Keyed cache of live remote sessions
//!
//! Each key owns a slot guarded by an async mutex. The slot lock is held while
//! a session is established and while a command runs, so concurrent first use
//! opens one session and commands on the same host run one at a time. A
//! session that fails is dropped from its slot and reopened on the next use.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;

use super::config::{normalize_key, RemoteTarget, TargetStore};
use super::elevate::{elevated_command, elevation_target, password_stdin, sudo_rejected};
use super::session::{Connector, RemoteSession};
use crate::config::RemoteConfig;
use crate::error::{Error, Result};
use crate::operator::Operator;
use crate::tools::output::CommandOutput;

const REGISTER_HINT: &str = "Register it with `add <ID> [-i <identity>] [-p <port>] <user>@<host>`.";

#[derive(Default)]
struct Slot {
    session: Option<Arc<dyn RemoteSession>>,
    /// Password collected from the operator for this process only
    secret: Option<String>,
}

impl Slot {
    fn live_session(&self) -> Option<Arc<dyn RemoteSession>> {
        self.session.clone().filter(|s| s.is_alive())
    }
}

/// Connection state of a target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    NotRegistered,
    Connected,
    Disconnected,
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotRegistered => "Not Registered",
            Self::Connected => "Connected",
            Self::Disconnected => "Disconnected",
        };
        f.write_str(label)
    }
}

pub struct RemotePool {
    store: Mutex<TargetStore>,
    connector: Arc<dyn Connector>,
    slots: DashMap<String, Arc<AsyncMutex<Slot>>>,
    settings: RemoteConfig,
}

impl RemotePool {
    pub fn new(store: TargetStore, connector: Arc<dyn Connector>, settings: RemoteConfig) -> Self {
        Self {
            store: Mutex::new(store),
            connector,
            slots: DashMap::new(),
            settings,
        }
    }

    fn slot(&self, key: &str) -> Arc<AsyncMutex<Slot>> {
        Arc::clone(self.slots.entry(key.to_string()).or_default().value())
    }

    fn target(&self, key: &str) -> Result<RemoteTarget> {
        self.store
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::unregistered("remote target", key, REGISTER_HINT))
    }

    pub fn is_registered(&self, key: &str) -> bool {
        self.store.lock().contains(key)
    }

    /// Registered targets, sorted by key
    pub fn targets(&self) -> Vec<(String, RemoteTarget)> {
        self.store
            .lock()
            .iter()
            .map(|(key, target)| (key.clone(), target.clone()))
            .collect()
    }

    pub async fn status(&self, key: &str) -> TargetStatus {
        let key = normalize_key(key);
        if !self.is_registered(&key) {
            return TargetStatus::NotRegistered;
        }
        let Some(slot) = self.slots.get(&key).map(|s| Arc::clone(s.value())) else {
            return TargetStatus::Disconnected;
        };
        let slot = slot.lock().await;
        if slot.live_session().is_some() {
            TargetStatus::Connected
        } else {
            TargetStatus::Disconnected
        }
    }

    async fn collect_secret(
        &self,
        target: &RemoteTarget,
        slot: &mut Slot,
        prompt: &str,
        operator: &dyn Operator,
    ) -> Result<String> {
        if let Some(secret) = &slot.secret {
            return Ok(secret.clone());
        }
        let secret = operator
            .secret(&format!("{} for {}:", prompt, target))
            .await
            .ok_or(Error::Cancelled)?;
        slot.secret = Some(secret.clone());
        Ok(secret)
    }

    async fn establish(
        &self,
        key: &str,
        target: &RemoteTarget,
        slot: &mut Slot,
        operator: &dyn Operator,
    ) -> Result<Arc<dyn RemoteSession>> {
        let secret = if target.needs_secret() {
            Some(self.collect_secret(target, slot, "Password", operator).await?)
        } else {
            None
        };

        match self
            .connector
            .connect(key, target, secret.as_deref(), self.settings.connect_timeout())
            .await
        {
            Ok(session) => {
                tracing::info!(key, target = %target, "Remote session established");
                slot.session = Some(Arc::clone(&session));
                Ok(session)
            }
            Err(e) => {
                // A wrong password must not be reused
                if target.needs_secret() {
                    slot.secret = None;
                }
                tracing::warn!(key, error = %e, "Remote connection failed");
                Err(e)
            }
        }
    }

    /// Verify connectivity, then persist the target and keep its session.
    pub async fn register(
        &self,
        key: &str,
        target: RemoteTarget,
        operator: &dyn Operator,
    ) -> Result<()> {
        let key = normalize_key(key);
        let slot = self.slot(&key);
        let mut slot = slot.lock().await;
        slot.session = None;
        slot.secret = None;

        if let Err(e) = self.establish(&key, &target, &mut slot, operator).await {
            drop(slot);
            self.slots.remove(&key);
            return Err(e);
        }

        let mut store = self.store.lock();
        store.insert(&key, target);
        store.save()?;
        tracing::info!(key = %key, "Registered remote target");
        Ok(())
    }

    /// Forget a target and close its cached session
    pub async fn deregister(&self, key: &str) -> Result<()> {
        let key = normalize_key(key);
        {
            let mut store = self.store.lock();
            if store.remove(&key).is_none() {
                return Err(Error::unregistered("remote target", &key, REGISTER_HINT));
            }
            store.save()?;
        }
        if let Some((_, slot)) = self.slots.remove(&key) {
            slot.lock().await.session = None;
        }
        tracing::info!(key = %key, "Deregistered remote target");
        Ok(())
    }

    /// Run `command` on the target registered as `key`.
    ///
    /// `elevate` forces the sudo path; a command that starts with `sudo` takes
    /// it automatically. A transport failure evicts the session and is
    /// returned; the next call reconnects.
    pub async fn run(
        &self,
        key: &str,
        command: &str,
        elevate: bool,
        operator: &dyn Operator,
    ) -> Result<CommandOutput> {
        let key = normalize_key(key);
        let target = self.target(&key)?;
        let slot = self.slot(&key);
        let mut slot = slot.lock().await;

        let session = match slot.live_session() {
            Some(session) => session,
            None => self.establish(&key, &target, &mut slot, operator).await?,
        };

        let elevated = if elevate {
            Some(command.trim().to_string())
        } else {
            elevation_target(command)
        };

        tracing::info!(key = %key, command, elevated = elevated.is_some(), "Running remote command");
        let result = match elevated {
            Some(inner) => {
                let secret = self
                    .collect_secret(&target, &mut slot, "Sudo password", operator)
                    .await?;
                let result = session
                    .exec(&elevated_command(&inner), Some(&password_stdin(&secret)))
                    .await;
                if let Ok(output) = &result {
                    if sudo_rejected(output.status, &output.stderr) {
                        tracing::warn!(key = %key, "Sudo refused the password, asking again next time");
                        slot.secret = None;
                    }
                }
                result
            }
            None => session.exec(command, None).await,
        };

        if let Err(e) = &result {
            tracing::warn!(key = %key, error = %e, "Remote command failed, evicting session");
            slot.session = None;
        }
        result
    }

    /// Probe every idle session once, evicting the ones that fail
    pub async fn keepalive_once(&self) {
        let slots: Vec<(String, Arc<AsyncMutex<Slot>>)> = self
            .slots
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (key, slot) in slots {
            // Busy slots are in use, which keeps them alive
            let Ok(mut slot) = slot.try_lock() else {
                continue;
            };
            let Some(session) = slot.session.clone() else {
                continue;
            };
            if let Err(e) = session.keepalive().await {
                tracing::debug!(key = %key, error = %e, "Keepalive failed, evicting session");
                slot.session = None;
            }
        }
    }

    /// Probe sessions periodically until the pool is dropped
    pub fn spawn_keepalive(self: &Arc<Self>) -> JoinHandle<()> {
        let pool: Weak<Self> = Arc::downgrade(self);
        let period: Duration = self.settings.keepalive_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.keepalive_once().await;
            }
        })
    }
}
