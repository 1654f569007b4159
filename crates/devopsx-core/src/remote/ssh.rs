//! SSH transport backed by libssh2
//!
//! libssh2 is blocking, so every call runs on the blocking thread pool with
//! the session behind a mutex.

use async_trait::async_trait;
use parking_lot::Mutex;
use ssh2::Session;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::config::RemoteTarget;
use super::session::{Connector, RemoteSession};
use crate::error::{Error, Result};
use crate::tools::output::CommandOutput;

/// Opens SSH sessions with identity file, password or agent authentication
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

pub struct SshSession {
    key: String,
    session: Arc<Mutex<Session>>,
    alive: Arc<AtomicBool>,
}

fn open_session(
    target: &RemoteTarget,
    secret: Option<&str>,
    timeout: Duration,
) -> std::result::Result<Session, String> {
    let addr = (target.hostname.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| format!("cannot resolve {}: {}", target.hostname, e))?
        .next()
        .ok_or_else(|| format!("no address for {}", target.hostname))?;
    let tcp = TcpStream::connect_timeout(&addr, timeout).map_err(|e| e.to_string())?;

    let mut session = Session::new().map_err(|e| e.to_string())?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session.handshake().map_err(|e| format!("handshake failed: {}", e))?;

    let auth = match (&target.identity_file, secret) {
        (Some(identity), _) => session.userauth_pubkey_file(&target.user, None, identity, secret),
        (None, Some(password)) => session.userauth_password(&target.user, password),
        (None, None) => session.userauth_agent(&target.user),
    };
    auth.map_err(|e| format!("authentication failed: {}", e))?;
    if !session.authenticated() {
        return Err("authentication failed".to_string());
    }

    // Only the connect phase is bounded
    session.set_timeout(0);
    Ok(session)
}

fn run_channel(
    session: &Session,
    command: &str,
    stdin: Option<&str>,
) -> std::result::Result<CommandOutput, String> {
    let mut channel = session.channel_session().map_err(|e| e.to_string())?;
    channel.exec(command).map_err(|e| e.to_string())?;
    if let Some(input) = stdin {
        channel
            .write_all(input.as_bytes())
            .map_err(|e| e.to_string())?;
    }
    channel.send_eof().map_err(|e| e.to_string())?;

    let mut stdout = String::new();
    channel
        .read_to_string(&mut stdout)
        .map_err(|e| e.to_string())?;
    let mut stderr = String::new();
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|e| e.to_string())?;
    channel.wait_close().map_err(|e| e.to_string())?;

    Ok(CommandOutput {
        status: channel.exit_status().map_err(|e| e.to_string())?,
        stdout,
        stderr,
    })
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        key: &str,
        target: &RemoteTarget,
        secret: Option<&str>,
        timeout: Duration,
    ) -> Result<Arc<dyn RemoteSession>> {
        tracing::info!(key, target = %target, "Opening SSH session");
        let owned_target = target.clone();
        let owned_secret = secret.map(ToString::to_string);
        let session = tokio::task::spawn_blocking(move || {
            open_session(&owned_target, owned_secret.as_deref(), timeout)
        })
        .await
        .map_err(|e| Error::connection(key, e))?
        .map_err(|reason| Error::connection(key, reason))?;

        Ok(Arc::new(SshSession {
            key: key.to_string(),
            session: Arc::new(Mutex::new(session)),
            alive: Arc::new(AtomicBool::new(true)),
        }))
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str, stdin: Option<&str>) -> Result<CommandOutput> {
        let session = Arc::clone(&self.session);
        let alive = Arc::clone(&self.alive);
        let command = command.to_string();
        let stdin = stdin.map(ToString::to_string);

        let result = tokio::task::spawn_blocking(move || {
            let guard = session.lock();
            run_channel(&guard, &command, stdin.as_deref())
        })
        .await
        .map_err(|e| Error::connection(&self.key, e))?;

        result.map_err(|e| {
            alive.store(false, Ordering::SeqCst);
            Error::connection(&self.key, e)
        })
    }

    async fn keepalive(&self) -> Result<()> {
        let session = Arc::clone(&self.session);
        let result = tokio::task::spawn_blocking(move || session.lock().keepalive_send())
            .await
            .map_err(|e| Error::connection(&self.key, e))?;
        if let Err(e) = result {
            self.alive.store(false, Ordering::SeqCst);
            return Err(Error::connection(&self.key, e));
        }
        Ok(())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}
