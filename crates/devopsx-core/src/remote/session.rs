//! Seams between the pool and the transport

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use super::config::RemoteTarget;
use crate::error::Result;
use crate::tools::output::CommandOutput;

/// A live authenticated session on one host
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a command to completion, optionally feeding `stdin`
    async fn exec(&self, command: &str, stdin: Option<&str>) -> Result<CommandOutput>;

    /// Send a keepalive message
    async fn keepalive(&self) -> Result<()>;

    /// False once the transport is known to be broken
    fn is_alive(&self) -> bool;
}

/// Opens sessions for registered targets
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate. `secret` is the password for targets using
    /// interactive authentication.
    async fn connect(
        &self,
        key: &str,
        target: &RemoteTarget,
        secret: Option<&str>,
        timeout: Duration,
    ) -> Result<Arc<dyn RemoteSession>>;
}
