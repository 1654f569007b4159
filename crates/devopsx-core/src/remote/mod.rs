//! Remote execution on registered hosts
//!
//! - `config`: persisted targets (`agents.toml`)
//! - `pool`: one cached session per target key
//! - `session`: transport traits
//! - `ssh`: the libssh2 transport
//! - `mock`: an in-process transport
//! - `elevate`: the `sudo` path

pub mod config;
pub mod elevate;
pub mod mock;
pub mod pool;
pub mod session;
pub mod ssh;

pub use config::{normalize_key, RemoteTarget, TargetStore};
pub use pool::{RemotePool, TargetStatus};
pub use session::{Connector, RemoteSession};
pub use ssh::SshConnector;
