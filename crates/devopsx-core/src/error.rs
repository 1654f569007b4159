//! Error taxonomy shared by the transcript store, tool dispatch and remote pool

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Persistence failure. Fatal to the operation that triggered it.
    #[error("I/O error while {operation} at {path}: {source}")]
    Io {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A transcript file that was only partially written or hand-edited badly.
    #[error("corrupt record at {path}:{line}: {reason}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("{0} already exists")]
    AlreadyExists(PathBuf),

    #[error("could not connect to {target}: {reason}")]
    ConnectionFailed { target: String, reason: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("cancelled by user")]
    Cancelled,

    #[error("timed out after {}s", .0.as_secs_f32())]
    Timeout(Duration),

    #[error("unknown {kind} '{name}'. {hint}")]
    Unregistered {
        kind: &'static str,
        name: String,
        hint: String,
    },
}

impl Error {
    #[must_use]
    pub fn io(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            path: path.into(),
            source,
        }
    }

    #[must_use]
    pub fn connection(target: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ConnectionFailed {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    #[must_use]
    pub fn unregistered(
        kind: &'static str,
        name: impl Into<String>,
        hint: impl Into<String>,
    ) -> Self {
        Self::Unregistered {
            kind,
            name: name.into(),
            hint: hint.into(),
        }
    }

    /// Whether the error came from the operator declining a prompt
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_message_carries_hint() {
        let err = Error::unregistered("agent", "D9", "Register it with `agent add D9 user@host`.");
        assert_eq!(
            err.to_string(),
            "unknown agent 'D9'. Register it with `agent add D9 user@host`."
        );
    }

    #[test]
    fn timeout_formats_seconds() {
        let err = Error::Timeout(Duration::from_millis(1500));
        assert_eq!(err.to_string(), "timed out after 1.5s");
    }
}
