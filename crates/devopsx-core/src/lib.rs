//! devopsx core library
//!
//! Conversation state, context reduction, tool dispatch, remote execution
//! and delegated sub-conversations. The `devopsx` binary is a thin front end
//! over this crate.

pub mod chat;
pub mod commands;
pub mod config;
pub mod constants;
pub mod delegation;
pub mod error;
pub mod llm;
pub mod message;
pub mod operator;
pub mod paths;
pub mod reduce;
pub mod remote;
pub mod tools;
pub mod transcript;
pub mod truncation;

pub use chat::{ChatSession, Runtime, RuntimeBuilder, StepOutcome};
pub use config::Config;
pub use error::{Error, Result};
pub use message::{Message, Role};
pub use paths::Paths;
pub use transcript::Transcript;
