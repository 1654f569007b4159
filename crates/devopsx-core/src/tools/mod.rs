//! Tool-use protocol
//!
//! - `codeblock`: fenced block extraction
//! - `tooluse`: invocations from fenced and tagged forms
//! - `registry`: capability lookup and execution
//! - `output`: command output rendering
//! - `implementations`: the built-in capabilities

pub mod codeblock;
pub mod implementations;
pub mod output;
pub mod registry;
pub mod tooluse;

pub use output::CommandOutput;
pub use registry::{Capability, ToolContext, ToolRegistry};
pub use tooluse::ToolUse;
