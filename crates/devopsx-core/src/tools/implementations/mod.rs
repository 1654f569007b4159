//! Built-in capabilities

pub mod patch;
pub mod python;
pub mod remote;
pub mod save;
pub mod shell;
pub mod subthread;

use std::sync::Arc;

use crate::tools::registry::{Capability, ToolRegistry};

pub use patch::PatchTool;
pub use python::PythonTool;
pub use remote::RemoteTool;
pub use save::{AppendTool, SaveTool};
pub use shell::ShellTool;
pub use subthread::SubthreadTool;

/// Register every built-in capability. One that fails to initialize is
/// left out and the rest still load.
pub fn register_all_tools(registry: &ToolRegistry) {
    let tools: Vec<Arc<dyn Capability>> = vec![
        Arc::new(ShellTool),
        Arc::new(SaveTool),
        Arc::new(AppendTool),
        Arc::new(PatchTool),
        Arc::new(PythonTool),
        Arc::new(RemoteTool),
        Arc::new(SubthreadTool),
    ];
    for tool in tools {
        let name = tool.name().to_string();
        if let Err(e) = registry.register(tool) {
            tracing::warn!(tool = %name, error = %e, "Skipping capability");
        }
    }
}
