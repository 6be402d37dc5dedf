//! System information tool.

use async_trait::async_trait;
use meshtalk_core::error::ToolError;
use meshtalk_core::tool::{ToolCategory, ToolContext, ToolHandler, ToolSpec};

pub struct SystemInfoTool;

impl SystemInfoTool {
    pub const NAME: &'static str = "system_info";

    pub fn spec() -> ToolSpec {
        ToolSpec::new(
            Self::NAME,
            "Report the operating system, architecture, CPU count, working directory and local time.",
            ToolCategory::System,
            serde_json::json!({ "type": "object", "properties": {} }),
        )
    }
}

#[async_trait]
impl ToolHandler for SystemInfoTool {
    async fn call(&self, ctx: &ToolContext, _arguments: serde_json::Value) -> Result<String, ToolError> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let info = serde_json::json!({
            "os": std::env::consts::OS,
            "family": std::env::consts::FAMILY,
            "arch": std::env::consts::ARCH,
            "cpus": cpus,
            "working_dir": ctx.working_dir.display().to_string(),
            "local_time": chrono::Local::now().to_rfc3339(),
        });
        serde_json::to_string_pretty(&info).map_err(|e| ToolError::failed(Self::NAME, e))
    }
}
