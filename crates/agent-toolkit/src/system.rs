//! System Info Tool

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};

use agent_core::{Result as CoreResult, Tool, ToolSchema};

/// Tool describing the host the agent runs on
pub struct SystemInfoTool;

#[async_trait]
impl Tool for SystemInfoTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new(
            "get_system_info",
            "Get basic information about the server: OS, architecture, CPU count and current time.",
        )
        .category("system")
    }

    async fn execute(&self, _arguments: &Value) -> CoreResult<Value> {
        let cpus = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Ok(json!({
            "os": std::env::consts::OS,
            "family": std::env::consts::FAMILY,
            "arch": std::env::consts::ARCH,
            "cpus": cpus,
            "agent_version": env!("CARGO_PKG_VERSION"),
            "current_time": Utc::now().to_rfc3339(),
        }))
    }
}
