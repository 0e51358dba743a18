//! Date/Time Tool

use async_trait::async_trait;
use chrono::{Local, Utc};
use serde_json::{json, Value};

use agent_core::{tool::ParameterSchema, AgentError, Result as CoreResult, Tool, ToolSchema};

/// Tool reporting the server's current date and time
pub struct DateTimeTool;

#[async_trait]
impl Tool for DateTimeTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("get_current_datetime", "Get the current date and time of the server.")
            .param(
                ParameterSchema::optional(
                    "format",
                    "string",
                    "'human' (YYYY-MM-DD HH:MM:SS, local time), 'iso' (RFC 3339, UTC) or 'unix' (seconds)",
                )
                .with_default(json!("human"))
                .with_enum(vec![json!("human"), json!("iso"), json!("unix")]),
            )
            .category("time")
    }

    async fn execute(&self, arguments: &Value) -> CoreResult<Value> {
        let format = arguments["format"].as_str().unwrap_or("human");
        match format {
            "human" => Ok(Value::String(Local::now().format("%Y-%m-%d %H:%M:%S").to_string())),
            "iso" => Ok(Value::String(Utc::now().to_rfc3339())),
            "unix" => Ok(json!(Utc::now().timestamp())),
            other => Err(AgentError::ToolExecution(format!("unsupported format '{other}'"))),
        }
    }
}
