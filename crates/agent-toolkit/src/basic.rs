//! Greeting and echo tools, handy for checking an agent connection end to end

use async_trait::async_trait;
use serde_json::Value;

use agent_core::{tool::ParameterSchema, Result as CoreResult, Tool, ToolSchema};

pub struct GreetTool;

#[async_trait]
impl Tool for GreetTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("greet", "Greet a user by name.")
            .param(ParameterSchema::required("name", "string", "Name of the user"))
            .category("basic")
    }

    async fn execute(&self, arguments: &Value) -> CoreResult<Value> {
        let name = arguments["name"].as_str().unwrap_or_default();
        Ok(Value::String(format!("Hello, {name}!")))
    }
}

pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("echo", "Return the given message unchanged.")
            .param(ParameterSchema::required("message", "string", "Message to echo"))
            .category("basic")
    }

    async fn execute(&self, arguments: &Value) -> CoreResult<Value> {
        Ok(arguments["message"].clone())
    }
}
