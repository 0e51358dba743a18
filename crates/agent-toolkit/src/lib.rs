//! # agent-toolkit
//!
//! Built-in tools implementing `agent_core::Tool`.
//!
//! | tool                   | does                                        |
//! |------------------------|---------------------------------------------|
//! | `calculate`            | arithmetic, returns `{"result": "<n>"}`     |
//! | `get_current_datetime` | server time as human, ISO or unix           |
//! | `get_current_weather`  | simulated weather for a city                |
//! | `get_system_info`      | OS, architecture, CPU count                 |
//! | `search_web`           | simulated search results (at most 10)       |
//! | `greet`, `echo`        | connection checks                           |

pub mod basic;
pub mod calculator;
pub mod datetime;
pub mod search;
pub mod system;
pub mod weather;

use std::time::Duration;

use agent_core::{Result, ToolRegistry};

pub use basic::{EchoTool, GreetTool};
pub use calculator::CalculatorTool;
pub use datetime::DateTimeTool;
pub use search::WebSearchTool;
pub use system::SystemInfoTool;
pub use weather::WeatherTool;

/// Register every built-in tool
pub fn register_builtin_tools(registry: &ToolRegistry) -> Result<()> {
    registry.register(CalculatorTool)?;
    registry.register(DateTimeTool)?;
    registry.register(WeatherTool)?;
    registry.register(SystemInfoTool)?;
    registry.register(WebSearchTool)?;
    registry.register(GreetTool)?;
    registry.register(EchoTool)?;
    tracing::info!(tools = registry.len(), "Registered built-in tools");
    Ok(())
}

/// A registry holding just the built-in tools
pub fn builtin_registry(tool_timeout: Duration) -> Result<ToolRegistry> {
    let registry = ToolRegistry::new().with_timeout(tool_timeout);
    register_builtin_tools(&registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;
    use agent_core::{AgentError, InvocationStatus, ToolCall};
    use serde_json::json;

    #[test]
    fn test_builtin_catalog() {
        let registry = builtin_registry(Duration::from_secs(5)).unwrap();
        assert_eq!(
            registry.names(),
            vec![
                "calculate",
                "echo",
                "get_current_datetime",
                "get_current_weather",
                "get_system_info",
                "greet",
                "search_web",
            ]
        );
    }

    #[test]
    fn test_registering_twice_fails() {
        let registry = builtin_registry(Duration::from_secs(5)).unwrap();
        assert!(matches!(
            register_builtin_tools(&registry),
            Err(AgentError::DuplicateTool(_))
        ));
    }

    #[tokio::test]
    async fn test_runaway_expressions_become_error_invocations() {
        let registry = builtin_registry(Duration::from_secs(5)).unwrap();

        for expression in [format!("{}1", "-".repeat(200_000)), format!("{}1", "(".repeat(1000))] {
            let invocation = registry
                .execute(&ToolCall::new("calculate", json!({ "expression": expression })))
                .await;
            assert_eq!(invocation.status, InvocationStatus::Error);
            assert_eq!(invocation.error_code.as_deref(), Some("TOOL_EXECUTION_ERROR"));
        }
    }
}
