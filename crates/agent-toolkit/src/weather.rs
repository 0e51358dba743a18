//! Weather Tool
//!
//! Simulated: readings are derived from the city name, so the same city
//! always reports the same weather. Swap in a real API client to go live.

use async_trait::async_trait;
use serde_json::{json, Value};

use agent_core::{tool::ParameterSchema, AgentError, Result as CoreResult, Tool, ToolSchema};

const CONDITIONS: [&str; 5] = ["sunny", "partly cloudy", "cloudy", "light rain", "windy"];

/// Tool returning (simulated) current weather for a city
pub struct WeatherTool;

fn seed(city: &str) -> u32 {
    city.to_lowercase()
        .bytes()
        .fold(17_u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)))
}

#[async_trait]
impl Tool for WeatherTool {
    fn schema(&self) -> ToolSchema {
        ToolSchema::new("get_current_weather", "Get the current weather for a city.")
            .param(ParameterSchema::required("city", "string", "City name, e.g. 'Beijing'"))
            .param(
                ParameterSchema::optional("unit", "string", "Temperature unit")
                    .with_default(json!("celsius"))
                    .with_enum(vec![json!("celsius"), json!("fahrenheit")]),
            )
            .category("weather")
    }

    async fn execute(&self, arguments: &Value) -> CoreResult<Value> {
        let city = arguments["city"].as_str().unwrap_or_default().trim();
        if city.is_empty() {
            return Err(AgentError::ToolExecution("city must not be empty".into()));
        }
        let unit = arguments["unit"].as_str().unwrap_or("celsius");

        let seed = seed(city);
        let celsius = 10 + i64::from(seed % 25);
        let temperature = if unit == "fahrenheit" { celsius * 9 / 5 + 32 } else { celsius };
        let condition = CONDITIONS[(seed as usize / 25) % CONDITIONS.len()];

        Ok(json!({
            "city": city,
            "temperature": temperature,
            "unit": unit,
            "condition": condition,
            "humidity": 40 + seed % 50,
            "simulated": true,
        }))
    }
}
