//! Server Configuration
//!
//! Read from the environment (after `.env` is loaded). Invalid values fall
//! back to their defaults with a warning rather than aborting startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use agent_core::orchestrator::{
    OrchestratorConfig, DEFAULT_MAX_HISTORY_MESSAGES, DEFAULT_MAX_ITERATIONS, DEFAULT_SYSTEM_PROMPT,
};
use agent_core::provider::GenerationOptions;
use agent_core::tool::DEFAULT_TOOL_TIMEOUT;
use agent_runtime::openai::DEFAULT_MODEL;

/// Where session history lives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    File,
}

impl FromStr for StoreKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "file" | "jsonl" => Ok(Self::File),
            other => Err(format!("unknown session store '{other}'")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub request_timeout: Duration,
    pub tool_timeout: Duration,
    pub session_store: StoreKind,
    pub session_dir: PathBuf,
    pub orchestrator: OrchestratorConfig,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let generation = GenerationOptions {
            model: lookup("LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.into()),
            temperature: parse_or("DEFAULT_TEMPERATURE", lookup("DEFAULT_TEMPERATURE"), 0.7),
            max_tokens: parse_or("DEFAULT_MAX_TOKENS", lookup("DEFAULT_MAX_TOKENS"), 2000),
            ..GenerationOptions::default()
        };

        let max_iterations = parse_or("MAX_TOOL_ITERATIONS", lookup("MAX_TOOL_ITERATIONS"), DEFAULT_MAX_ITERATIONS);
        let orchestrator = OrchestratorConfig {
            default_system_prompt: Some(
                lookup("DEFAULT_SYSTEM_PROMPT")
                    .filter(|p| !p.trim().is_empty())
                    .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.into()),
            ),
            max_iterations: max_iterations.max(1),
            max_history_messages: parse_or(
                "MAX_HISTORY_MESSAGES",
                lookup("MAX_HISTORY_MESSAGES"),
                DEFAULT_MAX_HISTORY_MESSAGES,
            ),
            generation,
        };

        Self {
            bind_addr: lookup("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:3000".into()),
            request_timeout: Duration::from_secs(parse_or(
                "REQUEST_TIMEOUT_SECS",
                lookup("REQUEST_TIMEOUT_SECS"),
                120,
            )),
            tool_timeout: Duration::from_secs(parse_or(
                "TOOL_TIMEOUT_SECS",
                lookup("TOOL_TIMEOUT_SECS"),
                DEFAULT_TOOL_TIMEOUT.as_secs(),
            )),
            session_store: parse_or("SESSION_STORE", lookup("SESSION_STORE"), StoreKind::Memory),
            session_dir: lookup("SESSION_DIR").map_or_else(|| PathBuf::from("data/sessions"), PathBuf::from),
            orchestrator,
        }
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    match raw {
        None => default,
        Some(value) => value.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %value, "Invalid configuration value, using default");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> ServerConfig {
        let env: HashMap<String, String> = pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        ServerConfig::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config(&[]);
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert_eq!(config.orchestrator.max_iterations, 5);
        assert_eq!(config.orchestrator.max_history_messages, 10);
        assert_eq!(config.orchestrator.generation.model, "qwen-max");
        assert_eq!(config.orchestrator.generation.max_tokens, 2000);
        assert_eq!(config.request_timeout, Duration::from_secs(120));
        assert_eq!(config.session_store, StoreKind::Memory);
    }

    #[test]
    fn test_overrides_and_fallbacks() {
        let config = config(&[
            ("MAX_TOOL_ITERATIONS", "8"),
            ("TOOL_TIMEOUT_SECS", "soon"),
            ("SESSION_STORE", "file"),
            ("SESSION_DIR", "/var/lib/agent"),
            ("DEFAULT_TEMPERATURE", "0.2"),
        ]);
        assert_eq!(config.orchestrator.max_iterations, 8);
        assert_eq!(config.tool_timeout, DEFAULT_TOOL_TIMEOUT);
        assert_eq!(config.session_store, StoreKind::File);
        assert_eq!(config.session_dir, PathBuf::from("/var/lib/agent"));
        assert!((config.orchestrator.generation.temperature - 0.2).abs() < f32::EPSILON);
    }

    #[test]
    fn test_zero_iterations_is_raised_to_one() {
        assert_eq!(config(&[("MAX_TOOL_ITERATIONS", "0")]).orchestrator.max_iterations, 1);
    }
}
