//! Shared application state

use std::sync::Arc;
use std::time::Duration;

use agent_core::{Orchestrator, ProtocolBridge};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub bridge: Arc<ProtocolBridge>,
    /// Upper bound for one primary request, tools included
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(orchestrator: Orchestrator, bridge: ProtocolBridge, request_timeout: Duration) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            bridge: Arc::new(bridge),
            request_timeout,
        }
    }
}
