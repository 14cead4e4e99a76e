use std::time::Duration;

use async_trait::async_trait;
use fira_models::{ClientConfig, ServerCommand};
use serde_json::Value;

use crate::error::ToolError;
use crate::handshake::call_tool;

/// A single tool invocation against one tool server.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    /// Basket on whose behalf the call is made, for logging and routing.
    pub basket: String,
    pub command: ServerCommand,
    pub tool: String,
    pub arguments: Value,
    pub timeout: Duration,
}

/// Slack allowed past a call's own timeout before a caller gives up on it.
pub const DEFAULT_CALL_SLACK: Duration = Duration::from_secs(5);

/// Trait for invoking tools. Mockable for testing.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(&self, call: ToolCall) -> Result<Value, ToolError>;

    /// Longest an `invoke` with this timeout may run, cleanup included.
    /// Callers that guard a call must not cut it off before this.
    fn max_call_duration(&self, timeout: Duration) -> Duration {
        timeout + DEFAULT_CALL_SLACK
    }
}

/// Invokes tools by spawning the server and running the stdio handshake.
#[derive(Debug, Clone, Default)]
pub struct McpToolInvoker {
    config: ClientConfig,
}

impl McpToolInvoker {
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ToolInvoker for McpToolInvoker {
    async fn invoke(&self, call: ToolCall) -> Result<Value, ToolError> {
        call_tool(
            &call.command,
            &call.tool,
            call.arguments,
            call.timeout,
            &self.config,
        )
        .await
    }

    /// The session deadline, then the shutdown grace, then the stderr drain.
    fn max_call_duration(&self, timeout: Duration) -> Duration {
        timeout + Duration::from_millis(self.config.shutdown_grace_ms) + MCP_CLOSE_SLACK
    }
}

const MCP_CLOSE_SLACK: Duration = Duration::from_secs(2);
