use std::time::{Duration, Instant};

use fira_models::{ClientConfig, ServerCommand};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::ToolError;
use crate::jsonrpc::{self, Incoming};
use crate::transport::StdioTransport;

/// Where a session is in the fixed exchange. Calls made out of order are
/// rejected with a protocol error instead of reaching the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    NotStarted,
    Initialized,
    ToolCalled,
    Closed,
}

/// One subprocess, one handshake, one tool call.
pub struct Session {
    transport: StdioTransport,
    state: HandshakeState,
    next_id: u64,
    config: ClientConfig,
    timeout: Duration,
    deadline: Instant,
    server_info: Option<Value>,
}

impl Session {
    /// Launch the server. `timeout` bounds the whole exchange, not each step.
    pub fn open(
        command: &ServerCommand,
        config: &ClientConfig,
        timeout: Duration,
    ) -> Result<Self, ToolError> {
        let grace = Duration::from_millis(config.shutdown_grace_ms);
        let transport = StdioTransport::open(command, grace)?;
        Ok(Self {
            transport,
            state: HandshakeState::NotStarted,
            next_id: 0,
            config: config.clone(),
            timeout,
            deadline: Instant::now() + timeout,
            server_info: None,
        })
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// `serverInfo` from the initialize response, once initialized.
    pub fn server_info(&self) -> Option<&Value> {
        self.server_info.as_ref()
    }

    /// Send `initialize`, validate the answer, then send the `initialized` notification.
    pub async fn initialize(&mut self) -> Result<(), ToolError> {
        self.expect_state(HandshakeState::NotStarted, jsonrpc::INITIALIZE)?;

        let id = self.next_id();
        let params = json!({
            "protocolVersion": self.config.protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": self.config.client_name,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });
        self.transport
            .send(&jsonrpc::request(id, jsonrpc::INITIALIZE, params))
            .await?;

        let result = self
            .await_response(id)
            .await?
            .map_err(|error| ToolError::Handshake(format!("initialize returned error: {error}")))?;

        let version = result
            .get("protocolVersion")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ToolError::Handshake("initialize result has no protocolVersion".to_string())
            })?;
        if !self.config.supported_versions.iter().any(|v| v == version) {
            return Err(ToolError::Handshake(format!(
                "incompatible protocol version {version}"
            )));
        }
        self.server_info = result.get("serverInfo").cloned();

        // No response is expected, so nothing to wait for.
        self.transport
            .send(&jsonrpc::notification(jsonrpc::INITIALIZED))
            .await?;

        self.state = HandshakeState::Initialized;
        debug!(version, server = ?self.server_info, "Handshake complete");
        Ok(())
    }

    /// Invoke `tool` and return its parsed payload. Allowed once per session.
    pub async fn call_tool(&mut self, tool: &str, arguments: Value) -> Result<Value, ToolError> {
        self.expect_state(HandshakeState::Initialized, jsonrpc::TOOLS_CALL)?;
        self.state = HandshakeState::ToolCalled;

        let id = self.next_id();
        let params = json!({"name": tool, "arguments": arguments});
        self.transport
            .send(&jsonrpc::request(id, jsonrpc::TOOLS_CALL, params))
            .await?;

        let result = self
            .await_response(id)
            .await?
            .map_err(|error| ToolError::Payload(format!("{tool} returned error: {error}")))?;
        jsonrpc::extract_tool_payload(&result)
    }

    /// Shut the subprocess down. Further calls fail.
    pub async fn close(&mut self) {
        self.state = HandshakeState::Closed;
        self.transport.close().await;
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn expect_state(&self, expected: HandshakeState, step: &str) -> Result<(), ToolError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(ToolError::Protocol(format!(
                "{step} not allowed in state {:?}",
                self.state
            )))
        }
    }

    /// Read until the response for `id` arrives. Notifications are skipped;
    /// any other response or a server-initiated request is a protocol error.
    async fn await_response(&mut self, id: u64) -> Result<Result<Value, Value>, ToolError> {
        loop {
            let remaining = self.deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.transport.terminate();
                return Err(ToolError::Timeout(self.timeout));
            }

            let message = match self.transport.receive(remaining).await {
                Err(ToolError::Timeout(_)) => return Err(ToolError::Timeout(self.timeout)),
                other => other?,
            };

            match jsonrpc::classify(message)? {
                Incoming::Notification { method } => {
                    debug!(method = %method, "Skipping server notification");
                }
                Incoming::Request { id: request_id, method } => {
                    return Err(ToolError::Protocol(format!(
                        "unexpected server request {method} (id={request_id}) while waiting for id={id}"
                    )));
                }
                Incoming::Response { id: got, outcome } => {
                    if got.as_u64() != Some(id) {
                        return Err(ToolError::Protocol(format!(
                            "response id={got} does not match pending request id={id}"
                        )));
                    }
                    return Ok(outcome);
                }
            }
        }
    }
}

/// Run the full exchange against a fresh subprocess and always close it.
pub async fn call_tool(
    command: &ServerCommand,
    tool: &str,
    arguments: Value,
    timeout: Duration,
    config: &ClientConfig,
) -> Result<Value, ToolError> {
    let start = Instant::now();
    let mut session = Session::open(command, config, timeout)?;

    let outcome = exchange(&mut session, tool, arguments).await;
    session.close().await;

    let elapsed_ms = start.elapsed().as_millis() as u64;
    match &outcome {
        Ok(_) => info!(tool, elapsed_ms, "Tool call succeeded"),
        Err(e) => warn!(tool, elapsed_ms, error = %e, "Tool call failed"),
    }
    outcome
}

async fn exchange(session: &mut Session, tool: &str, arguments: Value) -> Result<Value, ToolError> {
    session.initialize().await?;
    session.call_tool(tool, arguments).await
}
