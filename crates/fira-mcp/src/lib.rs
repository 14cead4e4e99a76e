//! Tool-server client: spawns one subprocess per call, runs the
//! `initialize` / `notifications/initialized` / `tools/call` exchange over
//! line-delimited JSON-RPC on its stdio, and returns the parsed tool payload.

pub mod error;
pub mod handshake;
pub mod invoker;
pub mod jsonrpc;
pub mod transport;

pub use error::ToolError;
pub use handshake::{call_tool, HandshakeState, Session};
pub use invoker::{McpToolInvoker, ToolCall, ToolInvoker, DEFAULT_CALL_SLACK};
pub use transport::StdioTransport;
