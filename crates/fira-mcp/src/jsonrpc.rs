use serde_json::{json, Value};

use crate::error::ToolError;

pub const INITIALIZE: &str = "initialize";
pub const INITIALIZED: &str = "notifications/initialized";
pub const TOOLS_CALL: &str = "tools/call";

pub fn request(id: u64, method: &str, params: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "method": method,
        "params": params,
    })
}

pub fn notification(method: &str) -> Value {
    json!({
        "jsonrpc": "2.0",
        "method": method,
    })
}

/// A message read from a tool server, sorted by JSON-RPC shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Incoming {
    /// `result` on success, the `error` object otherwise.
    Response { id: Value, outcome: Result<Value, Value> },
    Notification { method: String },
    Request { id: Value, method: String },
}

pub fn classify(message: Value) -> Result<Incoming, ToolError> {
    let Value::Object(mut map) = message else {
        return Err(ToolError::Protocol(format!(
            "expected a JSON-RPC object, got {message}"
        )));
    };

    let method = map
        .get("method")
        .and_then(Value::as_str)
        .map(str::to_string);
    let id = map.remove("id");

    match (id, method) {
        (Some(id), Some(method)) => Ok(Incoming::Request { id, method }),
        (None, Some(method)) => Ok(Incoming::Notification { method }),
        (Some(id), None) => {
            if let Some(error) = map.remove("error") {
                Ok(Incoming::Response {
                    id,
                    outcome: Err(error),
                })
            } else if let Some(result) = map.remove("result") {
                Ok(Incoming::Response {
                    id,
                    outcome: Ok(result),
                })
            } else {
                Err(ToolError::Protocol(format!(
                    "response id={id} has neither result nor error"
                )))
            }
        }
        (None, None) => Err(ToolError::Protocol(
            "message has neither id nor method".to_string(),
        )),
    }
}

/// Pull the tool's structured payload out of a `tools/call` result.
///
/// `structuredContent` wins when present; otherwise the first text block is
/// parsed as JSON.
pub fn extract_tool_payload(result: &Value) -> Result<Value, ToolError> {
    let first_text = result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|blocks| {
            blocks.iter().find_map(|block| {
                if block.get("type").and_then(Value::as_str) == Some("text") {
                    block.get("text").and_then(Value::as_str)
                } else {
                    None
                }
            })
        });

    if result.get("isError").and_then(Value::as_bool) == Some(true) {
        return Err(ToolError::Payload(format!(
            "tool reported an error: {}",
            first_text.unwrap_or("no details")
        )));
    }

    if let Some(structured) = result.get("structuredContent") {
        if !structured.is_null() {
            return Ok(structured.clone());
        }
    }

    let text = first_text
        .ok_or_else(|| ToolError::Payload("tool result has no text content".to_string()))?;
    serde_json::from_str(text).map_err(|e| {
        ToolError::Payload(format!(
            "tool text is not JSON: {e} (length={})",
            text.len()
        ))
    })
}
