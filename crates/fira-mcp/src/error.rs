use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("Failed to launch tool server: {0}")]
    Launch(String),

    #[error("Tool server timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Handshake rejected: {0}")]
    Handshake(String),

    #[error("Unusable tool payload: {0}")]
    Payload(String),
}

impl ToolError {
    /// Short label recorded in task failure lists.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Launch(_) => "launch",
            Self::Timeout(_) => "timeout",
            Self::Protocol(_) => "protocol",
            Self::Handshake(_) => "handshake",
            Self::Payload(_) => "payload",
        }
    }
}
