use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use fira_models::ServerCommand;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ToolError;

/// Bytes of stderr kept per server; the rest is drained and dropped.
const STDERR_CAPTURE_LIMIT: usize = 64 * 1024;
/// Bytes of captured stderr written to the log on close.
const STDERR_LOG_LIMIT: usize = 500;

/// A tool server subprocess speaking newline-delimited JSON on its stdio.
///
/// Every transport must be closed with [`StdioTransport::close`]. If it is
/// dropped instead (for example because the owning future was cancelled) the
/// child is killed by the runtime.
pub struct StdioTransport {
    label: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr: Option<JoinHandle<String>>,
    grace: Duration,
    exit: Option<ExitStatus>,
    closed: bool,
}

impl StdioTransport {
    /// Spawn the server with piped stdin/stdout/stderr. Must run inside a tokio runtime.
    pub fn open(command: &ServerCommand, grace: Duration) -> Result<Self, ToolError> {
        let label = command.to_string();
        debug!(command = %label, "Launching tool server");

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(&command.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ToolError::Launch(format!("{label}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ToolError::Launch(format!("{label}: stdin not captured")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ToolError::Launch(format!("{label}: stdout not captured")))?;
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(drain_stderr(pipe)));

        Ok(Self {
            label,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            stderr,
            grace,
            exit: None,
            closed: false,
        })
    }

    /// Write one JSON value followed by a newline.
    pub async fn send(&mut self, message: &Value) -> Result<(), ToolError> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| ToolError::Protocol("send on a closed transport".to_string()))?;

        let mut line = serde_json::to_string(message)
            .map_err(|e| ToolError::Protocol(format!("unserializable message: {e}")))?;
        line.push('\n');
        debug!(command = %self.label, message = %line.trim_end(), "-> tool server");

        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ToolError::Protocol(format!("write to {} failed: {e}", self.label)))?;
        stdin
            .flush()
            .await
            .map_err(|e| ToolError::Protocol(format!("flush to {} failed: {e}", self.label)))
    }

    /// Wait for the next non-blank line and parse it as JSON.
    ///
    /// On timeout the child is killed before the error is returned.
    pub async fn receive(&mut self, timeout: Duration) -> Result<Value, ToolError> {
        if self.closed {
            return Err(ToolError::Protocol("receive on a closed transport".to_string()));
        }
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let line = match tokio::time::timeout_at(deadline, self.stdout.next_line()).await {
                Err(_) => {
                    warn!(command = %self.label, timeout_ms = timeout.as_millis(), "Tool server timed out, killing");
                    self.terminate();
                    return Err(ToolError::Timeout(timeout));
                }
                Ok(Err(e)) => {
                    return Err(ToolError::Protocol(format!(
                        "read from {} failed: {e}",
                        self.label
                    )))
                }
                Ok(Ok(None)) => {
                    return Err(ToolError::Protocol(format!(
                        "{} closed stdout",
                        self.label
                    )))
                }
                Ok(Ok(Some(line))) => line,
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            debug!(command = %self.label, message = %trimmed, "<- tool server");
            return serde_json::from_str(trimmed).map_err(|e| {
                ToolError::Protocol(format!("malformed line from {}: {e}", self.label))
            });
        }
    }

    /// Send the kill signal without waiting for the process to exit.
    pub fn terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(command = %self.label, error = %e, "Kill failed (process already gone?)");
        }
    }

    /// Close stdin, give the server `grace` to exit, then kill it. Idempotent.
    pub async fn close(&mut self) -> Option<ExitStatus> {
        if self.closed {
            return self.exit;
        }
        self.closed = true;

        // EOF on stdin is the server's cue to shut down.
        self.stdin.take();

        self.exit = match tokio::time::timeout(self.grace, self.child.wait()).await {
            Ok(Ok(status)) => Some(status),
            Ok(Err(e)) => {
                warn!(command = %self.label, error = %e, "Waiting for tool server failed");
                None
            }
            Err(_) => {
                warn!(command = %self.label, grace_ms = self.grace.as_millis(), "Tool server ignored shutdown, killing");
                if let Err(e) = self.child.kill().await {
                    warn!(command = %self.label, error = %e, "Kill failed");
                }
                self.child.wait().await.ok()
            }
        };

        if let Some(handle) = self.stderr.take() {
            if let Ok(Ok(text)) = tokio::time::timeout(Duration::from_secs(1), handle).await {
                let text = text.trim();
                if !text.is_empty() {
                    debug!(command = %self.label, stderr = %truncate(text, STDERR_LOG_LIMIT), "Tool server stderr");
                }
            }
        }

        debug!(command = %self.label, status = ?self.exit, "Tool server closed");
        self.exit
    }
}

async fn drain_stderr(mut pipe: ChildStderr) -> String {
    let mut captured = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let room = STDERR_CAPTURE_LIMIT.saturating_sub(captured.len());
                captured.extend_from_slice(&chunk[..n.min(room)]);
            }
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
