//! FIRA - Financial Information Research Agent
//!
//! Collects financial data for one company from a fixed sequence of basket
//! tool servers, each spoken to over a JSON-RPC stdio handshake, and folds
//! the answers into a single report with conflict and completeness audits.
//!
//! # Library Usage
//!
//! ```rust,no_run
//! use fira::models::FiraConfig;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = fira::build_engine(&FiraConfig::default())?;
//! let id = engine.submit("AAPL", "Apple Inc.").await;
//! let task = engine.wait(&id, std::time::Duration::from_millis(250)).await?;
//! println!("{}", task.status);
//! # Ok(())
//! # }
//! ```

pub use fira_engine as engine;
pub use fira_mcp as mcp;
pub use fira_models as models;

pub mod rpc;

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use fira_engine::TaskEngine;
use fira_mcp::McpToolInvoker;
use fira_models::FiraConfig;

/// Read a TOML config file. Missing sections take their defaults.
pub fn load_config(path: &Path) -> Result<FiraConfig, anyhow::Error> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    toml::from_str(&text).with_context(|| format!("Failed to parse config: {}", path.display()))
}

/// Build a task engine that talks to real tool servers.
pub fn build_engine(config: &FiraConfig) -> Result<TaskEngine, anyhow::Error> {
    let invoker = Arc::new(McpToolInvoker::new(config.client.clone()));
    let engine = TaskEngine::new(config.engine.clone(), &config.baskets, invoker)
        .context("Invalid engine configuration")?;
    Ok(engine)
}
