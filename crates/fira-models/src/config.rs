use std::collections::BTreeMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Top-level configuration for FIRA.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FiraConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub client: ClientConfig,
    /// Baskets in execution order. The order is part of the product contract:
    /// partial events are emitted in exactly this sequence.
    #[serde(default = "default_baskets")]
    pub baskets: Vec<BasketConfig>,
}

impl Default for FiraConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            client: ClientConfig::default(),
            baskets: default_baskets(),
        }
    }
}

/// Configuration for the task engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Per-basket call timeout in seconds. Baskets may override it.
    #[serde(default = "default_basket_timeout")]
    pub basket_timeout_seconds: u64,
    /// Delay inserted between basket completions, used to pace UI updates.
    #[serde(default)]
    pub pacing_delay_ms: u64,
    /// Relative tolerance above which two numeric source values disagree (0.01 = 1%).
    #[serde(default = "default_conflict_tolerance")]
    pub conflict_tolerance: Decimal,
    /// How many times a failed basket call is retried before it is recorded as failed.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Upper bound on tool-server subprocesses running at once across all tasks.
    #[serde(default)]
    pub max_concurrent_calls: Option<usize>,
    /// Idle time in seconds after which a task is dropped from the store.
    #[serde(default = "default_task_ttl")]
    pub task_ttl_seconds: u64,
    /// Maximum number of tasks kept in the store.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            basket_timeout_seconds: default_basket_timeout(),
            pacing_delay_ms: 0,
            conflict_tolerance: default_conflict_tolerance(),
            retry_attempts: default_retry_attempts(),
            max_concurrent_calls: None,
            task_ttl_seconds: default_task_ttl(),
            max_tasks: default_max_tasks(),
        }
    }
}

/// Settings for the JSON-RPC handshake with tool servers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    /// Protocol version offered in the `initialize` request.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: String,
    /// Versions a server may answer with. Anything else fails the handshake.
    #[serde(default = "default_supported_versions")]
    pub supported_versions: Vec<String>,
    #[serde(default = "default_client_name")]
    pub client_name: String,
    /// How long a server gets to exit after its stdin is closed before it is killed.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            protocol_version: default_protocol_version(),
            supported_versions: default_supported_versions(),
            client_name: default_client_name(),
            shutdown_grace_ms: default_shutdown_grace(),
        }
    }
}

/// A command line that launches one tool server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl ServerCommand {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }
}

impl std::fmt::Display for ServerCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// One data category: which server to launch, what to ask it, and how to read the answer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BasketConfig {
    pub name: String,
    pub command: ServerCommand,
    /// Tool invoked with `tools/call`.
    pub tool: String,
    /// Tool arguments. String values may contain `{ticker}` and `{company_name}`.
    #[serde(default)]
    pub arguments: serde_json::Map<String, serde_json::Value>,
    /// Upstream sources in priority order. The first entry must be the primary.
    pub sources: Vec<SourceConfig>,
    /// Metrics counted by the completeness score.
    #[serde(default)]
    pub required_metrics: Vec<String>,
    /// Override for `EngineConfig::basket_timeout_seconds`.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Keep only the N most recent entries of list-valued metrics.
    #[serde(default)]
    pub item_limit: Option<usize>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SourceConfig {
    pub name: String,
    #[serde(default)]
    pub primary: bool,
}

impl SourceConfig {
    pub fn primary(name: &str) -> Self {
        Self {
            name: name.to_string(),
            primary: true,
        }
    }

    pub fn secondary(name: &str) -> Self {
        Self {
            name: name.to_string(),
            primary: false,
        }
    }
}

fn basket(
    name: &str,
    tool: &str,
    arguments: serde_json::Value,
    sources: Vec<SourceConfig>,
    required: &[&str],
    item_limit: Option<usize>,
) -> BasketConfig {
    let script = format!("mcp-servers/{name}-basket/server.py");
    BasketConfig {
        name: name.to_string(),
        command: ServerCommand::new("python3", &[script.as_str()]),
        tool: tool.to_string(),
        arguments: match arguments {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        },
        sources,
        required_metrics: required.iter().map(|m| m.to_string()).collect(),
        timeout_seconds: None,
        item_limit,
        enabled: true,
    }
}

/// The six standard baskets, in execution order.
pub fn default_baskets() -> Vec<BasketConfig> {
    use serde_json::json;

    vec![
        basket(
            "fundamentals",
            "get_all_sources_fundamentals",
            json!({"ticker": "{ticker}"}),
            vec![
                SourceConfig::primary("sec_edgar"),
                SourceConfig::secondary("yahoo_finance"),
            ],
            &["revenue", "net_income", "eps", "debt_to_equity"],
            None,
        ),
        basket(
            "valuation",
            "get_all_sources_valuation",
            json!({"ticker": "{ticker}"}),
            vec![
                SourceConfig::primary("yahoo_finance"),
                SourceConfig::secondary("alpha_vantage"),
            ],
            &["trailing_pe", "pb_ratio", "ps_ratio"],
            None,
        ),
        basket(
            "volatility",
            "get_all_sources_volatility",
            json!({"ticker": "{ticker}"}),
            vec![
                SourceConfig::primary("yahoo_finance"),
                SourceConfig::secondary("alpha_vantage"),
                SourceConfig::secondary("fred"),
            ],
            &["beta", "vix"],
            None,
        ),
        basket(
            "macro",
            "get_all_sources_macro",
            json!({}),
            vec![
                SourceConfig::primary("bea_bls"),
                SourceConfig::secondary("fred"),
            ],
            &["gdp_growth", "interest_rate", "cpi_inflation"],
            None,
        ),
        basket(
            "news",
            "get_all_sources_news",
            json!({"ticker": "{ticker}", "company_name": "{company_name}"}),
            vec![SourceConfig::primary("tavily"), SourceConfig::secondary("nyt")],
            &["items"],
            Some(10),
        ),
        basket(
            "sentiment",
            "get_sentiment_basket",
            json!({"ticker": "{ticker}", "company_name": "{company_name}"}),
            vec![
                SourceConfig::primary("finnhub"),
                SourceConfig::secondary("reddit"),
            ],
            &["items"],
            Some(10),
        ),
    ]
}

fn default_basket_timeout() -> u64 {
    90
}
fn default_conflict_tolerance() -> Decimal {
    Decimal::new(1, 2)
}
fn default_retry_attempts() -> u32 {
    1
}
fn default_task_ttl() -> u64 {
    3600
}
fn default_max_tasks() -> u64 {
    10_000
}
fn default_protocol_version() -> String {
    "2024-11-05".to_string()
}
fn default_supported_versions() -> Vec<String> {
    vec![
        "2024-11-05".to_string(),
        "2025-03-26".to_string(),
        "2025-06-18".to_string(),
    ]
}
fn default_client_name() -> String {
    "fira".to_string()
}
fn default_shutdown_grace() -> u64 {
    2000
}
fn default_true() -> bool {
    true
}
