use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use fira_mcp::{ToolCall, ToolError, ToolInvoker};
use fira_models::{
    BasketConfig, MetricValue, ServerCommand, SourceRecord, SourceRole, SwotSummary,
};
use serde_json::{Map, Value};

use crate::error::EngineError;

/// Section keys that describe the section rather than name a metric.
const RESERVED_SECTION_KEYS: [&str; 4] = ["source", "as_of", "error", "swot_summary"];
/// Metric keys that carry the observation date, in order of preference.
const AS_OF_KEYS: [&str; 3] = ["as_of", "end_date", "date"];

/// A configured basket: one tool server, one tool, a ranked list of sources.
#[derive(Debug, Clone)]
pub struct Basket {
    config: BasketConfig,
}

/// Per-source data returned by one basket call, in configured source order.
#[derive(Debug, Clone, PartialEq)]
pub struct BasketResult {
    pub basket: String,
    /// Only sources whose section was present and carried something other than an error.
    pub sources: Vec<SourceRecord>,
    /// True when the primary source's section was missing or empty.
    pub fallback_used: bool,
    /// Top-level `swot_summary` of the payload, when it had one.
    pub swot: Option<SwotSummary>,
}

/// Everything known about one basket invocation once it has finished.
#[derive(Debug)]
pub struct BasketCall {
    pub basket: String,
    pub command: ServerCommand,
    pub tool: String,
    pub timeout: Duration,
    pub attempts: u32,
    pub elapsed: Duration,
    pub outcome: Result<BasketResult, ToolError>,
}

impl Basket {
    pub fn new(config: BasketConfig) -> Self {
        Self { config }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &BasketConfig {
        &self.config
    }

    /// Metric names this basket is expected to produce.
    pub fn manifest(&self) -> &[String] {
        &self.config.required_metrics
    }

    pub fn timeout(&self, default: Duration) -> Duration {
        self.config
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default)
    }

    pub fn tool_call(&self, ticker: &str, company_name: &str, timeout: Duration) -> ToolCall {
        ToolCall {
            basket: self.config.name.clone(),
            command: self.config.command.clone(),
            tool: self.config.tool.clone(),
            arguments: render_arguments(&self.config.arguments, ticker, company_name),
            timeout,
        }
    }

    /// Invoke the basket's tool once and classify what came back.
    pub async fn fetch(
        &self,
        invoker: &dyn ToolInvoker,
        ticker: &str,
        company_name: &str,
        timeout: Duration,
    ) -> Result<BasketResult, ToolError> {
        let payload = invoker
            .invoke(self.tool_call(ticker, company_name, timeout))
            .await?;
        self.classify(&payload)
    }

    /// Split a tool payload into one [`SourceRecord`] per configured source.
    ///
    /// Sections live under `sources` when present, otherwise at the top level.
    /// Sources the configuration does not name are ignored.
    pub fn classify(&self, payload: &Value) -> Result<BasketResult, ToolError> {
        let Value::Object(root) = payload else {
            return Err(ToolError::Payload(format!(
                "{} payload is not a JSON object",
                self.config.name
            )));
        };

        if let Some(error) = root.get("error").filter(|e| !e.is_null()) {
            return Err(ToolError::Payload(format!(
                "{} reported an error: {}",
                self.config.name,
                describe(error)
            )));
        }

        let sections = match root.get("sources") {
            Some(Value::Object(sources)) => sources,
            Some(other) => {
                return Err(ToolError::Payload(format!(
                    "{} payload has non-object sources: {other}",
                    self.config.name
                )))
            }
            None => root,
        };

        let mut sources = Vec::new();
        let mut primary_missing = true;

        for source in &self.config.sources {
            let section = match sections.get(&source.name) {
                None | Some(Value::Null) => continue,
                Some(Value::Object(section)) => section,
                Some(other) => {
                    return Err(ToolError::Payload(format!(
                        "{} section {} is not an object: {other}",
                        self.config.name, source.name
                    )))
                }
            };

            let Some(metrics) = self.parse_section(&source.name, section)? else {
                tracing::debug!(
                    basket = %self.config.name,
                    source = %source.name,
                    "Source section reported an error"
                );
                continue;
            };

            let record = SourceRecord {
                source: source.name.clone(),
                role: if source.primary {
                    SourceRole::Primary
                } else {
                    SourceRole::Secondary
                },
                fallback_used: false,
                metrics,
            };
            if source.primary && record.has_data() {
                primary_missing = false;
            }
            sources.push(record);
        }

        Ok(BasketResult {
            basket: self.config.name.clone(),
            sources,
            fallback_used: primary_missing,
            swot: root.get("swot_summary").and_then(|raw| self.parse_swot(raw)),
        })
    }

    /// Lists under the four SWOT keys. Anything else in the summary is ignored.
    fn parse_swot(&self, raw: &Value) -> Option<SwotSummary> {
        let Value::Object(summary) = raw else {
            if !raw.is_null() {
                tracing::debug!(basket = %self.config.name, "Ignoring non-object swot_summary");
            }
            return None;
        };
        let list = |key: &str| match summary.get(key) {
            Some(Value::Array(items)) => items.clone(),
            _ => Vec::new(),
        };
        let swot = SwotSummary {
            strengths: list("strengths"),
            weaknesses: list("weaknesses"),
            opportunities: list("opportunities"),
            threats: list("threats"),
        };
        (!swot.is_empty()).then_some(swot)
    }

    /// Returns `None` when the section holds nothing but an error.
    fn parse_section(
        &self,
        source: &str,
        section: &Map<String, Value>,
    ) -> Result<Option<BTreeMap<String, Option<MetricValue>>>, ToolError> {
        let entries: Vec<(&String, &Value)> = match section.get("data") {
            Some(Value::Object(data)) => data.iter().collect(),
            Some(Value::Null) => Vec::new(),
            Some(other) => {
                return Err(ToolError::Payload(format!(
                    "{} section {source} has non-object data: {other}",
                    self.config.name
                )))
            }
            None => section
                .iter()
                .filter(|(key, _)| !RESERVED_SECTION_KEYS.contains(&key.as_str()))
                .collect(),
        };

        let errored = section.get("error").is_some_and(|e| !e.is_null());
        if errored && entries.is_empty() {
            return Ok(None);
        }

        let metrics = entries
            .into_iter()
            .map(|(name, raw)| (name.clone(), self.parse_metric(raw)))
            .collect();
        Ok(Some(metrics))
    }

    fn parse_metric(&self, raw: &Value) -> Option<MetricValue> {
        let mut metric = match raw {
            Value::Null => return None,
            Value::Object(entry) if entry.contains_key("value") => {
                let mut metric = MetricValue::new(entry["value"].clone());
                let as_of_key = AS_OF_KEYS
                    .iter()
                    .find(|key| entry.get(**key).is_some_and(|v| !v.is_null()));
                metric.as_of = as_of_key.map(|key| match &entry[*key] {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
                metric.metadata = entry
                    .iter()
                    .filter(|(key, _)| *key != "value" && Some(&key.as_str()) != as_of_key)
                    .map(|(key, value)| (key.clone(), value.clone()))
                    .collect();
                metric
            }
            other => MetricValue::new(other.clone()),
        };

        match &metric.value {
            Value::Null => return None,
            Value::Array(items) if items.is_empty() => return None,
            _ => {}
        }

        if let Some(limit) = self.config.item_limit {
            if let Some(total) = limit_items(&mut metric.value, limit) {
                metric
                    .metadata
                    .insert("total_items".to_string(), Value::from(total));
            }
        }
        Some(metric)
    }
}

/// Substitute `{ticker}` and `{company_name}` into the argument template.
/// String arguments that end up empty are dropped.
pub fn render_arguments(template: &Map<String, Value>, ticker: &str, company_name: &str) -> Value {
    let mut arguments = Map::new();
    for (key, value) in template {
        match value {
            Value::String(text) => {
                let rendered = text
                    .replace("{ticker}", ticker)
                    .replace("{company_name}", company_name);
                if !rendered.is_empty() {
                    arguments.insert(key.clone(), Value::String(rendered));
                }
            }
            other => {
                arguments.insert(key.clone(), other.clone());
            }
        }
    }
    Value::Object(arguments)
}

/// Keep the `limit` most recent items of an array, ordered by their
/// `datetime` field. Returns the original item count, or `None` if the
/// value is not an array.
pub fn limit_items(value: &mut Value, limit: usize) -> Option<usize> {
    let Value::Array(items) = value else {
        return None;
    };
    let total = items.len();
    items.sort_by(|a, b| compare_recency(b, a));
    items.truncate(limit);
    Some(total)
}

/// Numeric timestamps sort after string dates, and both after items without one.
fn compare_recency(a: &Value, b: &Value) -> Ordering {
    fn key(item: &Value) -> (u8, f64, &str) {
        match item.get("datetime") {
            Some(Value::Number(n)) => (2, n.as_f64().unwrap_or_default(), ""),
            Some(Value::String(s)) if !s.is_empty() => (1, 0.0, s.as_str()),
            _ => (0, 0.0, ""),
        }
    }
    let (rank_a, num_a, text_a) = key(a);
    let (rank_b, num_b, text_b) = key(b);
    rank_a
        .cmp(&rank_b)
        .then(num_a.total_cmp(&num_b))
        .then(text_a.cmp(text_b))
}

fn describe(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Check basket configuration and return the enabled baskets in order.
pub fn validate_baskets(configs: &[BasketConfig]) -> Result<Vec<Basket>, EngineError> {
    let mut seen = BTreeSet::new();
    let mut baskets = Vec::new();

    for config in configs.iter().filter(|c| c.enabled) {
        if config.name.trim().is_empty() {
            return Err(EngineError::Config("basket name is empty".to_string()));
        }
        if !seen.insert(config.name.as_str()) {
            return Err(EngineError::Config(format!(
                "duplicate basket name {}",
                config.name
            )));
        }
        if config.tool.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "basket {} has no tool",
                config.name
            )));
        }
        if config.command.program.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "basket {} has no command",
                config.name
            )));
        }
        let Some(first) = config.sources.first() else {
            return Err(EngineError::Config(format!(
                "basket {} has no sources",
                config.name
            )));
        };
        if !first.primary || config.sources.iter().filter(|s| s.primary).count() != 1 {
            return Err(EngineError::Config(format!(
                "basket {} must list exactly one primary source, first",
                config.name
            )));
        }
        let mut source_names = BTreeSet::new();
        if let Some(dup) = config
            .sources
            .iter()
            .find(|s| !source_names.insert(s.name.as_str()))
        {
            return Err(EngineError::Config(format!(
                "basket {} lists source {} twice",
                config.name, dup.name
            )));
        }
        if config.timeout_seconds == Some(0) {
            return Err(EngineError::Config(format!(
                "basket {} has timeout_seconds 0",
                config.name
            )));
        }
        if config.item_limit == Some(0) {
            return Err(EngineError::Config(format!(
                "basket {} has item_limit 0",
                config.name
            )));
        }
        baskets.push(Basket::new(config.clone()));
    }

    if baskets.is_empty() {
        return Err(EngineError::Config("no enabled baskets".to_string()));
    }
    Ok(baskets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use fira_models::config::default_baskets;
    use serde_json::json;

    fn basket(name: &str) -> Basket {
        Basket::new(
            default_baskets()
                .into_iter()
                .find(|b| b.name == name)
                .unwrap(),
        )
    }

    #[test]
    fn arguments_are_rendered_and_empty_values_dropped() {
        let news = basket("news");
        let call = news.tool_call("AAPL", "Apple Inc.", Duration::from_secs(5));
        assert_eq!(
            call.arguments,
            json!({"ticker": "AAPL", "company_name": "Apple Inc."})
        );

        let call = news.tool_call("AAPL", "", Duration::from_secs(5));
        assert_eq!(call.arguments, json!({"ticker": "AAPL"}));
        assert_eq!(call.tool, "get_all_sources_news");
    }

    #[test]
    fn non_string_arguments_pass_through() {
        let template = json!({"ticker": "{ticker}", "limit": 5, "deep": true});
        let Value::Object(template) = template else {
            unreachable!()
        };
        let rendered = render_arguments(&template, "MSFT", "");
        assert_eq!(rendered, json!({"ticker": "MSFT", "limit": 5, "deep": true}));
    }

    #[test]
    fn classify_sources_with_data_blocks() {
        let payload = json!({
            "ticker": "AAPL",
            "sources": {
                "bea_bls": {"source": "BEA", "data": {
                    "gdp_growth": {"value": 4.3, "as_of": "2025-Q3", "unit": "percent"},
                    "cpi_inflation": null
                }},
                "fred": {"data": {"gdp_growth": 4.1, "interest_rate": {"value": 5.33, "date": "2025-09-30"}}},
                "unknown_source": {"data": {"gdp_growth": 1.0}}
            }
        });

        let result = basket("macro").classify(&payload).unwrap();
        assert_eq!(result.basket, "macro");
        assert!(!result.fallback_used);
        assert_eq!(result.sources.len(), 2);

        let bea = &result.sources[0];
        assert_eq!(bea.source, "bea_bls");
        assert_eq!(bea.role, SourceRole::Primary);
        let gdp = bea.metrics["gdp_growth"].as_ref().unwrap();
        assert_eq!(gdp.value, json!(4.3));
        assert_eq!(gdp.as_of.as_deref(), Some("2025-Q3"));
        assert_eq!(gdp.metadata.get("unit"), Some(&json!("percent")));
        assert!(gdp.metadata.get("as_of").is_none());
        assert_eq!(bea.metrics["cpi_inflation"], None);

        let fred = &result.sources[1];
        assert_eq!(fred.role, SourceRole::Secondary);
        assert_eq!(fred.metrics["gdp_growth"].as_ref().unwrap().value, json!(4.1));
        let rate = fred.metrics["interest_rate"].as_ref().unwrap();
        assert_eq!(rate.as_of.as_deref(), Some("2025-09-30"));
    }

    #[test]
    fn classify_top_level_sections_without_data_key() {
        let payload = json!({
            "yahoo_finance": {"source": "Yahoo", "as_of": "2025-10-01", "beta": 1.2, "vix": null},
            "fred": {"vix": {"value": 18.4}}
        });
        let result = basket("volatility").classify(&payload).unwrap();
        let yahoo = &result.sources[0];
        assert_eq!(yahoo.metrics.len(), 2);
        assert_eq!(yahoo.metrics["beta"].as_ref().unwrap().value, json!(1.2));
        assert!(yahoo.metrics["vix"].is_none());
        assert_eq!(result.sources[1].source, "fred");
    }

    #[test]
    fn primary_error_section_counts_as_absent() {
        let payload = json!({"sources": {
            "sec_edgar": {"error": "rate limited"},
            "yahoo_finance": {"data": {"revenue": 391_035_000_000u64}}
        }});
        let result = basket("fundamentals").classify(&payload).unwrap();
        assert!(result.fallback_used);
        assert_eq!(result.sources.len(), 1);
        assert_eq!(result.sources[0].source, "yahoo_finance");
    }

    #[test]
    fn primary_with_only_nulls_triggers_fallback() {
        let payload = json!({"sources": {
            "yahoo_finance": {"data": {"trailing_pe": null}},
            "alpha_vantage": {"data": {"trailing_pe": 31.2}}
        }});
        let result = basket("valuation").classify(&payload).unwrap();
        assert!(result.fallback_used);
        assert_eq!(result.sources.len(), 2);
    }

    #[test]
    fn top_level_error_is_payload_error() {
        let err = basket("macro")
            .classify(&json!({"error": "FRED_API_KEY missing"}))
            .unwrap_err();
        assert!(matches!(err, ToolError::Payload(_)));
        assert!(err.to_string().contains("FRED_API_KEY missing"));
    }

    #[test]
    fn malformed_payloads_are_rejected() {
        let macro_basket = basket("macro");
        assert!(macro_basket.classify(&json!([1, 2])).is_err());
        assert!(macro_basket.classify(&json!({"sources": [1]})).is_err());
        assert!(macro_basket
            .classify(&json!({"sources": {"fred": "oops"}}))
            .is_err());
        assert!(macro_basket
            .classify(&json!({"sources": {"fred": {"data": 3}}}))
            .is_err());
    }

    #[test]
    fn item_lists_are_sorted_and_truncated() {
        let items: Vec<Value> = (0..15)
            .map(|i| json!({"title": format!("story {i}"), "datetime": format!("2025-10-{:02}", i + 1)}))
            .collect();
        let payload = json!({"sources": {"tavily": {"data": {"items": items}}}});

        let result = basket("news").classify(&payload).unwrap();
        let metric = result.sources[0].metrics["items"].as_ref().unwrap();
        let kept = metric.value.as_array().unwrap();
        assert_eq!(kept.len(), 10);
        assert_eq!(kept[0]["datetime"], "2025-10-15");
        assert_eq!(kept[9]["datetime"], "2025-10-06");
        assert_eq!(metric.metadata["total_items"], 15);
    }

    #[test]
    fn empty_item_list_is_no_data() {
        let payload = json!({"sources": {"tavily": {"data": {"items": []}}, "nyt": {"data": {"items": [{"title": "x"}]}}}});
        let result = basket("news").classify(&payload).unwrap();
        assert!(result.fallback_used);
        assert!(result.sources[0].metrics["items"].is_none());
        assert!(result.sources[1].metrics["items"].is_some());
    }

    #[test]
    fn numeric_timestamps_sort_most_recent_first() {
        let mut value = json!([
            {"datetime": 100},
            {"title": "undated"},
            {"datetime": 300},
            {"datetime": 200}
        ]);
        assert_eq!(limit_items(&mut value, 2), Some(4));
        assert_eq!(value, json!([{"datetime": 300}, {"datetime": 200}]));
        assert_eq!(limit_items(&mut json!("text"), 2), None);
    }

    #[test]
    fn basket_timeout_override() {
        let mut config = basket("macro").config().clone();
        assert_eq!(
            Basket::new(config.clone()).timeout(Duration::from_secs(90)),
            Duration::from_secs(90)
        );
        config.timeout_seconds = Some(5);
        assert_eq!(
            Basket::new(config).timeout(Duration::from_secs(90)),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn default_baskets_validate() {
        let baskets = validate_baskets(&default_baskets()).unwrap();
        let names: Vec<&str> = baskets.iter().map(Basket::name).collect();
        assert_eq!(
            names,
            vec!["fundamentals", "valuation", "volatility", "macro", "news", "sentiment"]
        );
    }

    #[test]
    fn disabled_baskets_are_skipped() {
        let mut configs = default_baskets();
        configs[1].enabled = false;
        let baskets = validate_baskets(&configs).unwrap();
        assert_eq!(baskets.len(), 5);
        assert_eq!(baskets[1].name(), "volatility");
    }

    #[test]
    fn invalid_basket_configs_are_rejected() {
        let mut duplicate = default_baskets();
        duplicate[1].name = "fundamentals".to_string();
        assert!(matches!(
            validate_baskets(&duplicate),
            Err(EngineError::Config(_))
        ));

        let mut no_sources = default_baskets();
        no_sources[0].sources.clear();
        assert!(validate_baskets(&no_sources).is_err());

        let mut primary_not_first = default_baskets();
        primary_not_first[0].sources.reverse();
        assert!(validate_baskets(&primary_not_first).is_err());

        let mut two_primaries = default_baskets();
        two_primaries[0].sources[1].primary = true;
        assert!(validate_baskets(&two_primaries).is_err());

        let mut all_disabled = default_baskets();
        all_disabled.iter_mut().for_each(|b| b.enabled = false);
        assert!(validate_baskets(&all_disabled).is_err());
    }

    #[test]
    fn zero_basket_timeout_is_rejected() {
        let mut zero = default_baskets();
        zero[3].timeout_seconds = Some(0);
        assert!(matches!(
            validate_baskets(&zero),
            Err(EngineError::Config(message)) if message.contains("macro")
        ));

        let mut disabled = default_baskets();
        disabled[3].timeout_seconds = Some(0);
        disabled[3].enabled = false;
        assert!(validate_baskets(&disabled).is_ok());
    }

    #[test]
    fn swot_summary_is_collected() {
        let result = basket("fundamentals")
            .classify(&json!({
                "sources": {"sec_edgar": {"data": {"revenue": 1}}},
                "swot_summary": {
                    "strengths": ["Services margin"],
                    "threats": ["Regulation", "China demand"],
                    "weaknesses": "not a list"
                }
            }))
            .unwrap();
        let swot = result.swot.unwrap();
        assert_eq!(swot.strengths, vec![json!("Services margin")]);
        assert_eq!(swot.threats.len(), 2);
        assert!(swot.weaknesses.is_empty());
        assert!(swot.opportunities.is_empty());

        let bare = basket("fundamentals")
            .classify(&json!({
                "sec_edgar": {"revenue": 1, "swot_summary": {"strengths": ["x"]}},
                "swot_summary": {"strengths": []}
            }))
            .unwrap();
        assert!(bare.swot.is_none());
        assert!(!bare.sources[0].metrics.contains_key("swot_summary"));
    }
}
