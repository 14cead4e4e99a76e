use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single metric reading from one source.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricValue {
    pub value: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<String>,
    /// Anything else the tool server attached (form, fiscal_year, data_type, ...).
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl MetricValue {
    pub fn new(value: serde_json::Value) -> Self {
        Self {
            value,
            as_of: None,
            metadata: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    Primary,
    Secondary,
}

/// One upstream source's contribution to a basket, before conflict resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceRecord {
    pub source: String,
    pub role: SourceRole,
    /// True when this non-primary source supplied at least one resolved value.
    pub fallback_used: bool,
    /// `None` means the source reported the metric but had no data for it.
    pub metrics: BTreeMap<String, Option<MetricValue>>,
}

impl SourceRecord {
    pub fn has_data(&self) -> bool {
        self.metrics.values().any(|m| m.is_some())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Primary,
    Secondary,
}

/// The value chosen for a metric after conflict resolution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResolvedMetric {
    pub value: serde_json::Value,
    pub source: String,
    pub resolution: Resolution,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub as_of: Option<String>,
}

/// Two sources both reported a metric. The chosen value is always taken verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConflictEntry {
    pub category: String,
    pub metric: String,
    pub primary_source: String,
    pub primary_value: serde_json::Value,
    pub secondary_source: String,
    pub secondary_value: serde_json::Value,
    pub used: Resolution,
    /// Values differ beyond the configured tolerance.
    pub disagreement: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CompletenessReport {
    pub category: String,
    pub required: usize,
    pub found: usize,
    /// 0-100, one decimal place.
    pub percentage: Decimal,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletenessSummary {
    pub required: usize,
    pub found: usize,
    pub percentage: Decimal,
    pub categories: BTreeMap<String, CompletenessReport>,
}

/// Why a basket contributed nothing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BasketFailure {
    pub basket: String,
    /// `launch`, `timeout`, `protocol`, `handshake` or `payload`.
    pub kind: String,
    pub message: String,
    pub attempts: u32,
}

/// Strengths, weaknesses, opportunities and threats reported by tool servers.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SwotSummary {
    #[serde(default)]
    pub strengths: Vec<serde_json::Value>,
    #[serde(default)]
    pub weaknesses: Vec<serde_json::Value>,
    #[serde(default)]
    pub opportunities: Vec<serde_json::Value>,
    #[serde(default)]
    pub threats: Vec<serde_json::Value>,
}

impl SwotSummary {
    /// Append another summary's items after this one's.
    pub fn extend(&mut self, other: SwotSummary) {
        self.strengths.extend(other.strengths);
        self.weaknesses.extend(other.weaknesses);
        self.opportunities.extend(other.opportunities);
        self.threats.extend(other.threats);
    }

    pub fn is_empty(&self) -> bool {
        self.strengths.is_empty()
            && self.weaknesses.is_empty()
            && self.opportunities.is_empty()
            && self.threats.is_empty()
    }
}

/// The aggregated output of a completed research task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResearchReport {
    pub ticker: String,
    pub company_name: String,
    pub sources_available: Vec<String>,
    pub sources_failed: Vec<String>,
    pub failures: Vec<BasketFailure>,
    /// Conflict-resolved metrics per category.
    pub metrics: BTreeMap<String, BTreeMap<String, ResolvedMetric>>,
    /// Pre-resolution view per category, kept for audit.
    pub multi_source: BTreeMap<String, Vec<SourceRecord>>,
    pub fallback_used: BTreeMap<String, bool>,
    pub completeness: CompletenessSummary,
    pub conflicts: Vec<ConflictEntry>,
    /// SWOT items from every successful basket, in basket order.
    pub aggregated_swot: SwotSummary,
    pub generated_at: DateTime<Utc>,
}
