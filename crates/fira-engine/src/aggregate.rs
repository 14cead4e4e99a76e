use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use fira_mcp::ToolError;
use fira_models::{
    BasketFailure, CompletenessReport, ConflictEntry, ResearchReport, Resolution, ResolvedMetric,
    SourceRecord, SwotSummary,
};
use rust_decimal::Decimal;

use crate::basket::{Basket, BasketResult};
use crate::completeness;
use crate::resolve::{ConflictResolver, SourceValue};

/// What one successful basket contributed, ready to become a partial event.
#[derive(Debug, Clone, PartialEq)]
pub struct BasketFold {
    pub metrics: BTreeMap<String, ResolvedMetric>,
    pub completeness: CompletenessReport,
    pub fallback_used: bool,
}

/// Accumulates basket outcomes for one task into a [`ResearchReport`].
#[derive(Debug)]
pub struct Aggregate {
    ticker: String,
    company_name: String,
    resolver: ConflictResolver,
    sources_available: Vec<String>,
    sources_failed: Vec<String>,
    failures: Vec<BasketFailure>,
    metrics: BTreeMap<String, BTreeMap<String, ResolvedMetric>>,
    multi_source: BTreeMap<String, Vec<SourceRecord>>,
    fallback_used: BTreeMap<String, bool>,
    completeness: Vec<CompletenessReport>,
    conflicts: Vec<ConflictEntry>,
    swot: SwotSummary,
}

impl Aggregate {
    pub fn new(ticker: &str, company_name: &str, tolerance: Decimal) -> Self {
        Self {
            ticker: ticker.to_string(),
            company_name: company_name.to_string(),
            resolver: ConflictResolver::new(tolerance),
            sources_available: Vec::new(),
            sources_failed: Vec::new(),
            failures: Vec::new(),
            metrics: BTreeMap::new(),
            multi_source: BTreeMap::new(),
            fallback_used: BTreeMap::new(),
            completeness: Vec::new(),
            conflicts: Vec::new(),
            swot: SwotSummary::default(),
        }
    }

    /// Resolve every metric the basket returned and score it against the manifest.
    pub fn record_success(&mut self, basket: &Basket, mut result: BasketResult) -> BasketFold {
        let category = basket.name();
        let metric_names: BTreeSet<String> = result
            .sources
            .iter()
            .flat_map(|record| record.metrics.keys().cloned())
            .collect();

        let mut resolved = BTreeMap::new();
        let mut fallback_sources = BTreeSet::new();

        for metric in &metric_names {
            let candidates: Vec<SourceValue<'_>> = result
                .sources
                .iter()
                .map(|record| SourceValue {
                    source: &record.source,
                    role: record.role,
                    value: record.metrics.get(metric).and_then(Option::as_ref),
                })
                .collect();

            let outcome = self.resolver.resolve(category, metric, &candidates);
            if let Some(chosen) = outcome.metric {
                if chosen.resolution == Resolution::Secondary {
                    fallback_sources.insert(chosen.source.clone());
                }
                resolved.insert(metric.clone(), chosen);
            }
            self.conflicts.extend(outcome.conflicts);
        }

        for record in &mut result.sources {
            record.fallback_used = fallback_sources.contains(&record.source);
        }
        let fallback_used = result.fallback_used || !fallback_sources.is_empty();

        let found: BTreeSet<String> = resolved.keys().cloned().collect();
        let completeness = completeness::score(category, basket.manifest(), &found);

        self.sources_available.push(category.to_string());
        self.metrics.insert(category.to_string(), resolved.clone());
        self.multi_source.insert(category.to_string(), result.sources);
        self.fallback_used.insert(category.to_string(), fallback_used);
        self.completeness.push(completeness.clone());
        if let Some(swot) = result.swot {
            self.swot.extend(swot);
        }

        BasketFold {
            metrics: resolved,
            completeness,
            fallback_used,
        }
    }

    /// Record a basket that produced nothing. Its manifest scores zero.
    pub fn record_failure(
        &mut self,
        basket: &Basket,
        error: &ToolError,
        attempts: u32,
    ) -> CompletenessReport {
        let category = basket.name();
        let completeness = completeness::score(category, basket.manifest(), &BTreeSet::new());

        self.sources_failed.push(category.to_string());
        self.failures.push(BasketFailure {
            basket: category.to_string(),
            kind: error.kind().to_string(),
            message: error.to_string(),
            attempts,
        });
        self.completeness.push(completeness.clone());
        completeness
    }

    /// True once at least one basket ran and none of them succeeded.
    pub fn all_failed(&self) -> bool {
        self.sources_available.is_empty() && !self.sources_failed.is_empty()
    }

    pub fn failure_summary(&self) -> String {
        let details: Vec<String> = self
            .failures
            .iter()
            .map(|f| format!("{} ({}: {})", f.basket, f.kind, f.message))
            .collect();
        format!(
            "all {} baskets failed: {}",
            self.failures.len(),
            details.join("; ")
        )
    }

    pub fn finish(self) -> ResearchReport {
        ResearchReport {
            ticker: self.ticker,
            company_name: self.company_name,
            sources_available: self.sources_available,
            sources_failed: self.sources_failed,
            failures: self.failures,
            metrics: self.metrics,
            multi_source: self.multi_source,
            fallback_used: self.fallback_used,
            completeness: completeness::summarize(self.completeness),
            conflicts: self.conflicts,
            aggregated_swot: self.swot,
            generated_at: Utc::now(),
        }
    }
}
