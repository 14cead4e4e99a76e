use std::collections::BTreeSet;

use fira_models::{CompletenessReport, CompletenessSummary};
use rust_decimal::Decimal;

/// Score one category against its manifest. Duplicate manifest entries count once.
pub fn score(category: &str, manifest: &[String], found: &BTreeSet<String>) -> CompletenessReport {
    let mut seen = BTreeSet::new();
    let required: Vec<&String> = manifest.iter().filter(|m| seen.insert(*m)).collect();

    let missing: Vec<String> = required
        .iter()
        .filter(|m| !found.contains(m.as_str()))
        .map(|m| m.to_string())
        .collect();
    let hits = required.len() - missing.len();

    CompletenessReport {
        category: category.to_string(),
        required: required.len(),
        found: hits,
        percentage: percentage(hits, required.len()),
        missing,
    }
}

/// Roll category reports up into totals. The overall percentage is computed
/// from the summed counts, not averaged.
pub fn summarize(reports: impl IntoIterator<Item = CompletenessReport>) -> CompletenessSummary {
    let mut summary = CompletenessSummary::default();
    for report in reports {
        summary.required += report.required;
        summary.found += report.found;
        summary.categories.insert(report.category.clone(), report);
    }
    summary.percentage = percentage(summary.found, summary.required);
    summary
}

/// `found / required * 100`, rounded to one decimal place. Zero when nothing is required.
pub fn percentage(found: usize, required: usize) -> Decimal {
    if required == 0 {
        return Decimal::ZERO;
    }
    (Decimal::from(found) * Decimal::ONE_HUNDRED / Decimal::from(required)).round_dp(1)
}
