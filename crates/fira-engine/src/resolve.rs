use std::str::FromStr;

use fira_models::{ConflictEntry, MetricValue, Resolution, ResolvedMetric, SourceRole};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Number, Value};

/// One source's view of a metric, in priority order.
#[derive(Debug, Clone, Copy)]
pub struct SourceValue<'a> {
    pub source: &'a str,
    pub role: SourceRole,
    pub value: Option<&'a MetricValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    /// `None` when no source had a value.
    pub metric: Option<ResolvedMetric>,
    pub conflicts: Vec<ConflictEntry>,
}

/// Picks one value per metric from a ranked list of sources and records
/// every alternative it passed over.
#[derive(Debug, Clone, Copy)]
pub struct ConflictResolver {
    tolerance: Decimal,
}

impl ConflictResolver {
    pub fn new(tolerance: Decimal) -> Self {
        Self { tolerance }
    }

    pub fn tolerance(&self) -> Decimal {
        self.tolerance
    }

    /// The first source with a value wins. Every other source with a value
    /// produces a [`ConflictEntry`], flagged when the values disagree.
    pub fn resolve(&self, category: &str, metric: &str, candidates: &[SourceValue<'_>]) -> Resolved {
        let Some((index, chosen, value)) = candidates
            .iter()
            .enumerate()
            .find_map(|(i, c)| c.value.map(|v| (i, c, v)))
        else {
            return Resolved {
                metric: None,
                conflicts: Vec::new(),
            };
        };

        let resolution = match chosen.role {
            SourceRole::Primary => Resolution::Primary,
            SourceRole::Secondary => Resolution::Secondary,
        };

        let conflicts = candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != index)
            .filter_map(|(_, other)| other.value.map(|v| (other.source, v)))
            .map(|(source, other)| ConflictEntry {
                category: category.to_string(),
                metric: metric.to_string(),
                primary_source: chosen.source.to_string(),
                primary_value: value.value.clone(),
                secondary_source: source.to_string(),
                secondary_value: other.value.clone(),
                used: resolution,
                disagreement: self.disagrees(&value.value, &other.value),
            })
            .collect();

        Resolved {
            metric: Some(ResolvedMetric {
                value: value.value.clone(),
                source: chosen.source.to_string(),
                resolution,
                as_of: value.as_of.clone(),
            }),
            conflicts,
        }
    }

    /// Numbers disagree when their relative gap exceeds the tolerance;
    /// anything else disagrees unless it is equal.
    pub fn disagrees(&self, chosen: &Value, other: &Value) -> bool {
        match (chosen, other) {
            (Value::Number(a), Value::Number(b)) => self.numbers_disagree(a, b),
            _ => chosen != other,
        }
    }

    fn numbers_disagree(&self, a: &Number, b: &Number) -> bool {
        match (exact(a), exact(b)) {
            (Some(a), Some(b)) => {
                if a.is_zero() {
                    return !b.is_zero();
                }
                // Overflow means the gap is far beyond any sane tolerance.
                a.checked_sub(b)
                    .and_then(|gap| gap.abs().checked_div(a.abs()))
                    .map_or(true, |relative| relative > self.tolerance)
            }
            // Outside Decimal's range; compare in floating point.
            _ => {
                let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) else {
                    return a != b;
                };
                if a == 0.0 {
                    return b != 0.0;
                }
                let tolerance = self.tolerance.to_f64().unwrap_or_default();
                ((a - b) / a).abs() > tolerance
            }
        }
    }
}

/// The number exactly as written in the payload, when Decimal can hold it.
fn exact(number: &Number) -> Option<Decimal> {
    let text = number.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn resolver() -> ConflictResolver {
        ConflictResolver::new(dec!(0.01))
    }

    fn metric(value: Value) -> MetricValue {
        MetricValue::new(value)
    }

    #[test]
    fn primary_wins_and_disagreement_is_recorded() {
        let bea = metric(json!(4.3));
        let fred = metric(json!(4.1));
        let resolved = resolver().resolve(
            "macro",
            "gdp_growth",
            &[
                SourceValue { source: "bea_bls", role: SourceRole::Primary, value: Some(&bea) },
                SourceValue { source: "fred", role: SourceRole::Secondary, value: Some(&fred) },
            ],
        );

        let chosen = resolved.metric.unwrap();
        assert_eq!(chosen.value, json!(4.3));
        assert_eq!(chosen.source, "bea_bls");
        assert_eq!(chosen.resolution, Resolution::Primary);

        assert_eq!(resolved.conflicts.len(), 1);
        let conflict = &resolved.conflicts[0];
        assert_eq!(conflict.primary_source, "bea_bls");
        assert_eq!(conflict.secondary_source, "fred");
        assert_eq!(conflict.secondary_value, json!(4.1));
        assert_eq!(conflict.used, Resolution::Primary);
        assert!(conflict.disagreement);
    }

    #[test]
    fn secondary_used_when_primary_is_empty() {
        let yahoo = metric(json!(1.21));
        let resolved = resolver().resolve(
            "volatility",
            "beta",
            &[
                SourceValue { source: "yahoo_finance", role: SourceRole::Primary, value: None },
                SourceValue { source: "alpha_vantage", role: SourceRole::Secondary, value: Some(&yahoo) },
            ],
        );
        let chosen = resolved.metric.unwrap();
        assert_eq!(chosen.source, "alpha_vantage");
        assert_eq!(chosen.resolution, Resolution::Secondary);
        assert!(resolved.conflicts.is_empty());
    }

    #[test]
    fn later_sources_are_compared_against_the_chosen_secondary() {
        let av = metric(json!(18.0));
        let fred = metric(json!(18.1));
        let resolved = resolver().resolve(
            "volatility",
            "vix",
            &[
                SourceValue { source: "yahoo_finance", role: SourceRole::Primary, value: None },
                SourceValue { source: "alpha_vantage", role: SourceRole::Secondary, value: Some(&av) },
                SourceValue { source: "fred", role: SourceRole::Secondary, value: Some(&fred) },
            ],
        );
        assert_eq!(resolved.conflicts.len(), 1);
        let conflict = &resolved.conflicts[0];
        assert_eq!(conflict.primary_source, "alpha_vantage");
        assert_eq!(conflict.used, Resolution::Secondary);
        // 0.1 / 18.0 is about 0.56%
        assert!(!conflict.disagreement);
    }

    #[test]
    fn nothing_found_resolves_to_none() {
        let resolved = resolver().resolve(
            "macro",
            "cpi_inflation",
            &[SourceValue { source: "bea_bls", role: SourceRole::Primary, value: None }],
        );
        assert!(resolved.metric.is_none());
        assert!(resolved.conflicts.is_empty());
    }

    #[test]
    fn tolerance_boundary_is_exclusive() {
        let r = resolver();
        assert!(!r.disagrees(&json!(100), &json!(101)));
        assert!(r.disagrees(&json!(100), &json!(101.5)));
        assert!(!r.disagrees(&json!(4.3), &json!(4.3)));
        assert!(r.disagrees(&json!(-2.0), &json!(-2.1)));
    }

    #[test]
    fn zero_chosen_value_disagrees_with_any_nonzero() {
        let r = resolver();
        assert!(!r.disagrees(&json!(0), &json!(0.0)));
        assert!(r.disagrees(&json!(0), &json!(0.0001)));
    }

    #[test]
    fn non_numeric_values_compare_by_equality() {
        let r = resolver();
        assert!(!r.disagrees(&json!("AA+"), &json!("AA+")));
        assert!(r.disagrees(&json!("AA+"), &json!("AA")));
        assert!(r.disagrees(&json!(4.3), &json!("4.3")));
        assert!(!r.disagrees(&json!([{"title": "a"}]), &json!([{"title": "a"}])));
    }

    #[test]
    fn huge_values_fall_back_to_float_comparison() {
        let r = resolver();
        assert!(!r.disagrees(&json!(1e30), &json!(1.005e30)));
        assert!(r.disagrees(&json!(1e30), &json!(1.2e30)));
    }

    #[test]
    fn zero_tolerance_flags_any_difference() {
        let strict = ConflictResolver::new(Decimal::ZERO);
        assert!(strict.disagrees(&json!(391035), &json!(391036)));
        assert!(!strict.disagrees(&json!(391035), &json!(391035)));
    }

    #[test]
    fn decimal_payload_values_are_compared_exactly() {
        let r = resolver();
        // Exactly 1% apart as written.
        assert!(!r.disagrees(&json!(4.3), &json!(4.343)));
        assert!(r.disagrees(&json!(4.3), &json!(4.3431)));

        let strict = ConflictResolver::new(Decimal::ZERO);
        let big: Value = serde_json::from_str("9007199254740993").unwrap();
        let neighbour: Value = serde_json::from_str("9007199254740992").unwrap();
        assert!(strict.disagrees(&big, &neighbour));
    }
}
