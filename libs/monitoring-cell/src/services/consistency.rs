// =====================================================================================
// CONSISTENCY VALIDATOR
// =====================================================================================
//
// Reconciles one logical collection across two data sources by primary key.
// Collections larger than the sample ceiling are compared on a systematic
// sample of the larger source, matched by key in the other, and the report
// says so.
//

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::adapters::{DataSourceAdapter, Record};
use crate::models::{invalid_records_issue, quality_score, ConsistencyReport, MonitoringError};
use shared_config::{CollectionConfig, MonitorConfig};

pub struct ConsistencyValidator {
    sample_ceiling: u64,
    tolerance: f64,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct FieldTally {
    missing: u64,
    divergent: u64,
}

#[derive(Debug, Default)]
struct Reconciliation {
    total: u64,
    valid: u64,
    duplicates_a: u64,
    duplicates_b: u64,
    only_in_a: u64,
    only_in_b: u64,
    matched: u64,
    keyless: u64,
    fields: BTreeMap<String, FieldTally>,
}

impl ConsistencyValidator {
    pub fn new(config: &MonitorConfig) -> Self {
        Self::with_limits(config.sample_ceiling, config.numeric_tolerance)
    }

    pub fn with_limits(sample_ceiling: u64, tolerance: f64) -> Self {
        Self {
            sample_ceiling: sample_ceiling.max(1),
            tolerance,
        }
    }

    #[instrument(skip(self, collection, source_a, source_b), fields(collection = %collection.name))]
    pub async fn validate(
        &self,
        collection: &CollectionConfig,
        source_a: &dyn DataSourceAdapter,
        source_b: &dyn DataSourceAdapter,
    ) -> Result<ConsistencyReport, MonitoringError> {
        self.validate_as(&collection.name, collection, source_a, source_b).await
    }

    /// Same as `validate`, but files the report under `label`.
    pub async fn validate_as(
        &self,
        label: &str,
        collection: &CollectionConfig,
        source_a: &dyn DataSourceAdapter,
        source_b: &dyn DataSourceAdapter,
    ) -> Result<ConsistencyReport, MonitoringError> {
        let (count_a, count_b) = futures::try_join!(
            source_a.count_records(&collection.name),
            source_b.count_records(&collection.name),
        )?;

        let largest = count_a.max(count_b);
        let sampled = largest > self.sample_ceiling;

        let (sample_a, sample_b) = if sampled {
            // The larger side picks the sample; the other side is fetched by the same keys
            // so both halves of the comparison cover identical records.
            if count_b > count_a {
                let (b, a) = self.sample_by_key(collection, source_b, source_a).await?;
                (a, b)
            } else {
                self.sample_by_key(collection, source_a, source_b).await?
            }
        } else {
            let limit = largest.max(1);
            futures::try_join!(
                source_a.sample_records(&collection.name, limit),
                source_b.sample_records(&collection.name, limit),
            )?
        };

        debug!(
            count_a,
            count_b,
            sampled,
            sample_a = sample_a.len(),
            sample_b = sample_b.len(),
            "reconciling collection"
        );

        let reconciliation = self.reconcile(collection, &sample_a, &sample_b);
        Ok(self.build_report(
            label,
            collection,
            (source_a.name(), count_a),
            (source_b.name(), count_b),
            sampled,
            &reconciliation,
        ))
    }

    /// Samples `reference` and fetches the same primary keys from `other`.
    async fn sample_by_key(
        &self,
        collection: &CollectionConfig,
        reference: &dyn DataSourceAdapter,
        other: &dyn DataSourceAdapter,
    ) -> Result<(Vec<Record>, Vec<Record>), MonitoringError> {
        let sample = reference.sample_records(&collection.name, self.sample_ceiling).await?;

        let mut seen = BTreeSet::new();
        let keys: Vec<Value> = sample
            .iter()
            .filter_map(|record| record.get(&collection.primary_key))
            .filter(|value| key_of(value).is_some_and(|key| seen.insert(key)))
            .cloned()
            .collect();

        let matching = other.fetch_records(&collection.name, &collection.primary_key, &keys).await?;
        Ok((sample, matching))
    }

    fn reconcile(&self, collection: &CollectionConfig, sample_a: &[Record], sample_b: &[Record]) -> Reconciliation {
        let mut outcome = Reconciliation::default();
        let (index_a, dup_a, keyless_a) = index_by_key(sample_a, &collection.primary_key);
        let (index_b, dup_b, keyless_b) = index_by_key(sample_b, &collection.primary_key);
        outcome.duplicates_a = dup_a;
        outcome.duplicates_b = dup_b;

        // Records without a primary key cannot be reconciled and count as invalid.
        outcome.keyless = keyless_a + keyless_b;
        if outcome.keyless > 0 {
            outcome.fields.entry(collection.primary_key.clone()).or_default().missing += outcome.keyless;
        }
        outcome.total += outcome.keyless;

        let keys: BTreeSet<&String> = index_a.keys().chain(index_b.keys()).collect();
        for key in keys {
            match (index_a.get(key), index_b.get(key)) {
                (Some(a), Some(b)) => {
                    outcome.total += 1;
                    outcome.matched += 1;
                    if self.compare_pair(collection, a, b, &mut outcome.fields) {
                        outcome.valid += 1;
                    }
                }
                (Some(_), None) => {
                    outcome.total += 1;
                    outcome.only_in_a += 1;
                }
                (None, Some(_)) => {
                    outcome.total += 1;
                    outcome.only_in_b += 1;
                }
                (None, None) => {}
            }
        }
        outcome
    }

    /// Returns true when the pair is valid; tallies every defect found.
    fn compare_pair(
        &self,
        collection: &CollectionConfig,
        a: &Record,
        b: &Record,
        fields: &mut BTreeMap<String, FieldTally>,
    ) -> bool {
        let mut valid = true;

        for field in &collection.required_fields {
            if is_missing(a.get(field)) || is_missing(b.get(field)) {
                fields.entry(field.clone()).or_default().missing += 1;
                valid = false;
            }
        }

        for (field, value_a) in a {
            let Some(value_b) = b.get(field) else { continue };
            if !values_match(value_a, value_b, self.tolerance) {
                fields.entry(field.clone()).or_default().divergent += 1;
                valid = false;
            }
        }
        valid
    }

    fn build_report(
        &self,
        label: &str,
        collection: &CollectionConfig,
        (name_a, count_a): (&str, u64),
        (name_b, count_b): (&str, u64),
        sampled: bool,
        outcome: &Reconciliation,
    ) -> ConsistencyReport {
        let invalid = outcome.total - outcome.valid;
        let largest = count_a.max(count_b);
        let mut issues = Vec::new();

        if sampled {
            issues.push(format!(
                "{}: sampled {} of {} records; quality score covers the sample only",
                label, outcome.total, largest
            ));
            // Fewer than half of the sampled keys exist on both sides.
            if outcome.matched * 2 < outcome.total || outcome.total == 0 {
                issues.push(format!(
                    "{}: sampled comparison inconclusive, {} of {} sampled keys found in both {} and {}",
                    label, outcome.matched, outcome.total, name_a, name_b
                ));
            }
        }
        if count_a != count_b {
            issues.push(format!(
                "{}: record count mismatch ({}={}, {}={})",
                label, name_a, count_a, name_b, count_b
            ));
        }
        if invalid > 0 {
            let mut breakdown = Vec::new();
            if outcome.only_in_a > 0 {
                breakdown.push(format!("{} missing in {}", outcome.only_in_a, name_b));
            }
            if outcome.only_in_b > 0 {
                breakdown.push(format!("{} missing in {}", outcome.only_in_b, name_a));
            }
            for (field, tally) in &outcome.fields {
                if tally.missing > 0 {
                    breakdown.push(format!("{} null or absent in {}", field, tally.missing));
                }
                if tally.divergent > 0 {
                    breakdown.push(format!("{} divergent in {}", field, tally.divergent));
                }
            }
            issues.push(invalid_records_issue(label, invalid, outcome.total, &breakdown));
        }
        let duplicates = outcome.duplicates_a + outcome.duplicates_b;
        if duplicates > 0 {
            issues.push(format!(
                "{}: {} duplicate keys ({}={}, {}={})",
                label, duplicates, name_a, outcome.duplicates_a, name_b, outcome.duplicates_b
            ));
        }

        let missing_fields = outcome
            .fields
            .iter()
            .filter(|(field, tally)| tally.missing > 0 && (collection.required_fields.contains(*field) || **field == collection.primary_key))
            .map(|(field, _)| field.clone())
            .collect();

        ConsistencyReport {
            collection: label.to_string(),
            total_records: outcome.total,
            valid_records: outcome.valid,
            invalid_records: invalid,
            duplicate_records: duplicates,
            missing_fields,
            // A sample that compared nothing proves nothing.
            quality_score: if sampled && outcome.total == 0 && largest > 0 {
                0.0
            } else {
                quality_score(outcome.valid, outcome.total)
            },
            sampled,
            issues,
            timestamp: Utc::now(),
        }
    }
}

impl ConsistencyReport {
    /// The report as an error, when it found anything invalid.
    pub fn mismatch(&self) -> Option<MonitoringError> {
        (self.invalid_records > 0).then(|| MonitoringError::ConsistencyMismatch {
            collection: self.collection.clone(),
            reason: format!("{} of {} records invalid", self.invalid_records, self.total_records),
        })
    }
}

fn key_of(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// First record per key wins; repeated keys are counted as duplicates.
fn index_by_key<'a>(records: &'a [Record], primary_key: &str) -> (HashMap<String, &'a Record>, u64, u64) {
    let mut index = HashMap::with_capacity(records.len());
    let mut duplicates = 0;
    let mut keyless = 0;
    for record in records {
        match record.get(primary_key).and_then(key_of) {
            Some(key) => {
                if index.contains_key(&key) {
                    duplicates += 1;
                } else {
                    index.insert(key, record);
                }
            }
            None => keyless += 1,
        }
    }
    (index, duplicates, keyless)
}

fn is_missing(value: Option<&Value>) -> bool {
    matches!(value, None | Some(Value::Null))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Numbers (or a number and a numeric string) match within a relative tolerance;
/// everything else must be equal.
fn values_match(a: &Value, b: &Value, tolerance: f64) -> bool {
    if a == b {
        return true;
    }
    if matches!(a, Value::Number(_)) || matches!(b, Value::Number(_)) {
        if let (Some(x), Some(y)) = (as_number(a), as_number(b)) {
            let scale = x.abs().max(y.abs());
            return (x - y).abs() <= tolerance * scale;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn prices() -> CollectionConfig {
        CollectionConfig {
            name: "prices".to_string(),
            primary_key: "id".to_string(),
            required_fields: vec!["symbol".to_string(), "close".to_string()],
        }
    }

    #[test]
    fn numeric_values_use_relative_tolerance() {
        assert!(values_match(&json!(100.0), &json!(100.00000001), 1e-6));
        assert!(!values_match(&json!(100.0), &json!(100.01), 1e-6));
        assert!(values_match(&json!(0), &json!(0.0), 1e-6));
        assert!(values_match(&json!(42.5), &json!("42.5"), 1e-6));
        assert!(!values_match(&json!("a"), &json!("b"), 1e-6));
    }

    #[test]
    fn reconcile_flags_missing_and_divergent_records() {
        let validator = ConsistencyValidator::with_limits(1000, 1e-6);
        let a = vec![
            record(json!({"id": 1, "symbol": "PKO", "close": 10.0})),
            record(json!({"id": 2, "symbol": null, "close": 11.0})),
            record(json!({"id": 3, "symbol": "PZU", "close": 12.0})),
            record(json!({"id": 4, "symbol": "KGH", "close": 13.0})),
        ];
        let b = vec![
            record(json!({"id": 1, "symbol": "PKO", "close": 10.0})),
            record(json!({"id": 2, "symbol": "CDR", "close": 11.0})),
            record(json!({"id": 3, "symbol": "PZU", "close": 12.5})),
        ];

        let outcome = validator.reconcile(&prices(), &a, &b);
        assert_eq!(outcome.total, 4);
        assert_eq!(outcome.valid, 1);
        assert_eq!(outcome.only_in_a, 1);

        let report = validator.build_report("prices", &prices(), ("a", 4), ("b", 3), false, &outcome);
        assert_eq!(report.valid_records + report.invalid_records, report.total_records);
        assert_eq!(report.quality_score, 0.25);
        assert_eq!(report.missing_fields, vec!["symbol"]);
        assert_eq!(
            report.issues,
            vec![
                "prices: record count mismatch (a=4, b=3)",
                "prices: 3 invalid records out of 4 \
                 (1 missing in b; close divergent in 1; symbol null or absent in 1; symbol divergent in 1)",
            ]
        );
    }

    #[test]
    fn duplicates_are_counted_per_source() {
        let validator = ConsistencyValidator::with_limits(1000, 1e-6);
        let a = vec![
            record(json!({"id": 1, "symbol": "PKO", "close": 1.0})),
            record(json!({"id": 1, "symbol": "PKO", "close": 1.0})),
        ];
        let b = vec![record(json!({"id": 1, "symbol": "PKO", "close": 1.0}))];

        let outcome = validator.reconcile(&prices(), &a, &b);
        let report = validator.build_report("prices", &prices(), ("a", 2), ("b", 1), false, &outcome);
        assert_eq!(report.duplicate_records, 1);
        assert_eq!(report.total_records, 1);
        assert_eq!(report.quality_score, 1.0);
        assert!(report.issues.iter().any(|i| i.contains("1 duplicate keys")));
    }

    #[test]
    fn sampled_report_flags_poor_key_overlap() {
        let validator = ConsistencyValidator::with_limits(2, 1e-6);
        let a = vec![
            record(json!({"id": 1, "symbol": "PKO", "close": 1.0})),
            record(json!({"id": 3, "symbol": "PZU", "close": 3.0})),
            record(json!({"id": 5, "symbol": "KGH", "close": 5.0})),
        ];
        let b = vec![record(json!({"id": 1, "symbol": "PKO", "close": 1.0}))];

        let outcome = validator.reconcile(&prices(), &a, &b);
        assert_eq!(outcome.total, 3);
        assert_eq!(outcome.matched, 1);
        assert_eq!(outcome.only_in_a, 2);

        let report = validator.build_report("prices", &prices(), ("a", 9), ("b", 9), true, &outcome);
        assert!(report.sampled);
        assert!(report.issues[0].contains("sampled 3 of 9"));
        assert!(report.issues[1].contains("inconclusive, 1 of 3"));
        assert_eq!(report.quality_score, 0.3333);
    }

    #[test]
    fn empty_sample_of_large_collection_does_not_score_one() {
        let validator = ConsistencyValidator::with_limits(2, 1e-6);
        let outcome = validator.reconcile(&prices(), &[], &[]);
        let report = validator.build_report("prices", &prices(), ("a", 10), ("b", 10), true, &outcome);
        assert_eq!(report.total_records, 0);
        assert_eq!(report.quality_score, 0.0);
        assert!(report.issues.iter().any(|i| i.contains("inconclusive")));
    }

    #[test]
    fn empty_samples_score_one() {
        let validator = ConsistencyValidator::with_limits(1000, 1e-6);
        let outcome = validator.reconcile(&prices(), &[], &[]);
        let report = validator.build_report("prices", &prices(), ("a", 0), ("b", 0), false, &outcome);
        assert_eq!(report.total_records, 0);
        assert_eq!(report.quality_score, 1.0);
        assert!(report.issues.is_empty());
        assert!(report.mismatch().is_none());
    }
}
