//! Historical flakiness data returned by the analysis services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::errors::{DomainError, DomainResult};

/// A failing test variant to ask the analysis service about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailingVariant {
    pub test_id: String,
    pub variant_hash: String,
}

/// Verdict counts for one rolling interval. Age 1 is the most recent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IntervalStats {
    pub interval_age: u32,
    pub total_run_expected_verdicts: u32,
    pub total_run_flaky_verdicts: u32,
    pub total_run_unexpected_verdicts: u32,
}

/// A flaky verdict observed at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerdictExample {
    pub partition_time: DateTime<Utc>,
    #[serde(default)]
    pub ingested_invocation_id: String,
}

/// One of the most recent verdicts of a variant, newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RecentVerdict {
    pub ingested_invocation_id: String,
    pub has_unexpected_runs: bool,
}

/// Failure-rate summary of one test variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestVariantFailureRate {
    pub test_id: String,
    #[serde(default)]
    pub variant_hash: String,
    #[serde(default)]
    pub interval_stats: Vec<IntervalStats>,
    #[serde(default)]
    pub run_flaky_verdict_examples: Vec<VerdictExample>,
    #[serde(default)]
    pub recent_verdicts: Vec<RecentVerdict>,
}

impl TestVariantFailureRate {
    /// Flaky verdicts over the `intervals` most recent intervals.
    pub fn flaky_verdicts_in_intervals(&self, intervals: u32) -> u32 {
        self.interval_stats
            .iter()
            .filter(|s| s.interval_age <= intervals)
            .map(|s| s.total_run_flaky_verdicts)
            .sum()
    }

    /// Verdicts with unexpected runs among the `limit` most recent.
    pub fn unexpected_recent_verdicts(&self, limit: usize) -> usize {
        self.recent_verdicts
            .iter()
            .take(limit)
            .filter(|v| v.has_unexpected_runs)
            .count()
    }

    pub fn has_flaky_verdict_since(&self, cutoff: DateTime<Utc>) -> bool {
        self.run_flaky_verdict_examples
            .iter()
            .any(|e| e.partition_time >= cutoff)
    }
}

/// How a failing test was classified by the analysis service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlakeClassification {
    /// Clearly flaky; forgiven and not retried.
    Strong,
    /// Barely flaky; forgiven but retried to keep statistics fresh.
    Weak,
    NotFlaky,
}

/// Issue tracker id of a known flake; the service sends numbers or strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IssueId {
    Number(u64),
    Text(String),
}

impl fmt::Display for IssueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// A test in the legacy known-flakes exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlakeTestRef {
    pub step_ui_name: String,
    pub test_name: String,
}

/// A test the legacy service knows to be flaky at tip of tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownFlake {
    pub test: FlakeTestRef,
    pub affected_gerrit_changes: Vec<serde_json::Value>,
    pub monorail_issue: IssueId,
}

/// Request body of the legacy known-flakes service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownFlakesQuery {
    pub project: String,
    pub bucket: String,
    pub builder: String,
    pub tests: Vec<FlakeTestRef>,
}

#[derive(Deserialize)]
struct KnownFlakesResponse {
    flakes: Vec<KnownFlake>,
}

/// Parse a legacy known-flakes response.
///
/// An empty response means nothing is known to be flaky. A response without
/// a `flakes` list, or with any flake missing a required field, is
/// ill-formed.
pub fn parse_known_flakes(value: serde_json::Value) -> DomainResult<Vec<KnownFlake>> {
    let is_empty = match &value {
        serde_json::Value::Null => true,
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    };
    if is_empty {
        return Ok(Vec::new());
    }
    serde_json::from_value::<KnownFlakesResponse>(value)
        .map(|r| r.flakes)
        .map_err(|e| DomainError::MalformedResponse(format!("response is ill-formed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[test]
    fn test_interval_sums() {
        let rate = TestVariantFailureRate {
            test_id: "t".into(),
            variant_hash: "h".into(),
            interval_stats: (1..=7)
                .map(|age| IntervalStats {
                    interval_age: age,
                    total_run_flaky_verdicts: 1,
                    ..Default::default()
                })
                .collect(),
            run_flaky_verdict_examples: vec![],
            recent_verdicts: (0..12)
                .map(|i| RecentVerdict {
                    ingested_invocation_id: format!("inv-{i}"),
                    has_unexpected_runs: i % 2 == 0,
                })
                .collect(),
        };
        assert_eq!(rate.flaky_verdicts_in_intervals(5), 5);
        assert_eq!(rate.flaky_verdicts_in_intervals(1), 1);
        assert_eq!(rate.unexpected_recent_verdicts(10), 5);
    }

    #[test]
    fn test_flaky_verdict_recency() {
        let now = Utc::now();
        let rate = TestVariantFailureRate {
            test_id: "t".into(),
            variant_hash: "h".into(),
            interval_stats: vec![],
            run_flaky_verdict_examples: vec![VerdictExample {
                partition_time: now - Duration::hours(3),
                ingested_invocation_id: "build-1".into(),
            }],
            recent_verdicts: vec![],
        };
        assert!(rate.has_flaky_verdict_since(now - Duration::hours(12)));
        assert!(!rate.has_flaky_verdict_since(now - Duration::hours(1)));
    }

    #[test]
    fn test_parses_camel_case_payload() {
        let rate: TestVariantFailureRate = serde_json::from_value(json!({
            "testId": "ninja://:base_unittests/A.a",
            "variantHash": "abc",
            "intervalStats": [{"intervalAge": 1, "totalRunFlakyVerdicts": 2}],
            "recentVerdicts": [{"hasUnexpectedRuns": true}]
        }))
        .expect("parse");
        assert_eq!(rate.flaky_verdicts_in_intervals(5), 2);
        assert_eq!(rate.unexpected_recent_verdicts(10), 1);
    }

    #[test]
    fn test_known_flakes_parsing() {
        assert!(parse_known_flakes(json!({})).expect("empty").is_empty());
        assert!(parse_known_flakes(serde_json::Value::Null).expect("null").is_empty());

        let flakes = parse_known_flakes(json!({
            "flakes": [{
                "test": {"step_ui_name": "browser_tests (with patch)", "test_name": "A.a"},
                "affected_gerrit_changes": ["123", "234"],
                "monorail_issue": 999
            }]
        }))
        .expect("valid");
        assert_eq!(flakes[0].monorail_issue.to_string(), "999");

        assert!(matches!(
            parse_known_flakes(json!({"unexpected": []})),
            Err(DomainError::MalformedResponse(_))
        ));
        assert!(parse_known_flakes(json!({
            "flakes": [{"test": {"step_ui_name": "x"}, "monorail_issue": "1", "affected_gerrit_changes": []}]
        }))
        .is_err());
    }
}
