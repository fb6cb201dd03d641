//! Per-test results as reported by the result backend.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::errors::{DomainError, DomainResult};

/// Outcome of a single run of a single test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Crash,
    Abort,
    Skip,
    #[serde(other)]
    Unknown,
}

impl TestStatus {
    /// Skipped or unknown runs never executed the test body.
    pub const fn is_not_run(self) -> bool {
        matches!(self, Self::Skip | Self::Unknown)
    }
}

/// Key/value metadata attached to a raw result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub key: String,
    pub value: String,
}

/// One run of one test as stored by the result backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawTestResult {
    pub test_id: String,
    #[serde(default)]
    pub variant_hash: String,
    /// Variant definition; `test_suite` names the suite that produced it.
    #[serde(default)]
    pub variant: BTreeMap<String, String>,
    pub status: TestStatus,
    #[serde(default)]
    pub expected: bool,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub tags: Vec<Tag>,
}

impl RawTestResult {
    pub fn suite_name(&self) -> Option<&str> {
        self.variant.get("test_suite").map(String::as_str)
    }
}

/// A named container of raw results, one per test harness invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub name: String,
    #[serde(default)]
    pub test_results: Vec<RawTestResult>,
}

/// Every run of one test id within a suite's invocations.
///
/// The three per-run vectors are parallel: index `i` of each describes the
/// same run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PerTestResult {
    test_id: String,
    test_name: String,
    invocation: String,
    statuses: Vec<TestStatus>,
    expectednesses: Vec<bool>,
    failure_reasons: Vec<String>,
    duration_ms: Option<u64>,
}

impl PerTestResult {
    pub fn new(
        test_id: impl Into<String>,
        test_name: impl Into<String>,
        invocation: impl Into<String>,
        statuses: Vec<TestStatus>,
        expectednesses: Vec<bool>,
        failure_reasons: Vec<String>,
        duration_ms: Option<u64>,
    ) -> DomainResult<Self> {
        if statuses.len() != expectednesses.len() || statuses.len() != failure_reasons.len() {
            return Err(DomainError::Precondition(format!(
                "per-run vectors differ in length: {} statuses, {} expectednesses, {} failure reasons",
                statuses.len(),
                expectednesses.len(),
                failure_reasons.len()
            )));
        }
        Ok(Self {
            test_id: test_id.into(),
            test_name: test_name.into(),
            invocation: invocation.into(),
            statuses,
            expectednesses,
            failure_reasons,
            duration_ms,
        })
    }

    /// Build from every raw result sharing one test id.
    ///
    /// The test name comes from the last `test_name` tag seen, falling back
    /// to the test id with `test_id_prefix` removed. The duration is taken
    /// from the last expected pass that reported one.
    pub fn from_raw(test_id_prefix: &str, runs: &[(&str, &RawTestResult)]) -> Self {
        let mut test_id = String::new();
        let mut test_name: Option<String> = None;
        let mut invocation = String::new();
        let mut duration_ms = None;
        let mut statuses = Vec::with_capacity(runs.len());
        let mut expectednesses = Vec::with_capacity(runs.len());
        let mut failure_reasons = Vec::with_capacity(runs.len());

        for (inv_name, result) in runs {
            test_id.clone_from(&result.test_id);
            invocation = (*inv_name).to_string();
            statuses.push(result.status);
            expectednesses.push(result.expected);
            failure_reasons.push(result.failure_reason.clone().unwrap_or_default());
            if result.expected && result.status == TestStatus::Pass && result.duration_ms.is_some() {
                duration_ms = result.duration_ms;
            }
            if let Some(tag) = result.tags.iter().rev().find(|t| t.key == "test_name") {
                test_name = Some(tag.value.clone());
            }
        }

        let test_name = test_name.unwrap_or_else(|| {
            test_id
                .strip_prefix(test_id_prefix)
                .unwrap_or(&test_id)
                .to_string()
        });

        Self {
            test_id,
            test_name,
            invocation,
            statuses,
            expectednesses,
            failure_reasons,
            duration_ms,
        }
    }

    pub fn test_id(&self) -> &str {
        &self.test_id
    }

    pub fn test_name(&self) -> &str {
        &self.test_name
    }

    pub fn invocation(&self) -> &str {
        &self.invocation
    }

    pub fn statuses(&self) -> &[TestStatus] {
        &self.statuses
    }

    pub fn expectednesses(&self) -> &[bool] {
        &self.expectednesses
    }

    pub fn failure_reasons(&self) -> &[String] {
        &self.failure_reasons
    }

    pub const fn duration_ms(&self) -> Option<u64> {
        self.duration_ms
    }

    pub fn total_test_count(&self) -> usize {
        self.statuses.len()
    }

    /// Runs that did not pass and were not expected to fail.
    pub fn unexpected_unpassed_count(&self) -> usize {
        self.statuses
            .iter()
            .zip(&self.expectednesses)
            .filter(|(status, expected)| **status != TestStatus::Pass && !**expected)
            .count()
    }

    pub fn pass_count(&self) -> usize {
        self.statuses.iter().filter(|s| **s == TestStatus::Pass).count()
    }

    pub fn is_not_run(&self) -> bool {
        !self.statuses.is_empty() && self.statuses.iter().all(|s| s.is_not_run())
    }
}

/// Record telling the result backend a failure does not count against
/// the change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exoneration {
    pub test_id: String,
    pub variant_hash: String,
    pub explanation_html: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(status: TestStatus, expected: bool) -> RawTestResult {
        RawTestResult {
            test_id: "ninja://chrome/test:browser_tests/Suite.Case".to_string(),
            variant_hash: "abc".to_string(),
            variant: BTreeMap::new(),
            status,
            expected,
            duration_ms: Some(10),
            failure_reason: None,
            tags: vec![],
        }
    }

    #[test]
    fn test_new_rejects_ragged_vectors() {
        let result = PerTestResult::new(
            "id",
            "name",
            "inv",
            vec![TestStatus::Pass, TestStatus::Fail],
            vec![true],
            vec![String::new(), String::new()],
            None,
        );
        assert!(matches!(result, Err(DomainError::Precondition(_))));
    }

    #[test]
    fn test_from_raw_strips_prefix_without_tag() {
        let a = raw(TestStatus::Fail, false);
        let b = raw(TestStatus::Pass, true);
        let result =
            PerTestResult::from_raw("ninja://chrome/test:browser_tests/", &[("inv-1", &a), ("inv-2", &b)]);
        assert_eq!(result.test_name(), "Suite.Case");
        assert_eq!(result.invocation(), "inv-2");
        assert_eq!(result.total_test_count(), 2);
        assert_eq!(result.unexpected_unpassed_count(), 1);
        assert_eq!(result.duration_ms(), Some(10));
    }

    #[test]
    fn test_from_raw_prefers_test_name_tag() {
        let mut a = raw(TestStatus::Fail, false);
        a.tags.push(Tag {
            key: "test_name".to_string(),
            value: "Suite.Case/0".to_string(),
        });
        let result = PerTestResult::from_raw("", &[("inv", &a)]);
        assert_eq!(result.test_name(), "Suite.Case/0");
        assert_eq!(result.duration_ms(), None);
    }

    #[test]
    fn test_not_run_requires_every_run_skipped_or_unknown() {
        let skip = raw(TestStatus::Skip, false);
        let unknown = raw(TestStatus::Unknown, false);
        let fail = raw(TestStatus::Fail, false);
        assert!(PerTestResult::from_raw("", &[("i", &skip), ("i", &unknown)]).is_not_run());
        assert!(!PerTestResult::from_raw("", &[("i", &skip), ("i", &fail)]).is_not_run());
    }
}
