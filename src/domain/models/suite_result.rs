//! Suite-level aggregation of test results.

use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

use super::test_result::{Invocation, PerTestResult, RawTestResult, TestStatus};
use crate::domain::errors::{DomainError, DomainResult};

/// Results of one test suite for one phase.
///
/// Only tests without any expected run take part in pass/fail decisions.
/// Of those, a test whose every run failed is unexpectedly failing (and
/// additionally unexpectedly skipped when every run was skipped); any other
/// test is unexpectedly passing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuiteResult {
    suite_name: String,
    variant_hash: String,
    total_tests_ran: usize,
    unexpected_failing_tests: BTreeSet<String>,
    unexpected_passing_tests: BTreeSet<String>,
    unexpected_skipped_tests: BTreeSet<String>,
    invalid: bool,
    individual_unexpected_test_by_test_name: BTreeMap<String, PerTestResult>,
    all_tests: Vec<PerTestResult>,
    test_id_prefix: String,
    exists_unexpected_failing_result: bool,
}

impl SuiteResult {
    /// Aggregate the raw results of `invocations` into a suite result.
    ///
    /// `total_tests_ran` defaults to the number of raw results. The suite is
    /// invalid when the harness failed on exit without reporting a single
    /// unexpected failure.
    pub fn create(
        invocations: &[Invocation],
        suite_name: &str,
        test_id_prefix: Option<&str>,
        total_tests_ran: Option<usize>,
        failure_on_exit: bool,
    ) -> DomainResult<Self> {
        let mut test_id_prefix = test_id_prefix.unwrap_or_default().to_string();
        let mut variant_hash = String::new();
        let mut total_results = 0usize;
        let mut results_by_test_id: BTreeMap<&str, Vec<(&str, &RawTestResult)>> = BTreeMap::new();

        for inv in invocations {
            total_results += inv.test_results.len();
            for result in &inv.test_results {
                if let Some(inv_suite) = result.suite_name() {
                    if !inv_suite.is_empty() && !suite_name.is_empty() && inv_suite != suite_name {
                        return Err(DomainError::Precondition(format!(
                            "mismatched invocations, {inv_suite} vs {suite_name}"
                        )));
                    }
                }
                variant_hash.clone_from(&result.variant_hash);
                results_by_test_id
                    .entry(result.test_id.as_str())
                    .or_default()
                    .push((inv.name.as_str(), result));
                if !result.test_id.starts_with(&test_id_prefix) {
                    test_id_prefix.clear();
                }
            }
        }

        let total_tests_ran = total_tests_ran.filter(|n| *n > 0).unwrap_or(total_results);
        let mut exists_unexpected_failing_result = false;
        let mut unexpected_failing_tests = BTreeSet::new();
        let mut unexpected_passing_tests = BTreeSet::new();
        let mut unexpected_skipped_tests = BTreeSet::new();
        let mut individual = BTreeMap::new();
        let mut all_tests = Vec::with_capacity(results_by_test_id.len());

        for runs in results_by_test_id.values() {
            let test = PerTestResult::from_raw(&test_id_prefix, runs);
            if test.unexpected_unpassed_count() > 0 {
                exists_unexpected_failing_result = true;
            }
            all_tests.push(test.clone());

            // Auto-retried tests that ended on an expected result are not
            // interesting for retry decisions.
            if runs.iter().any(|(_, r)| r.expected) {
                continue;
            }
            let name = test.test_name().to_string();
            if runs.iter().all(|(_, r)| r.status != TestStatus::Pass) {
                unexpected_failing_tests.insert(name.clone());
                if runs.iter().all(|(_, r)| r.status == TestStatus::Skip) {
                    unexpected_skipped_tests.insert(name.clone());
                }
            } else {
                unexpected_passing_tests.insert(name.clone());
            }
            individual.insert(name, test);
        }

        Ok(Self {
            suite_name: suite_name.to_string(),
            variant_hash,
            total_tests_ran,
            unexpected_failing_tests,
            unexpected_passing_tests,
            unexpected_skipped_tests,
            invalid: failure_on_exit && !exists_unexpected_failing_result,
            individual_unexpected_test_by_test_name: individual,
            all_tests,
            test_id_prefix,
            exists_unexpected_failing_result,
        })
    }

    /// Result for a suite that produced no invocations at all.
    pub fn empty(suite_name: &str, failure_on_exit: bool) -> Self {
        Self {
            suite_name: suite_name.to_string(),
            variant_hash: String::new(),
            total_tests_ran: 0,
            unexpected_failing_tests: BTreeSet::new(),
            unexpected_passing_tests: BTreeSet::new(),
            unexpected_skipped_tests: BTreeSet::new(),
            invalid: failure_on_exit,
            individual_unexpected_test_by_test_name: BTreeMap::new(),
            all_tests: Vec::new(),
            test_id_prefix: String::new(),
            exists_unexpected_failing_result: false,
        }
    }

    /// Same results with validity recomputed for a newly known exit status.
    #[must_use]
    pub fn with_failure_on_exit(&self, failure_on_exit: bool) -> Self {
        Self {
            invalid: failure_on_exit && !self.exists_unexpected_failing_result,
            ..self.clone()
        }
    }

    pub fn suite_name(&self) -> &str {
        &self.suite_name
    }

    pub fn variant_hash(&self) -> &str {
        &self.variant_hash
    }

    pub const fn total_tests_ran(&self) -> usize {
        self.total_tests_ran
    }

    pub const fn unexpected_failing_tests(&self) -> &BTreeSet<String> {
        &self.unexpected_failing_tests
    }

    pub const fn unexpected_passing_tests(&self) -> &BTreeSet<String> {
        &self.unexpected_passing_tests
    }

    pub const fn unexpected_skipped_tests(&self) -> &BTreeSet<String> {
        &self.unexpected_skipped_tests
    }

    pub const fn invalid(&self) -> bool {
        self.invalid
    }

    pub fn test_id_prefix(&self) -> &str {
        &self.test_id_prefix
    }

    pub fn all_tests(&self) -> &[PerTestResult] {
        &self.all_tests
    }

    pub fn unexpected_test(&self, test_name: &str) -> Option<&PerTestResult> {
        self.individual_unexpected_test_by_test_name.get(test_name)
    }

    /// Full test id for a test name, or the name itself if unknown.
    pub fn test_id_for<'a>(&'a self, test_name: &'a str) -> &'a str {
        self.find_test_id(test_name).unwrap_or(test_name)
    }

    /// Full test id of `test_name`, if the suite reported it.
    pub fn find_test_id(&self, test_name: &str) -> Option<&str> {
        self.all_tests
            .iter()
            .find(|t| t.test_name() == test_name)
            .map(PerTestResult::test_id)
    }

    /// Unexpectedly failing tests that never actually executed.
    pub fn not_run_tests(&self) -> BTreeSet<String> {
        self.unexpected_failing_tests
            .iter()
            .filter(|name| self.unexpected_test(name).is_some_and(PerTestResult::is_not_run))
            .cloned()
            .collect()
    }

    /// Tests with at least one unexpected non-passing run.
    pub fn tests_failed_at_least_once(&self) -> BTreeSet<String> {
        self.all_tests
            .iter()
            .filter(|t| t.unexpected_unpassed_count() > 0)
            .map(|t| t.test_name().to_string())
            .collect()
    }

    /// Tests split by whether any run passed: `(passing, failing)`.
    pub fn passing_and_failing_tests(&self) -> (BTreeSet<String>, BTreeSet<String>) {
        let (passing, failing): (Vec<_>, Vec<_>) =
            self.all_tests.iter().partition(|t| t.pass_count() > 0);
        (
            passing.into_iter().map(|t| t.test_name().to_string()).collect(),
            failing.into_iter().map(|t| t.test_name().to_string()).collect(),
        )
    }

    pub fn to_json(&self) -> serde_json::Value {
        let mut all: Vec<&str> = self.all_tests.iter().map(PerTestResult::test_name).collect();
        all.sort_unstable();
        json!({
            "suite_name": self.suite_name,
            "test_id_prefix": self.test_id_prefix,
            "variant_hash": self.variant_hash,
            "invalid": self.invalid,
            "total_tests_ran": self.total_tests_ran,
            "unexpected_passing_tests": self.unexpected_passing_tests,
            "unexpected_failing_tests": self.unexpected_failing_tests,
            "unexpected_skipped_tests": self.unexpected_skipped_tests,
            "all_tests": all,
        })
    }
}

/// All suite results of one phase.
#[derive(Debug, Clone, Default)]
pub struct ResultSet<'a> {
    all_suites: Vec<&'a SuiteResult>,
    unexpected_failing_suites: Vec<&'a SuiteResult>,
}

impl<'a> ResultSet<'a> {
    pub fn create(results: impl IntoIterator<Item = &'a SuiteResult>) -> Self {
        let all_suites: Vec<&'a SuiteResult> = results.into_iter().collect();
        let unexpected_failing_suites = all_suites
            .iter()
            .copied()
            .filter(|s| !s.unexpected_failing_tests().is_empty() || s.invalid())
            .collect();
        Self {
            all_suites,
            unexpected_failing_suites,
        }
    }

    pub fn all_suites(&self) -> &[&'a SuiteResult] {
        &self.all_suites
    }

    /// Suites with unexpected failures or invalid results.
    pub fn unexpected_failing_suites(&self) -> &[&'a SuiteResult] {
        &self.unexpected_failing_suites
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "unexpected_failing_suites": self
                .unexpected_failing_suites
                .iter()
                .map(|s| s.suite_name())
                .collect::<Vec<_>>(),
            "all_suites": self.all_suites.iter().map(|s| s.to_json()).collect::<Vec<_>>(),
        })
    }
}
