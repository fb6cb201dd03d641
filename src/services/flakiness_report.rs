//! Flakiness metadata for downstream flake analysis.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::domain::models::{Phase, StepStatus, StepSummary};
use crate::services::test_run::TestRun;

/// Test names per with-patch step name.
pub type FlakesByStep = BTreeMap<String, Vec<String>>;

/// Potential flakes observed in one build.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlakinessReport {
    /// Failed with the change but passed when their shards were retried.
    #[serde(rename = "Step Layer Flakiness")]
    pub step_layer_flakiness: FlakesByStep,
    /// Failed with the change and were already known to be flaky.
    #[serde(rename = "Step Layer Skipped Known Flakiness")]
    pub step_layer_skipped_known_flakiness: FlakesByStep,
    /// Failed with the change and caused the build to fail.
    #[serde(rename = "Failing With Patch Tests That Caused Build Failure")]
    pub failing_with_patch: FlakesByStep,
}

impl FlakinessReport {
    pub fn is_empty(&self) -> bool {
        self.step_layer_flakiness.is_empty()
            && self.step_layer_skipped_known_flakiness.is_empty()
            && self.failing_with_patch.is_empty()
    }

    /// Collect potential flakes of `tests`; `None` when there are none.
    pub fn collect<'a>(tests: impl IntoIterator<Item = &'a TestRun>) -> Option<Self> {
        let mut report = Self::default();
        for test in tests {
            let potential = potential_test_flakes(test);
            let known = test.known_flaky_failures();
            let step_name = test.step_name(Phase::WithPatch);

            let skipped_known: Vec<String> = potential.intersection(&known).cloned().collect();
            if !skipped_known.is_empty() {
                report
                    .step_layer_skipped_known_flakiness
                    .insert(step_name.clone(), skipped_known);
            }

            let retry_successes = test.shard_retry_with_patch_results().map(|(passing, _)| passing);
            if let Some(successes) = &retry_successes {
                let flaky: Vec<String> = potential
                    .iter()
                    .filter(|t| successes.contains(*t) && !known.contains(*t))
                    .cloned()
                    .collect();
                if !flaky.is_empty() {
                    report.step_layer_flakiness.insert(step_name.clone(), flaky);
                }
            }

            let failing: Vec<String> = potential
                .iter()
                .filter(|t| !known.contains(*t))
                .filter(|t| retry_successes.as_ref().map_or(true, |s| !s.contains(*t)))
                .cloned()
                .collect();
            if !failing.is_empty() {
                report.failing_with_patch.insert(step_name, failing);
            }
        }
        (!report.is_empty()).then_some(report)
    }

    /// The metadata step carrying this report.
    pub fn to_step(&self) -> StepSummary {
        let mut step = StepSummary::new(
            "FindIt Flakiness",
            StepStatus::Success,
            "Metadata for FindIt post processing.",
        );
        let lines = serde_json::to_value(self)
            .and_then(|v| serde_json::to_string_pretty(&v))
            .map(|json| json.lines().map(str::to_string).collect())
            .unwrap_or_default();
        step.logs.insert("step_metadata".to_string(), lines);
        step
    }
}

/// Failures with the change that analysis may treat as flake candidates.
///
/// Tests that never ran are not candidates, nor are tests that also failed
/// without the change.
fn potential_test_flakes(test: &TestRun) -> BTreeSet<String> {
    let phase = if test.has_valid_results(Phase::WithPatch) {
        Phase::WithPatch
    } else if test.has_valid_results(Phase::RetryShardsWithPatch) {
        Phase::RetryShardsWithPatch
    } else {
        return BTreeSet::new();
    };

    let Ok(failures) = test.deterministic_failures(phase) else {
        return BTreeSet::new();
    };
    let not_run = test.not_run_tests(phase);
    let ignored = test.without_patch_failures_to_ignore().unwrap_or_default();
    failures
        .into_iter()
        .filter(|t| !not_run.contains(t) && !ignored.contains(t))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Invocation, RawTestResult, SuiteResult, TestSpec, TestStatus, Venue};

    fn suite(results: &[(&str, TestStatus)]) -> SuiteResult {
        let invocations = vec![Invocation {
            name: "invocations/1".to_string(),
            test_results: results
                .iter()
                .map(|(t, status)| RawTestResult {
                    test_id: format!("ninja://:browser_tests/{t}"),
                    variant_hash: "hash".to_string(),
                    variant: BTreeMap::new(),
                    status: *status,
                    expected: false,
                    duration_ms: None,
                    failure_reason: None,
                    tags: vec![],
                })
                .collect(),
        }];
        SuiteResult::create(&invocations, "browser_tests", Some("ninja://:browser_tests/"), None, false)
            .expect("create")
    }

    #[test]
    fn test_report_sections() {
        let mut run = TestRun::new(TestSpec::new("browser_tests", Venue::Remote));
        run.record_results(
            Phase::WithPatch,
            suite(&[
                ("Flaky.a", TestStatus::Fail),
                ("Known.b", TestStatus::Fail),
                ("Broken.c", TestStatus::Fail),
                ("NotRun.d", TestStatus::Skip),
            ]),
        )
        .expect("record");
        run.record_results(
            Phase::RetryShardsWithPatch,
            suite(&[("Flaky.a", TestStatus::Pass), ("Broken.c", TestStatus::Fail)]),
        )
        .expect("record");
        run.add_known_flaky_failure("Known.b", Some("42".to_string()));

        let report = FlakinessReport::collect([&run]).expect("report");
        let step = "browser_tests (with patch)".to_string();
        assert_eq!(report.step_layer_flakiness[&step], vec!["Flaky.a".to_string()]);
        assert_eq!(report.step_layer_skipped_known_flakiness[&step], vec!["Known.b".to_string()]);
        assert_eq!(report.failing_with_patch[&step], vec!["Broken.c".to_string()]);

        let metadata = report.to_step();
        assert_eq!(metadata.name, "FindIt Flakiness");
        assert!(metadata.logs["step_metadata"]
            .iter()
            .any(|l| l.contains("\"Step Layer Flakiness\"")));
    }

    #[test]
    fn test_no_report_without_failures() {
        let mut run = TestRun::new(TestSpec::new("browser_tests", Venue::Remote));
        run.record_results(Phase::WithPatch, suite(&[("Ok.a", TestStatus::Pass)]))
            .expect("record");
        assert!(FlakinessReport::collect([&run]).is_none());
    }
}
