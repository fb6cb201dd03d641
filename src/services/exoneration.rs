//! Exonerations sent to the result backend.
//!
//! Failures that do not count against the change are reported so the
//! backend keeps a record; nothing in the build reads them back.

use tracing::{debug, info};

use crate::domain::errors::DomainResult;
use crate::domain::models::{Exoneration, Phase, StepStatus, StepSummary, SuiteResult};
use crate::services::context::BuildContext;
use crate::services::test_run::TestRun;

pub const WITHOUT_PATCH_EXPLANATION: &str = "The test failed in both (with patch) and (without patch) steps, \
     so the CL is exonerated for the test failures.";
pub const KNOWN_FLAKE_EXPLANATION: &str = "FindIt reported this test as being flaky.";
pub const EXPERIMENTAL_EXPLANATION: &str =
    "The test belongs to an experimental suite, whose failures never fail the build.";

fn exonerations_for<'a>(
    result: &SuiteResult,
    tests: impl IntoIterator<Item = &'a String>,
    explanation: &str,
) -> Vec<Exoneration> {
    tests
        .into_iter()
        .filter_map(|name| {
            let Some(test_id) = result.find_test_id(name) else {
                debug!(suite = %result.suite_name(), test = %name, "no result to exonerate");
                return None;
            };
            Some(Exoneration {
                test_id: test_id.to_string(),
                variant_hash: result.variant_hash().to_string(),
                explanation_html: explanation.to_string(),
            })
        })
        .collect()
}

/// Exonerations for the failures of `test` in `phase` unrelated to the change.
///
/// Every failure without the change is unrelated, as is every failure of
/// an experimental suite. With the change, only known flakes are.
pub fn unrelated_failures(test: &TestRun, phase: Phase) -> Vec<Exoneration> {
    // Experiments not in effect have no results.
    let Some(result) = test.suite_result(phase) else {
        return Vec::new();
    };

    if phase == Phase::WithoutPatch {
        exonerations_for(result, result.unexpected_failing_tests(), WITHOUT_PATCH_EXPLANATION)
    } else if test.spec().is_experimental() {
        exonerations_for(result, result.unexpected_failing_tests(), EXPERIMENTAL_EXPLANATION)
    } else if phase == Phase::WithPatch {
        let known = test.known_flaky_failures();
        exonerations_for(result, &known, KNOWN_FLAKE_EXPLANATION)
    } else {
        Vec::new()
    }
}

/// Report unrelated failures of `tests` in `phase` to the result backend.
pub async fn exonerate_unrelated_failures<'a>(
    ctx: &BuildContext,
    tests: impl IntoIterator<Item = &'a TestRun>,
    phase: Phase,
) -> DomainResult<usize> {
    let exonerations: Vec<Exoneration> = tests
        .into_iter()
        .flat_map(|t| unrelated_failures(t, phase))
        .collect();
    if exonerations.is_empty() {
        return Ok(0);
    }
    if !ctx.services.results.enabled() {
        debug!(count = exonerations.len(), %phase, "result backend disabled, not exonerating");
        return Ok(0);
    }

    let count = exonerations.len();
    info!(count, %phase, "exonerating unrelated test failures");
    let mut step = StepSummary::new(
        "exonerate unrelated test failures",
        StepStatus::Success,
        format!("{count} test failure(s) exonerated"),
    );
    step.logs.insert(
        "exonerations".to_string(),
        exonerations
            .iter()
            .map(|e| format!("{} ({})", e.test_id, e.variant_hash))
            .collect(),
    );
    ctx.services.results.exonerate(exonerations).await?;
    ctx.record_step(step).await;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::ScriptedWorld;
    use crate::domain::models::{Config, Invocation, RawTestResult, TestSpec, TestStatus, Venue};
    use crate::services::context::BuildIdentity;
    use std::collections::BTreeMap;

    fn run_with(spec: TestSpec, phase: Phase, failures: &[&str]) -> TestRun {
        let name = spec.name.clone();
        let results = failures
            .iter()
            .map(|t| RawTestResult {
                test_id: format!("ninja://:{name}/{t}"),
                variant_hash: "hash".to_string(),
                variant: BTreeMap::new(),
                status: TestStatus::Fail,
                expected: false,
                duration_ms: None,
                failure_reason: None,
                tags: vec![],
            })
            .collect();
        let invocations = vec![Invocation {
            name: "invocations/1".to_string(),
            test_results: results,
        }];
        let prefix = format!("ninja://:{name}/");
        let mut run = TestRun::new(spec);
        run.record_results(
            phase,
            SuiteResult::create(&invocations, &name, Some(prefix.as_str()), None, true).expect("create"),
        )
        .expect("record");
        run
    }

    #[test]
    fn test_without_patch_exonerates_every_failure() {
        let run = run_with(
            TestSpec::new("browser_tests", Venue::Remote),
            Phase::WithoutPatch,
            &["A.a", "B.b"],
        );
        let exonerations = unrelated_failures(&run, Phase::WithoutPatch);
        assert_eq!(exonerations.len(), 2);
        assert_eq!(exonerations[0].test_id, "ninja://:browser_tests/A.a");
        assert_eq!(exonerations[0].variant_hash, "hash");
        assert_eq!(exonerations[0].explanation_html, WITHOUT_PATCH_EXPLANATION);
    }

    #[test]
    fn test_with_patch_exonerates_known_flakes_only() {
        let mut run = run_with(
            TestSpec::new("browser_tests", Venue::Remote),
            Phase::WithPatch,
            &["A.a", "B.b"],
        );
        assert!(unrelated_failures(&run, Phase::WithPatch).is_empty());
        run.add_known_flaky_failure("B.b", None);
        let exonerations = unrelated_failures(&run, Phase::WithPatch);
        assert_eq!(exonerations.len(), 1);
        assert_eq!(exonerations[0].test_id, "ninja://:browser_tests/B.b");
        assert_eq!(exonerations[0].explanation_html, KNOWN_FLAKE_EXPLANATION);
        assert!(unrelated_failures(&run, Phase::RetryShardsWithPatch).is_empty());
    }

    #[test]
    fn test_known_flake_without_result_is_not_exonerated() {
        let mut run = run_with(
            TestSpec::new("browser_tests", Venue::Remote),
            Phase::WithPatch,
            &["A.a"],
        );
        run.add_known_flaky_failure("A.a", None);
        run.add_known_flaky_failure("Elsewhere.z", Some("123".to_string()));

        let exonerations = unrelated_failures(&run, Phase::WithPatch);
        assert_eq!(exonerations.len(), 1);
        assert_eq!(exonerations[0].test_id, "ninja://:browser_tests/A.a");
    }

    #[test]
    fn test_experimental_failures_are_exonerated() {
        let run = run_with(
            TestSpec::new("browser_tests", Venue::Remote).with_experiment(100),
            Phase::WithPatch,
            &["A.a"],
        );
        let exonerations = unrelated_failures(&run, Phase::WithPatch);
        assert_eq!(exonerations.len(), 1);
        assert_eq!(exonerations[0].explanation_html, EXPERIMENTAL_EXPLANATION);
    }

    #[tokio::test]
    async fn test_exonerations_reach_backend() {
        let world = ScriptedWorld::default();
        let ctx = world.context(BuildIdentity::default(), Config::default());
        let run = run_with(TestSpec::new("browser_tests", Venue::Remote), Phase::WithoutPatch, &["A.a"]);

        let count = exonerate_unrelated_failures(&ctx, [&run], Phase::WithoutPatch)
            .await
            .expect("exonerate");
        assert_eq!(count, 1);
        assert_eq!(world.results.exonerations().await.len(), 1);

        world.results.set_enabled(false);
        let count = exonerate_unrelated_failures(&ctx, [&run], Phase::WithoutPatch)
            .await
            .expect("exonerate");
        assert_eq!(count, 0);
    }
}
