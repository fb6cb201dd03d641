//! Top-level reconciliation of a try job.
//!
//! [`TryjobReconciler`] runs every suite with the change applied, retries
//! failed shards, and reruns what still fails without the change before
//! deciding which failures the change is to blame for.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    BuildStatus, BuilderConfig, Phase, RawResult, StepStatus, StepSummary, TestSpec, TryjobFlags,
};
use crate::services::context::{BuildContext, CQ_DEPEND_FOOTER};
use crate::services::flakiness_report::FlakinessReport;
use crate::services::retry_engine::{run_tests, run_tests_with_patch, RetryOptions};
use crate::services::summary::{
    format_unrecoverable_failures, summarize_failing_test_with_no_retries,
    summarize_test_with_patch_deapplied,
};
use crate::services::test_run::TestRun;

pub const CQ_DEPEND_MESSAGE: &str = "Commit message footer Cq-Depends is not supported on Chrome builders. \
     Please remove the line(s) from the commit message and try again.";

/// What happened to one suite over the build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuiteOverview {
    pub name: String,
    pub venue: String,
    /// Phases that produced results, in execution order.
    pub phases: Vec<String>,
    /// Failures with the change that survived the shard retry.
    pub failures: Vec<String>,
    pub known_flaky: Vec<String>,
    pub unrecoverable: bool,
}

/// Everything the host needs once the try job is reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub raw_result: RawResult,
    pub flags: TryjobFlags,
    pub steps: Vec<StepSummary>,
    pub suites: Vec<SuiteOverview>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flakiness: Option<FlakinessReport>,
}

/// Suites the change is blamed for, or the build verdict that ended the
/// test phases early.
enum PhasesOutcome {
    Finished { unrecoverable: Vec<String> },
    Stopped(RawResult),
}

pub struct TryjobReconciler {
    ctx: BuildContext,
    builder_config: BuilderConfig,
}

impl TryjobReconciler {
    pub const fn new(ctx: BuildContext, builder_config: BuilderConfig) -> Self {
        Self { ctx, builder_config }
    }

    pub const fn context(&self) -> &BuildContext {
        &self.ctx
    }

    /// Run `specs` with the change, and without it where needed, and return
    /// the verdict.
    ///
    /// Infrastructure errors are returned as `Err`; every test-level outcome
    /// ends up in the report.
    #[instrument(skip(self, specs), fields(builder = %self.ctx.identity.builder, suites = specs.len()))]
    pub async fn run_tests_with_and_without_changes(
        &self,
        specs: Vec<TestSpec>,
    ) -> DomainResult<ReconciliationReport> {
        let mut tests: Vec<TestRun> = specs.into_iter().map(TestRun::new).collect();
        tests.sort_by(|a, b| a.name().cmp(b.name()));

        let (raw_result, unrecoverable) = match self.reconcile(&mut tests).await {
            Ok(PhasesOutcome::Stopped(result)) => (result, Vec::new()),
            Ok(PhasesOutcome::Finished { unrecoverable }) => {
                let result = self.verdict(&tests, &unrecoverable).await;
                (result, unrecoverable)
            }
            Err(DomainError::TestStepFailed { suite }) => {
                warn!(%suite, "suite aborted the build");
                self.ctx.update_flags(|flags| flags.test_failure = true).await;
                (RawResult::failure(format!("**{suite}** failed.")), vec![suite])
            }
            Err(e) => return Err(e),
        };

        let flakiness = FlakinessReport::collect(&tests);
        if let Some(report) = &flakiness {
            self.ctx.record_step(report.to_step()).await;
        }

        info!(status = raw_result.status.as_str(), "try job reconciled");
        Ok(ReconciliationReport {
            raw_result,
            flags: self.ctx.flags().await,
            steps: self.ctx.steps().await,
            suites: tests.iter().map(|t| overview(t, &unrecoverable)).collect(),
            flakiness,
        })
    }

    async fn reconcile(&self, tests: &mut [TestRun]) -> DomainResult<PhasesOutcome> {
        if self.ctx.is_tryserver && !self.ctx.footer(CQ_DEPEND_FOOTER).is_empty() {
            warn!("change depends on another repository");
            return Ok(PhasesOutcome::Stopped(RawResult::failure(CQ_DEPEND_MESSAGE)));
        }

        let targets = compile_targets(tests.iter());
        if let Some(failure) = self.compile(&targets, Phase::WithPatch).await? {
            return Ok(PhasesOutcome::Stopped(failure));
        }

        self.run_tests_with_retries(tests).await
    }

    /// Compile `targets` for `phase`, returning the verdict when it failed.
    async fn compile(&self, targets: &[String], phase: Phase) -> DomainResult<Option<RawResult>> {
        let outcome = self.ctx.services.build.compile(targets, phase).await?;
        if outcome.status != BuildStatus::Success {
            warn!(%phase, status = outcome.status.as_str(), "compile failed");
            self.ctx.update_flags(|flags| flags.compile_failure = true).await;
            return Ok(Some(outcome.into_raw_result()));
        }
        self.ctx.record_artifacts(phase, outcome.artifacts).await;
        Ok(None)
    }

    async fn run_tests_with_retries(&self, tests: &mut [TestRun]) -> DomainResult<PhasesOutcome> {
        let with_patch =
            run_tests_with_patch(&self.ctx, tests, self.builder_config.retry_failed_shards).await?;

        if !with_patch.invalid.is_empty() || with_patch.failed.is_empty() {
            self.summarize_test_failures(tests, &BTreeSet::new()).await;
            return Ok(PhasesOutcome::Finished {
                unrecoverable: with_patch.invalid,
            });
        }

        if self.should_skip_without_patch().await? {
            self.summarize_test_failures(tests, &BTreeSet::new()).await;
            return Ok(PhasesOutcome::Finished {
                unrecoverable: with_patch.failed,
            });
        }

        info!(suites = ?with_patch.failed, "rerunning failing suites without the change");
        self.ctx.services.checkout.deapply_patch().await?;

        let failing: BTreeSet<String> = with_patch.failed.iter().cloned().collect();
        let targets = compile_targets(tests.iter().filter(|t| failing.contains(t.name())));
        if let Some(failure) = self.compile(&targets, Phase::WithoutPatch).await? {
            // A broken incremental build at tip of tree is usually stale output.
            self.ctx.services.build.clobber().await?;
            self.ctx.update_flags(|flags| flags.clobber_requested = true).await;
            return Ok(PhasesOutcome::Stopped(failure));
        }

        let options = RetryOptions {
            sort_by_shard: true,
            ..RetryOptions::default()
        };
        run_tests(&self.ctx, tests, &with_patch.failed, Phase::WithoutPatch, options).await?;

        let unrecoverable = self.summarize_test_failures(tests, &failing).await;
        Ok(PhasesOutcome::Finished { unrecoverable })
    }

    /// Record a summary for every suite with something to report and return
    /// the suites with failures the change is to blame for.
    async fn summarize_test_failures(
        &self,
        tests: &[TestRun],
        retried_without_patch: &BTreeSet<String>,
    ) -> Vec<String> {
        let mut culpable = Vec::new();
        for test in tests {
            let clean = if retried_without_patch.contains(test.name()) {
                summarize_test_with_patch_deapplied(&self.ctx, test).await
            } else if test.has_failures_to_summarize() {
                summarize_failing_test_with_no_retries(&self.ctx, test).await
            } else {
                continue;
            };
            if !clean {
                culpable.push(test.name().to_string());
            }
        }
        culpable
    }

    /// Whether rerunning without the change can be skipped.
    ///
    /// Touching a file that defines what this builder tests makes results at
    /// tip of tree meaningless for comparison.
    async fn should_skip_without_patch(&self) -> DomainResult<bool> {
        let affected = self.ctx.affected_files().await?;
        let spec_files = self.builder_config.affected_spec_files(affected);

        let mut reasons = Vec::new();
        if !spec_files.is_empty() {
            reasons.push(format!(
                "test specs that are consumed by the builder are also affected by the CL: {}",
                spec_files.join(", ")
            ));
        }
        if !self.builder_config.retry_without_patch {
            reasons.push("retry without patch is disabled in builder config".to_string());
        }
        if reasons.is_empty() {
            return Ok(false);
        }

        info!(?reasons, "skipping without patch steps");
        let mut step = StepSummary::new(
            "without patch steps are skipped",
            StepStatus::Success,
            reasons
                .iter()
                .map(|r| format!("\n* {r}"))
                .collect::<String>(),
        );
        if !spec_files.is_empty() {
            step.logs.insert(
                "affected_spec_files".to_string(),
                spec_files.iter().map(ToString::to_string).collect(),
            );
        }
        self.ctx.record_step(step).await;
        Ok(true)
    }

    async fn verdict(&self, tests: &[TestRun], unrecoverable: &[String]) -> RawResult {
        if unrecoverable.is_empty() {
            return RawResult::success();
        }

        let failing: Vec<&TestRun> = tests
            .iter()
            .filter(|t| unrecoverable.iter().any(|n| n == t.name()))
            .collect();
        self.handle_invalid_test_suites(&failing).await;
        self.ctx.update_flags(|flags| flags.test_failure = true).await;

        let summary = &self.ctx.config.summary;
        RawResult::failure(format_unrecoverable_failures(
            &failing,
            Phase::WithPatch,
            summary.size_limit,
            summary.failure_limit,
        ))
    }

    /// Failures backed by valid results in every phase are not worth a
    /// commit-queue retry.
    async fn handle_invalid_test_suites(&self, failing: &[&TestRun]) {
        if !self.ctx.is_tryserver {
            return;
        }
        let all_valid = failing.iter().all(|t| {
            (t.has_valid_results(Phase::WithPatch) || t.has_valid_results(Phase::RetryShardsWithPatch))
                && (t.suite_result(Phase::WithoutPatch).is_none()
                    || t.has_valid_results(Phase::WithoutPatch))
        });
        if all_valid {
            info!("every failing suite has valid results, build should not be retried");
            self.ctx.update_flags(|flags| flags.do_not_retry = true).await;
        }
    }
}

fn compile_targets<'a>(tests: impl Iterator<Item = &'a TestRun>) -> Vec<String> {
    tests
        .flat_map(TestRun::compile_targets)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn overview(test: &TestRun, unrecoverable: &[String]) -> SuiteOverview {
    SuiteOverview {
        name: test.name().to_string(),
        venue: test.venue().as_str().to_string(),
        phases: Phase::ALL
            .iter()
            .filter(|p| test.suite_result(**p).is_some())
            .map(ToString::to_string)
            .collect(),
        failures: test
            .failures_including_retry(Phase::WithPatch)
            .unwrap_or_default()
            .into_iter()
            .collect(),
        known_flaky: test.known_flaky_failures().into_iter().collect(),
        unrecoverable: unrecoverable.iter().any(|n| n == test.name()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::{PhaseScript, ScriptedWorld};
    use crate::domain::models::{BuilderSpec, Config, Venue};
    use crate::services::context::BuildIdentity;
    use std::collections::BTreeMap;

    fn identity() -> BuildIdentity {
        BuildIdentity {
            project: "chromium".to_string(),
            bucket: "try".to_string(),
            builder: "linux-rel".to_string(),
            change_number: Some(123_456),
            build_number: Some(7),
        }
    }

    fn reconciler(world: &ScriptedWorld, spec: BuilderSpec) -> TryjobReconciler {
        let config = BuilderConfig::from_specs(&[spec]).expect("builder config");
        TryjobReconciler::new(world.context(identity(), Config::default()), config)
    }

    fn browser_tests() -> TestSpec {
        TestSpec::new("browser_tests", Venue::Remote).with_shards(2)
    }

    async fn script_two_failures(world: &ScriptedWorld, without_patch: &[&str]) {
        world
            .script("browser_tests", Phase::WithPatch, PhaseScript::failing(&[1], &["A.a", "B.b"]))
            .await;
        world
            .script(
                "browser_tests",
                Phase::RetryShardsWithPatch,
                PhaseScript::failing(&[0], &["A.a", "B.b"]),
            )
            .await;
        world
            .script("browser_tests", Phase::WithoutPatch, PhaseScript::failing(&[0], without_patch))
            .await;
    }

    #[tokio::test]
    async fn test_all_passing_succeeds() {
        let world = ScriptedWorld::default();
        world
            .script("browser_tests", Phase::WithPatch, PhaseScript::passing(&["A.a"]))
            .await;
        let reconciler = reconciler(&world, BuilderSpec::new("try/linux-rel"));

        let report = reconciler
            .run_tests_with_and_without_changes(vec![browser_tests()])
            .await
            .expect("reconcile");

        assert!(report.raw_result.is_success());
        assert_eq!(report.flags, TryjobFlags::default());
        assert_eq!(report.suites[0].phases, vec!["with patch".to_string()]);
        assert_eq!(world.checkout.deapply_calls(), 0);
        assert!(report.flakiness.is_none());
    }

    #[tokio::test]
    async fn test_failures_also_failing_without_patch_are_forgiven() {
        let world = ScriptedWorld::default();
        script_two_failures(&world, &["A.a", "B.b"]).await;
        let reconciler = reconciler(&world, BuilderSpec::new("try/linux-rel"));

        let report = reconciler
            .run_tests_with_and_without_changes(vec![browser_tests()])
            .await
            .expect("reconcile");

        assert!(report.raw_result.is_success());
        assert!(!report.flags.test_failure);
        assert_eq!(world.checkout.deapply_calls(), 1);
        let compiles = world.build.compiles().await;
        assert_eq!(compiles[1], (Phase::WithoutPatch, vec!["browser_tests".to_string()]));
        let summary = report
            .steps
            .iter()
            .find(|s| s.name == "browser_tests (test results summary)")
            .expect("summary step");
        assert_eq!(summary.status, StepStatus::Warning);
    }

    #[tokio::test]
    async fn test_new_failure_is_unrecoverable() {
        let world = ScriptedWorld::default();
        script_two_failures(&world, &["A.a"]).await;
        let reconciler = reconciler(&world, BuilderSpec::new("try/linux-rel"));

        let report = reconciler
            .run_tests_with_and_without_changes(vec![browser_tests()])
            .await
            .expect("reconcile");

        assert_eq!(report.raw_result.status, BuildStatus::Failure);
        assert_eq!(
            report.raw_result.summary_markdown,
            "1 Test Suite(s) failed.\n\n**browser_tests** failed because of:\n\n- B.b"
        );
        assert!(report.flags.test_failure);
        assert!(report.flags.do_not_retry);
        assert!(report.suites[0].unrecoverable);
        let flakiness = report.flakiness.expect("flakiness report");
        assert_eq!(
            flakiness.failing_with_patch["browser_tests (with patch)"],
            vec!["B.b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_compile_failure_stops_before_tests() {
        let world = ScriptedWorld::default();
        world.build.fail_compile(Phase::WithPatch).await;
        let reconciler = reconciler(&world, BuilderSpec::new("try/linux-rel"));

        let report = reconciler
            .run_tests_with_and_without_changes(vec![browser_tests()])
            .await
            .expect("reconcile");

        assert_eq!(report.raw_result.status, BuildStatus::Failure);
        assert_eq!(report.raw_result.summary_markdown, "Compile failed (with patch)");
        assert!(report.flags.compile_failure);
        assert!(world.remote.submitted().await.is_empty());
    }

    #[tokio::test]
    async fn test_without_patch_compile_failure_clobbers() {
        let world = ScriptedWorld::default();
        script_two_failures(&world, &["A.a"]).await;
        world.build.fail_compile(Phase::WithoutPatch).await;
        let reconciler = reconciler(&world, BuilderSpec::new("try/linux-rel"));

        let report = reconciler
            .run_tests_with_and_without_changes(vec![browser_tests()])
            .await
            .expect("reconcile");

        assert_eq!(report.raw_result.status, BuildStatus::Failure);
        assert!(report.flags.clobber_requested);
        assert_eq!(world.build.clobbers(), 1);
    }

    #[tokio::test]
    async fn test_cq_depends_rejected() {
        let world = ScriptedWorld::default();
        let config = BuilderConfig::from_specs(&[BuilderSpec::new("try/linux-rel")]).expect("config");
        let ctx = world
            .context(identity(), Config::default())
            .with_footers(BTreeMap::from([(
                CQ_DEPEND_FOOTER.to_string(),
                vec!["chromium:1234".to_string()],
            )]));
        let reconciler = TryjobReconciler::new(ctx, config);

        let report = reconciler
            .run_tests_with_and_without_changes(vec![browser_tests()])
            .await
            .expect("reconcile");

        assert_eq!(report.raw_result, RawResult::failure(CQ_DEPEND_MESSAGE));
        assert!(world.build.compiles().await.is_empty());
    }

    #[tokio::test]
    async fn test_touching_spec_file_skips_without_patch() {
        let world = ScriptedWorld::default();
        script_two_failures(&world, &["A.a", "B.b"]).await;
        world
            .checkout
            .set_affected_files(vec!["testing/buildbot/chromium.linux.json".to_string()])
            .await;
        let mut spec = BuilderSpec::new("try/linux-rel");
        spec.source_side_spec_files = vec!["testing/buildbot/chromium.linux.json".to_string()];
        let reconciler = reconciler(&world, spec);

        let report = reconciler
            .run_tests_with_and_without_changes(vec![browser_tests()])
            .await
            .expect("reconcile");

        assert_eq!(report.raw_result.status, BuildStatus::Failure);
        assert_eq!(world.checkout.deapply_calls(), 0);
        let skipped = report
            .steps
            .iter()
            .find(|s| s.name == "without patch steps are skipped")
            .expect("skip step");
        assert!(skipped.text.contains("chromium.linux.json"));
        assert_eq!(
            skipped.logs["affected_spec_files"],
            vec!["testing/buildbot/chromium.linux.json".to_string()]
        );
    }

    #[tokio::test]
    async fn test_invalid_results_fail_without_rerun() {
        let world = ScriptedWorld::default();
        world.script("browser_tests", Phase::WithPatch, PhaseScript::crashed(&[0])).await;
        world
            .script("browser_tests", Phase::RetryShardsWithPatch, PhaseScript::crashed(&[0]))
            .await;
        let reconciler = reconciler(&world, BuilderSpec::new("try/linux-rel"));

        let report = reconciler
            .run_tests_with_and_without_changes(vec![browser_tests()])
            .await
            .expect("reconcile");

        assert_eq!(report.raw_result.status, BuildStatus::Failure);
        assert!(report.flags.invalid_test_results);
        assert!(!report.flags.do_not_retry);
        assert_eq!(world.checkout.deapply_calls(), 0);
        assert_eq!(
            report.raw_result.summary_markdown,
            "1 Test Suite(s) failed.\n\n**browser_tests** failed."
        );
    }
}
