//! One test suite and everything it accumulates across the phases of a build.
//!
//! A [`TestRun`] is venue-agnostic from the engine's point of view: the
//! engine asks it to dispatch (`pre_run`) and collect (`run`) a phase, then
//! reads the classification queries. Venue differences are handled by
//! matching on [`Venue`] inside dispatch and collection.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{debug, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{
    LabRequest, LabResponse, LocalRunRequest, PerTestResult, Phase, StepStatus, StepSummary, SuiteResult,
    TaskHandle, TaskRequest, TestOptions, TestSelection, TestSpec, Venue,
};
use crate::services::context::BuildContext;

/// How often each retried test is repeated to surface flakiness.
pub const REPEAT_COUNT_FOR_FAILING_TESTS: u32 = 10;

/// Separator between test names in a test filter argument.
const FILTER_DELIMITER: &str = ":";

/// Work recorded by `pre_run`, consumed by `run`.
#[derive(Debug, Clone)]
enum Dispatched {
    /// Experimental suite that is not part of this build's sample.
    Skipped,
    Local(LocalRunRequest),
    Remote(TaskHandle),
    Lab(LabRequest),
}

/// Result of collecting one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunOutcome {
    pub failure_on_exit: bool,
    /// Nothing ran because the suite is an experiment not in effect.
    pub skipped: bool,
}

/// Stateful runner of one suite.
#[derive(Debug, Clone)]
pub struct TestRun {
    spec: TestSpec,
    results: BTreeMap<Phase, SuiteResult>,
    failure_on_exit: BTreeMap<Phase, bool>,
    dispatched: BTreeMap<Phase, Dispatched>,
    collected: BTreeSet<Phase>,
    failed_shards: BTreeMap<Phase, Vec<u32>>,
    invocation_names: BTreeMap<Phase, Vec<String>>,
    lab_responses: BTreeMap<Phase, LabResponse>,
    /// Known flaky test name, with the tracking bug when one is known.
    known_flaky_failures: BTreeMap<String, Option<String>>,
    weakly_flaky_failures: BTreeSet<String>,
}

impl TestRun {
    pub fn new(spec: TestSpec) -> Self {
        Self {
            spec,
            results: BTreeMap::new(),
            failure_on_exit: BTreeMap::new(),
            dispatched: BTreeMap::new(),
            collected: BTreeSet::new(),
            failed_shards: BTreeMap::new(),
            invocation_names: BTreeMap::new(),
            lab_responses: BTreeMap::new(),
            known_flaky_failures: BTreeMap::new(),
            weakly_flaky_failures: BTreeSet::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub const fn spec(&self) -> &TestSpec {
        &self.spec
    }

    pub const fn venue(&self) -> Venue {
        self.spec.venue
    }

    pub fn target(&self) -> &str {
        if self.spec.target.is_empty() {
            &self.spec.name
        } else {
            &self.spec.target
        }
    }

    pub fn compile_targets(&self) -> Vec<String> {
        vec![self.target().to_string()]
    }

    pub fn step_name(&self, phase: Phase) -> String {
        format!("{} ({})", self.spec.name, phase)
    }

    /// Whether the suite takes part in this build at all.
    pub fn is_enabled(&self, ctx: &BuildContext) -> bool {
        self.spec
            .experiment
            .map_or(true, |policy| policy.is_in_experiment(&ctx.experiment_key(), &self.spec.name))
    }

    // ------------------------------------------------------------------
    // Dispatch and collection
    // ------------------------------------------------------------------

    /// Dispatch `phase` without waiting for it to complete.
    pub async fn pre_run(&mut self, ctx: &BuildContext, phase: Phase) -> DomainResult<()> {
        if self.dispatched.contains_key(&phase) {
            return Err(DomainError::Precondition(format!(
                "{} was already dispatched",
                self.step_name(phase)
            )));
        }

        if !self.is_enabled(ctx) {
            debug!(suite = %self.spec.name, %phase, "experiment not in effect, skipping");
            self.dispatched.insert(phase, Dispatched::Skipped);
            return Ok(());
        }

        let dispatched = match self.dispatch(ctx, phase).await {
            Ok(dispatched) => dispatched,
            Err(e) if self.spec.is_experimental() && !matches!(e, DomainError::Precondition(_)) => {
                warn!(suite = %self.spec.name, %phase, error = %e, "experimental dispatch failed, ignoring");
                Dispatched::Skipped
            }
            Err(e) => return Err(e),
        };

        if let Dispatched::Remote(handle) = &dispatched {
            self.invocation_names
                .insert(phase, handle.invocation_names.clone());
        }
        self.dispatched.insert(phase, dispatched);
        Ok(())
    }

    async fn dispatch(&self, ctx: &BuildContext, phase: Phase) -> DomainResult<Dispatched> {
        match self.spec.venue {
            Venue::Local => Ok(Dispatched::Local(LocalRunRequest {
                suite: self.spec.name.clone(),
                step_name: self.step_name(phase),
                target: self.target().to_string(),
                args: self.command_args(ctx, phase).0,
            })),
            Venue::Remote => {
                let artifact = self.artifact(ctx, phase).await?;
                let request = self.task_request(ctx, phase, artifact).await?;
                debug!(
                    suite = %self.spec.name,
                    %phase,
                    shards = request.shards,
                    shard_indices = ?request.shard_indices,
                    "submitting remote task"
                );
                let handle = ctx.services.remote.submit(request).await?;
                Ok(Dispatched::Remote(handle))
            }
            Venue::Lab => {
                let artifact = self.artifact(ctx, phase).await?;
                Ok(Dispatched::Lab(LabRequest {
                    suite: self.spec.name.clone(),
                    step_name: self.step_name(phase),
                    artifact,
                    timeout_secs: self
                        .spec
                        .lab_timeout_secs
                        .unwrap_or(ctx.config.lab.default_timeout_secs),
                    args: self.command_args(ctx, phase).0,
                }))
            }
        }
    }

    async fn artifact(&self, ctx: &BuildContext, phase: Phase) -> DomainResult<String> {
        ctx.artifact(self.target(), phase)
            .await
            .ok_or_else(|| DomainError::Dispatch {
                suite: self.spec.name.clone(),
                reason: format!(
                    "no build output for target '{}' ({})",
                    self.target(),
                    if phase.is_patched() { "with patch" } else { "without patch" }
                ),
            })
    }

    /// Arguments for `phase` and the shard count to run with.
    fn command_args(&self, ctx: &BuildContext, phase: Phase) -> (Vec<String>, u32) {
        let mut options = self.spec.options.clone();
        let mut shards = self.spec.shards;
        let mut force_independent_tests = false;
        let tests_to_retry = self.tests_to_retry(phase).filter(|tests| !tests.is_empty());

        if let Some(tests) = &tests_to_retry {
            if phase == Phase::WithoutPatch
                && tests.len() <= ctx.config.retry.small_retry_threshold
                && options.repeat_count.is_none()
            {
                options.repeat_count = Some(REPEAT_COUNT_FOR_FAILING_TESTS);
                options.retry_limit = Some(0);
                force_independent_tests = true;
            }

            let filter_len: usize = tests.iter().map(|t| t.len() + FILTER_DELIMITER.len()).sum();
            if filter_len < self.spec.test_filter_char_limit() {
                options.test_filter.clone_from(tests);
                match self.shards_to_retry_with(shards, tests.len()) {
                    Ok(n) => shards = n,
                    Err(e) => warn!(suite = %self.spec.name, error = %e, "keeping original shard count"),
                }
            } else {
                debug!(suite = %self.spec.name, filter_len, "test filter too long, running whole suite");
            }
        }

        let mut args = self.spec.args.clone();
        for (flag, value) in option_args(&options, force_independent_tests) {
            merge_arg(&mut args, flag, value);
        }
        if let Some(filter_file) = selection_filter_file(self.spec.selection, self.target()) {
            merge_arg(&mut args, "--test-launcher-filter-file", Some(filter_file));
        }
        (args, shards)
    }

    async fn task_request(
        &self,
        ctx: &BuildContext,
        phase: Phase,
        artifact: String,
    ) -> DomainResult<TaskRequest> {
        let (extra_args, shards) = self.command_args(ctx, phase);

        let (shard_indices, idempotent) = if phase.is_retry_shards() {
            let failed = self.failed_shards.get(&phase.base()).cloned().unwrap_or_default();
            if failed.is_empty() {
                let base_step = self.step_name(phase.base());
                warn!(suite = %self.spec.name, %phase, "no failed shards to retry, running every shard");
                ctx.record_step(StepSummary::new(
                    "missing failed shards",
                    StepStatus::Failure,
                    format!(
                        "Retry shards is being run on {base_step}, which has no failed shards. \
                         The test runner reported test failures but exited with code 0."
                    ),
                ))
                .await;
                ((0..shards).collect(), false)
            } else {
                (failed, false)
            }
        } else {
            ((0..shards).collect(), true)
        };

        let mut tags = BTreeMap::from([
            ("test_suite".to_string(), self.spec.name.clone()),
            ("ninja_target".to_string(), self.target().to_string()),
        ]);
        if let Some(prefix) = &self.spec.test_id_prefix {
            tags.insert("test_id_prefix".to_string(), prefix.clone());
        }

        Ok(TaskRequest {
            name: self.step_name(phase),
            suite: self.spec.name.clone(),
            artifact,
            shards,
            shard_indices,
            extra_args,
            dimensions: self.spec.dimensions.clone(),
            timeouts: self.spec.timeouts,
            tags,
            idempotent,
        })
    }

    /// Work the lab group needs to batch for `phase`.
    pub fn lab_request(&self, phase: Phase) -> Option<&LabRequest> {
        match self.dispatched.get(&phase) {
            Some(Dispatched::Lab(request)) => Some(request),
            _ => None,
        }
    }

    pub fn task_handle(&self, phase: Phase) -> Option<&TaskHandle> {
        match self.dispatched.get(&phase) {
            Some(Dispatched::Remote(handle)) => Some(handle),
            _ => None,
        }
    }

    pub fn set_lab_response(&mut self, phase: Phase, response: LabResponse) {
        self.invocation_names
            .insert(phase, response.invocation_names.clone());
        self.lab_responses.insert(phase, response);
    }

    /// Block until the work dispatched for `phase` completes.
    ///
    /// State is recorded before a failing harness is reported as
    /// [`DomainError::TestStepFailed`].
    pub async fn run(&mut self, ctx: &BuildContext, phase: Phase) -> DomainResult<RunOutcome> {
        if self.collected.contains(&phase) {
            return Err(DomainError::Precondition(format!(
                "{} was already run",
                self.step_name(phase)
            )));
        }
        let dispatched = self.dispatched.get(&phase).cloned().ok_or_else(|| {
            DomainError::Precondition(format!("{} was never dispatched", self.step_name(phase)))
        })?;

        let failure_on_exit = match dispatched {
            Dispatched::Skipped => {
                self.collected.insert(phase);
                return Ok(RunOutcome {
                    failure_on_exit: false,
                    skipped: true,
                });
            }
            Dispatched::Local(request) => {
                let outcome = ctx.services.local.run(request).await?;
                self.invocation_names.insert(phase, outcome.invocation_names);
                outcome.exit_code != 0
            }
            Dispatched::Remote(handle) => {
                let collected = ctx.services.remote.collect(&handle).await?;
                self.failed_shards.insert(phase, collected.failed_shards());
                if !collected.invocation_names.is_empty() {
                    self.invocation_names.insert(phase, collected.invocation_names.clone());
                }
                collected.failure_on_exit()
            }
            Dispatched::Lab(_) => match self.lab_responses.get(&phase) {
                Some(response) => !response.passed,
                None => {
                    warn!(suite = %self.spec.name, %phase, "lab returned no response");
                    true
                }
            },
        };

        self.record_failure_on_exit(phase, failure_on_exit);
        self.collected.insert(phase);

        if failure_on_exit && !self.spec.is_experimental() {
            return Err(DomainError::TestStepFailed {
                suite: self.step_name(phase),
            });
        }
        Ok(RunOutcome {
            failure_on_exit,
            skipped: false,
        })
    }

    fn record_failure_on_exit(&mut self, phase: Phase, failure_on_exit: bool) {
        self.failure_on_exit.insert(phase, failure_on_exit);
        if let Some(result) = self.results.get(&phase) {
            let patched = result.with_failure_on_exit(failure_on_exit);
            self.results.insert(phase, patched);
        }
    }

    pub fn failure_on_exit(&self, phase: Phase) -> bool {
        self.failure_on_exit.get(&phase).copied().unwrap_or(false)
    }

    pub fn was_dispatched(&self, phase: Phase) -> bool {
        matches!(
            self.dispatched.get(&phase),
            Some(Dispatched::Local(_) | Dispatched::Remote(_) | Dispatched::Lab(_))
        )
    }

    pub fn invocation_names(&self, phase: Phase) -> &[String] {
        self.invocation_names.get(&phase).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn set_invocation_names(&mut self, phase: Phase, names: Vec<String>) {
        self.invocation_names.insert(phase, names);
    }

    /// Store the results fetched for `phase`, with the exit flag known so far.
    pub fn record_results(&mut self, phase: Phase, result: SuiteResult) -> DomainResult<()> {
        if self.results.contains_key(&phase) {
            return Err(DomainError::Precondition(format!(
                "results for {} were already recorded",
                self.step_name(phase)
            )));
        }
        let result = match self.failure_on_exit.get(&phase) {
            Some(failed) => result.with_failure_on_exit(*failed),
            None => result,
        };
        self.results.insert(phase, result);
        Ok(())
    }

    pub fn suite_result(&self, phase: Phase) -> Option<&SuiteResult> {
        self.results.get(&phase)
    }

    // ------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------

    /// Experimental suites never have invalid results.
    pub fn has_valid_results(&self, phase: Phase) -> bool {
        if self.spec.is_experimental() {
            return true;
        }
        self.results.get(&phase).is_some_and(|r| !r.invalid())
    }

    /// Tests that failed every run of `phase`.
    pub fn deterministic_failures(&self, phase: Phase) -> DomainResult<BTreeSet<String>> {
        if !self.has_valid_results(phase) {
            return Err(DomainError::Precondition(format!(
                "{} has no valid results",
                self.step_name(phase)
            )));
        }
        if self.spec.is_experimental() {
            return Ok(BTreeSet::new());
        }
        Ok(self
            .results
            .get(&phase)
            .map(|r| r.unexpected_failing_tests().clone())
            .unwrap_or_default())
    }

    /// Failures of `phase` that the retry shards did not clear.
    ///
    /// `None` when neither `phase` nor its retry produced valid results.
    pub fn failures_including_retry(&self, phase: Phase) -> Option<BTreeSet<String>> {
        let phase = phase.base();
        let retry = phase.retry_shards();

        let original = self.deterministic_failures(phase).ok();
        let retried = if self.results.contains_key(&retry) || self.spec.is_experimental() {
            self.deterministic_failures(retry).ok()
        } else {
            None
        };

        let failures = match (original, retried) {
            (Some(original), Some(retried)) => original.intersection(&retried).cloned().collect(),
            (Some(failures), None) | (None, Some(failures)) => failures,
            (None, None) => return None,
        };
        Some(
            failures
                .into_iter()
                .filter(|name| !self.known_flaky_failures.contains_key(name))
                .collect(),
        )
    }

    /// Shard count for re-running `num_tests_to_retry` tests.
    ///
    /// Scales the original count by the share of tests being retried times
    /// the repeat count, but never below one, above the original count, or
    /// above the number of tests.
    pub fn shards_to_retry_with(&self, original_shards: u32, num_tests_to_retry: usize) -> DomainResult<u32> {
        let total_tests_ran = [Phase::WithPatch, Phase::RetryShardsWithPatch]
            .iter()
            .filter_map(|p| self.results.get(p))
            .map(SuiteResult::total_tests_ran)
            .max()
            .unwrap_or(0);
        if total_tests_ran == 0 {
            return Err(DomainError::Precondition(format!(
                "{} cannot be retried as no tests ran",
                self.spec.name
            )));
        }
        Ok(retry_shard_count(original_shards, num_tests_to_retry, total_tests_ran))
    }

    /// Tests to run in `phase`; `None` means the whole suite.
    pub fn tests_to_retry(&self, phase: Phase) -> Option<Vec<String>> {
        if phase.is_patched() {
            return None;
        }
        self.failures_including_retry(Phase::WithPatch)
            .map(|failures| failures.into_iter().collect())
    }

    /// Tests that also fail at tip of tree and can be ignored.
    ///
    /// A test is only ignored when it was either not run in both phases or
    /// actually ran in both; a change of failure mode is suspicious.
    pub fn without_patch_failures_to_ignore(&self) -> Option<BTreeSet<String>> {
        if !self.has_valid_results(Phase::WithoutPatch) {
            return None;
        }
        let Some(without_patch) = self.results.get(&Phase::WithoutPatch) else {
            return Some(BTreeSet::new());
        };

        let ignored = without_patch
            .all_tests()
            .iter()
            .filter(|t| t.unexpected_unpassed_count() > 0)
            .filter(|t| {
                self.with_patch_record(t.test_name())
                    .map_or(true, |with_patch| with_patch.is_not_run() == t.is_not_run())
            })
            .map(|t| t.test_name().to_string())
            .collect();
        Some(ignored)
    }

    fn with_patch_record(&self, test_name: &str) -> Option<&PerTestResult> {
        [Phase::RetryShardsWithPatch, Phase::WithPatch]
            .iter()
            .filter_map(|p| self.results.get(p))
            .find_map(|r| r.unexpected_test(test_name))
    }

    pub fn not_run_tests(&self, phase: Phase) -> BTreeSet<String> {
        if !self.has_valid_results(phase) {
            return BTreeSet::new();
        }
        self.results
            .get(&phase)
            .map(SuiteResult::not_run_tests)
            .unwrap_or_default()
    }

    /// `(passing, failing)` tests of the shard retry, when it is valid.
    pub fn shard_retry_with_patch_results(&self) -> Option<(BTreeSet<String>, BTreeSet<String>)> {
        if !self.has_valid_results(Phase::RetryShardsWithPatch) {
            return None;
        }
        self.results
            .get(&Phase::RetryShardsWithPatch)
            .map(SuiteResult::passing_and_failing_tests)
    }

    pub fn has_failures_to_summarize(&self) -> bool {
        self.failures_including_retry(Phase::WithPatch)
            .is_some_and(|f| !f.is_empty())
            || !self.known_flaky_failures.is_empty()
    }

    // ------------------------------------------------------------------
    // Flakiness
    // ------------------------------------------------------------------

    /// Mark a test as known flaky; a tracking bug, once known, is kept.
    pub fn add_known_flaky_failure(&mut self, test_name: impl Into<String>, issue: Option<String>) {
        let known = self.known_flaky_failures.entry(test_name.into()).or_insert(None);
        if issue.is_some() {
            *known = issue;
        }
    }

    pub fn add_weakly_flaky_failure(&mut self, test_name: impl Into<String>) {
        self.weakly_flaky_failures.insert(test_name.into());
    }

    pub fn known_flaky_failures(&self) -> BTreeSet<String> {
        self.known_flaky_failures.keys().cloned().collect()
    }

    pub const fn weakly_flaky_failures(&self) -> &BTreeSet<String> {
        &self.weakly_flaky_failures
    }

    /// Known flaky tests with their tracking bug, sorted by name.
    pub fn known_flaky_summary(&self) -> Vec<String> {
        self.known_flaky_failures
            .iter()
            .map(|(name, issue)| match issue {
                Some(issue) => format!("{name}: crbug.com/{issue}"),
                None => name.clone(),
            })
            .collect()
    }
}

/// Retry shard count, `clamp(original * repeat * retried / total, 1, original, retried)`.
pub fn retry_shard_count(original_shards: u32, num_tests_to_retry: usize, total_tests_ran: usize) -> u32 {
    if total_tests_ran == 0 {
        return 1;
    }
    let scaled = u64::from(original_shards) * u64::from(REPEAT_COUNT_FOR_FAILING_TESTS)
        * num_tests_to_retry as u64
        / total_tests_ran as u64;
    let bounded = scaled
        .max(1)
        .min(u64::from(original_shards))
        .min(num_tests_to_retry as u64);
    u32::try_from(bounded).unwrap_or(original_shards).max(1)
}

fn option_args(options: &TestOptions, force_independent_tests: bool) -> Vec<(&'static str, Option<String>)> {
    let mut args = Vec::new();
    if let Some(repeat) = options.repeat_count {
        args.push(("--gtest_repeat", Some(repeat.to_string())));
    }
    if let Some(limit) = options.retry_limit {
        args.push(("--test-launcher-retry-limit", Some(limit.to_string())));
    }
    if options.run_disabled {
        args.push(("--gtest_also_run_disabled_tests", None));
    }
    if !options.test_filter.is_empty() {
        args.push(("--gtest_filter", Some(options.test_filter.join(FILTER_DELIMITER))));
    }
    if force_independent_tests {
        args.push(("--test-launcher-batch-limit", Some("1".to_string())));
    }
    args
}

fn selection_filter_file(selection: TestSelection, target: &str) -> Option<String> {
    match selection {
        TestSelection::Full => None,
        TestSelection::Rts => Some(format!("../../testing/rts/{target}.filter")),
        TestSelection::InvertedRts => Some(format!("../../testing/rts/inverted/{target}.filter")),
    }
}

/// Replace any occurrence of `flag` in `args` with the new value.
fn merge_arg(args: &mut Vec<String>, flag: &str, value: Option<String>) {
    args.retain(|a| a != flag && !a.starts_with(&format!("{flag}=")));
    match value {
        Some(value) => args.push(format!("{flag}={value}")),
        None => args.push(flag.to_string()),
    }
}
