//! Venue-scoped dispatch and collection of test runs.
//!
//! Each group borrows its test runs from the engine for one dispatch and
//! collect cycle. Local runs go one after another, remote runs are all
//! submitted up front and collected as their task sets finish, and lab runs
//! are submitted as a single batch.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{LabRequest, Phase, StepStatus, StepSummary, SuiteResult, Venue};
use crate::services::context::BuildContext;
use crate::services::test_run::TestRun;

/// Decide whether a failure of `test` stops the rest of its group.
///
/// Only a failing test step is ever tolerated, and only for suites that do
/// not abort on failure.
fn handle_step_result(test: &TestRun, result: DomainResult<()>, raise_on_failure: bool) -> DomainResult<()> {
    match result {
        Err(DomainError::TestStepFailed { suite }) => {
            if raise_on_failure && test.spec().abort_on_failure {
                warn!(step = %suite, "step failed and aborts its group");
                Err(DomainError::TestStepFailed { suite })
            } else {
                debug!(step = %suite, "step failed");
                Ok(())
            }
        }
        other => other,
    }
}

/// Query the result backend for `test`'s results in `phase` and store them.
pub async fn fetch_results(ctx: &BuildContext, test: &mut TestRun, phase: Phase) -> DomainResult<()> {
    if !test.is_enabled(ctx) {
        return Ok(());
    }
    if !ctx.services.results.enabled() {
        let result = SuiteResult::empty(test.name(), test.failure_on_exit(phase));
        return test.record_results(phase, result);
    }

    let invocation_names = test.invocation_names(phase).to_vec();
    let result = if invocation_names.is_empty() {
        SuiteResult::empty(test.name(), false)
    } else {
        let invocations = ctx.services.results.query(&invocation_names).await?;
        SuiteResult::create(
            &invocations,
            test.name(),
            test.spec().test_id_prefix.as_deref(),
            None,
            test.failure_on_exit(phase),
        )?
    };
    debug!(
        suite = %test.name(),
        %phase,
        failing = result.unexpected_failing_tests().len(),
        invalid = result.invalid(),
        "fetched results"
    );
    test.record_results(phase, result)
}

/// Make the phase's invocations part of the build.
///
/// Results without the change are reported but never included, since they
/// say nothing about the change.
async fn include_invocations(ctx: &BuildContext, tests: &[&mut TestRun], phase: Phase) -> DomainResult<()> {
    if !ctx.services.results.enabled() || phase == Phase::WithoutPatch {
        return Ok(());
    }
    let names: Vec<String> = tests
        .iter()
        .flat_map(|t| t.invocation_names(phase).iter().cloned())
        .collect();
    if names.is_empty() {
        return Ok(());
    }
    ctx.services.results.include_invocations(&names).await
}

/// Runs executed sequentially on the build machine.
pub struct LocalGroup<'a> {
    tests: Vec<&'a mut TestRun>,
}

impl LocalGroup<'_> {
    async fn pre_run(&mut self, ctx: &BuildContext, phase: Phase) -> DomainResult<()> {
        for test in &mut self.tests {
            let result = test.pre_run(ctx, phase).await;
            handle_step_result(test, result, false)?;
        }
        Ok(())
    }

    async fn run(&mut self, ctx: &BuildContext, phase: Phase) -> DomainResult<()> {
        for test in &mut self.tests {
            let result = test.run(ctx, phase).await.map(|_| ());
            handle_step_result(test, result, true)?;
            fetch_results(ctx, test, phase).await?;
        }
        Ok(())
    }
}

/// Runs dispatched to the remote task service.
pub struct RemoteGroup<'a> {
    tests: Vec<&'a mut TestRun>,
    /// Outstanding task set id to index into `tests`.
    outstanding: BTreeMap<String, usize>,
}

impl RemoteGroup<'_> {
    async fn pre_run(&mut self, ctx: &BuildContext, phase: Phase) -> DomainResult<()> {
        for (index, test) in self.tests.iter_mut().enumerate() {
            test.pre_run(ctx, phase).await?;
            if let Some(handle) = test.task_handle(phase) {
                self.outstanding.insert(handle.task_set_id.clone(), index);
            }
        }
        include_invocations(ctx, &self.tests, phase).await
    }

    async fn collect_one(&mut self, ctx: &BuildContext, index: usize, phase: Phase) -> DomainResult<()> {
        let test = &mut *self.tests[index];
        fetch_results(ctx, test, phase).await?;
        let result = test.run(ctx, phase).await.map(|_| ());
        handle_step_result(test, result, true)
    }

    async fn run(&mut self, ctx: &BuildContext, phase: Phase) -> DomainResult<()> {
        // Experiments not in effect were never submitted.
        for index in 0..self.tests.len() {
            if self.tests[index].task_handle(phase).is_none() {
                self.collect_one(ctx, index, phase).await?;
            }
        }

        let mut attempts = 0;
        let mut rounds = 0;
        while !self.outstanding.is_empty() && rounds < ctx.config.remote.max_poll_rounds {
            rounds += 1;
            let task_sets: Vec<String> = self.outstanding.keys().cloned().collect();
            let finished = ctx
                .services
                .remote
                .wait_for_finished_task_set(&task_sets, attempts)
                .await?;
            attempts = finished.attempts;
            if finished.finished.is_empty() {
                break;
            }

            for task_set in finished.finished {
                let Some(index) = self.outstanding.remove(&task_set) else {
                    debug!(%task_set, "ignoring unknown or already collected task set");
                    continue;
                };
                self.collect_one(ctx, index, phase).await?;
            }
        }

        if !self.outstanding.is_empty() {
            let pending: Vec<String> = self
                .outstanding
                .values()
                .map(|i| self.tests[*i].name().to_string())
                .collect();
            warn!(
                %phase,
                rounds,
                pending = ?pending,
                "task service reported no progress, collecting remaining tasks one by one"
            );
            ctx.record_step(StepSummary::new(
                "remote task states issue",
                StepStatus::Warning,
                format!(
                    "The task service seemed to indicate that every task was finished, but \
                     these tests still need to be collected:\n{}\nFalling back to collecting \
                     each task individually.",
                    pending.join(", ")
                ),
            ))
            .await;

            let remaining: Vec<usize> = std::mem::take(&mut self.outstanding).into_values().collect();
            for index in remaining {
                self.collect_one(ctx, index, phase).await?;
            }
        }
        Ok(())
    }
}

/// Runs batched into one hardware lab submission.
pub struct LabGroup<'a> {
    tests: Vec<&'a mut TestRun>,
    batch_id: Option<String>,
    timeout_secs: u64,
}

impl LabGroup<'_> {
    async fn pre_run(&mut self, ctx: &BuildContext, phase: Phase) -> DomainResult<()> {
        for test in &mut self.tests {
            let result = test.pre_run(ctx, phase).await;
            handle_step_result(test, result, false)?;
        }

        let requests: Vec<LabRequest> = self
            .tests
            .iter()
            .filter_map(|t| t.lab_request(phase).cloned())
            .collect();
        if requests.is_empty() {
            return Ok(());
        }

        self.timeout_secs = requests
            .iter()
            .map(|r| r.timeout_secs)
            .fold(ctx.config.lab.default_timeout_secs, u64::max);
        info!(count = requests.len(), timeout_secs = self.timeout_secs, "scheduling lab suites");
        let batch_id = ctx
            .services
            .lab
            .schedule_suites(requests, self.timeout_secs)
            .await?;
        self.batch_id = Some(batch_id);
        Ok(())
    }

    async fn run(&mut self, ctx: &BuildContext, phase: Phase) -> DomainResult<()> {
        let mut responses = BTreeMap::new();
        if let Some(batch_id) = &self.batch_id {
            for response in ctx.services.lab.wait_on_suites(batch_id, self.timeout_secs).await? {
                responses.insert(response.step_name.clone(), response);
            }
        }

        for test in &mut self.tests {
            if let Some(response) = responses.remove(&test.step_name(phase)) {
                test.set_lab_response(phase, response);
            }
            fetch_results(ctx, test, phase).await?;
            let result = test.run(ctx, phase).await.map(|_| ());
            handle_step_result(test, result, true)?;
        }

        include_invocations(ctx, &self.tests, phase).await
    }
}

/// The runs of one venue.
pub enum TestGroup<'a> {
    Local(LocalGroup<'a>),
    Remote(RemoteGroup<'a>),
    Lab(LabGroup<'a>),
}

impl<'a> TestGroup<'a> {
    /// Split `tests` by venue, preserving their order.
    ///
    /// With `sort_by_shard`, remote runs with more shards are dispatched
    /// first since they tend to take longest.
    pub fn partition(tests: Vec<&'a mut TestRun>, sort_by_shard: bool) -> Vec<Self> {
        let mut local = Vec::new();
        let mut remote = Vec::new();
        let mut lab = Vec::new();
        for test in tests {
            match test.venue() {
                Venue::Local => local.push(test),
                Venue::Remote => remote.push(test),
                Venue::Lab => lab.push(test),
            }
        }
        if sort_by_shard {
            remote.sort_by_key(|t| std::cmp::Reverse(t.spec().shards));
        }

        vec![
            Self::Local(LocalGroup { tests: local }),
            Self::Remote(RemoteGroup {
                tests: remote,
                outstanding: BTreeMap::new(),
            }),
            Self::Lab(LabGroup {
                tests: lab,
                batch_id: None,
                timeout_secs: 0,
            }),
        ]
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Local(g) => g.tests.len(),
            Self::Remote(g) => g.tests.len(),
            Self::Lab(g) => g.tests.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn pre_run(&mut self, ctx: &BuildContext, phase: Phase) -> DomainResult<()> {
        match self {
            Self::Local(g) => g.pre_run(ctx, phase).await,
            Self::Remote(g) => g.pre_run(ctx, phase).await,
            Self::Lab(g) => g.pre_run(ctx, phase).await,
        }
    }

    pub async fn run(&mut self, ctx: &BuildContext, phase: Phase) -> DomainResult<()> {
        match self {
            Self::Local(g) => g.run(ctx, phase).await,
            Self::Remote(g) => g.run(ctx, phase).await,
            Self::Lab(g) => g.run(ctx, phase).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::scripted::{PhaseScript, ScriptedWorld};
    use crate::domain::models::{Config, TestSpec};
    use crate::services::context::BuildIdentity;

    async fn world_with_artifacts(targets: &[&str]) -> (ScriptedWorld, BuildContext) {
        let world = ScriptedWorld::default();
        let ctx = world.context(BuildIdentity::default(), Config::default());
        ctx.record_artifacts(
            Phase::WithPatch,
            targets
                .iter()
                .map(|t| ((*t).to_string(), format!("digest-{t}")))
                .collect(),
        )
        .await;
        (world, ctx)
    }

    #[test]
    fn test_partition_sorts_remote_by_shards() {
        let mut a = TestRun::new(TestSpec::new("a", Venue::Remote).with_shards(1));
        let mut b = TestRun::new(TestSpec::new("b", Venue::Local));
        let mut c = TestRun::new(TestSpec::new("c", Venue::Remote).with_shards(8));
        let groups = TestGroup::partition(vec![&mut a, &mut b, &mut c], true);

        assert_eq!(groups.len(), 3);
        assert_eq!(groups[0].len(), 1);
        let TestGroup::Remote(remote) = &groups[1] else {
            panic!("expected remote group");
        };
        let names: Vec<&str> = remote.tests.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["c", "a"]);
        assert!(groups[2].is_empty());
    }

    #[tokio::test]
    async fn test_remote_group_collects_every_task() {
        let (world, ctx) = world_with_artifacts(&["browser_tests", "unit_tests"]).await;
        world
            .script(
                "browser_tests",
                Phase::WithPatch,
                PhaseScript::failing(&[1], &["Suite.Fails"]),
            )
            .await;
        world.script("unit_tests", Phase::WithPatch, PhaseScript::passing(&["Unit.Ok"])).await;

        let mut browser = TestRun::new(TestSpec::new("browser_tests", Venue::Remote).with_shards(2));
        let mut unit = TestRun::new(TestSpec::new("unit_tests", Venue::Remote));
        for mut group in TestGroup::partition(vec![&mut browser, &mut unit], false) {
            group.pre_run(&ctx, Phase::WithPatch).await.expect("pre_run");
            group.run(&ctx, Phase::WithPatch).await.expect("run");
        }

        assert!(browser.failure_on_exit(Phase::WithPatch));
        assert!(browser
            .deterministic_failures(Phase::WithPatch)
            .expect("valid")
            .contains("Suite.Fails"));
        assert!(unit.deterministic_failures(Phase::WithPatch).expect("valid").is_empty());
        assert_eq!(world.results.included().await.len(), 2);
    }

    #[tokio::test]
    async fn test_remote_group_falls_back_when_polling_stalls() {
        let (world, ctx) = world_with_artifacts(&["browser_tests"]).await;
        world.remote.stall_polling(true);
        world.script("browser_tests", Phase::WithPatch, PhaseScript::passing(&["A.a"])).await;

        let mut browser = TestRun::new(TestSpec::new("browser_tests", Venue::Remote));
        for mut group in TestGroup::partition(vec![&mut browser], false) {
            group.pre_run(&ctx, Phase::WithPatch).await.expect("pre_run");
            group.run(&ctx, Phase::WithPatch).await.expect("run");
        }

        assert!(browser.has_valid_results(Phase::WithPatch));
        let steps = ctx.steps().await;
        assert!(steps.iter().any(|s| s.name == "remote task states issue"));
    }

    #[tokio::test]
    async fn test_missing_artifact_is_dispatch_error() {
        let (_world, ctx) = world_with_artifacts(&[]).await;
        let mut browser = TestRun::new(TestSpec::new("browser_tests", Venue::Remote));
        let mut groups = TestGroup::partition(vec![&mut browser], false);
        let err = groups[1].pre_run(&ctx, Phase::WithPatch).await.unwrap_err();
        assert!(err.is_infra());
    }

    #[tokio::test]
    async fn test_local_failure_aborts_only_when_requested() {
        let (world, ctx) = world_with_artifacts(&[]).await;
        world.script("first", Phase::WithPatch, PhaseScript::failing(&[0], &["F.f"])).await;
        world.script("second", Phase::WithPatch, PhaseScript::passing(&["S.s"])).await;

        let mut first = TestRun::new(TestSpec::new("first", Venue::Local));
        let mut second = TestRun::new(TestSpec::new("second", Venue::Local));
        for mut group in TestGroup::partition(vec![&mut first, &mut second], false) {
            group.pre_run(&ctx, Phase::WithPatch).await.expect("pre_run");
            group.run(&ctx, Phase::WithPatch).await.expect("run");
        }
        assert!(second.has_valid_results(Phase::WithPatch));

        let mut first = TestRun::new(TestSpec::new("first", Venue::Local).aborting_on_failure());
        let mut second = TestRun::new(TestSpec::new("second", Venue::Local));
        let mut groups = TestGroup::partition(vec![&mut first, &mut second], false);
        groups[0].pre_run(&ctx, Phase::WithPatch).await.expect("pre_run");
        let err = groups[0].run(&ctx, Phase::WithPatch).await.unwrap_err();
        assert!(matches!(err, DomainError::TestStepFailed { .. }));
        drop(groups);
        assert!(second.suite_result(Phase::WithPatch).is_none());
    }

    #[tokio::test]
    async fn test_lab_group_batches_and_handles_missing_response() {
        let (world, ctx) = world_with_artifacts(&["lab_a", "lab_b"]).await;
        world.script("lab_a", Phase::WithPatch, PhaseScript::passing(&["A.a"])).await;
        world
            .script("lab_b", Phase::WithPatch, PhaseScript::passing(&["B.b"]).without_lab_response())
            .await;

        let mut a = TestRun::new(TestSpec::new("lab_a", Venue::Lab));
        let mut b = TestRun::new(TestSpec::new("lab_b", Venue::Lab));
        for mut group in TestGroup::partition(vec![&mut a, &mut b], false) {
            group.pre_run(&ctx, Phase::WithPatch).await.expect("pre_run");
            group.run(&ctx, Phase::WithPatch).await.expect("run");
        }

        assert_eq!(world.lab.batches().await, 1);
        assert!(a.has_valid_results(Phase::WithPatch));
        assert!(b.failure_on_exit(Phase::WithPatch));
        assert!(!b.has_valid_results(Phase::WithPatch));
    }

    #[tokio::test]
    async fn test_phase_cannot_run_twice() {
        let (world, ctx) = world_with_artifacts(&[]).await;
        world.script("first", Phase::WithPatch, PhaseScript::passing(&["F.f"])).await;
        let mut first = TestRun::new(TestSpec::new("first", Venue::Local));
        first.pre_run(&ctx, Phase::WithPatch).await.expect("pre_run");
        assert!(matches!(
            first.pre_run(&ctx, Phase::WithPatch).await,
            Err(DomainError::Precondition(_))
        ));
        first.run(&ctx, Phase::WithPatch).await.expect("run");
        assert!(matches!(
            first.run(&ctx, Phase::WithPatch).await,
            Err(DomainError::Precondition(_))
        ));
        assert!(matches!(
            first.run(&ctx, Phase::WithoutPatch).await,
            Err(DomainError::Precondition(_))
        ));
    }
}
