//! Running a phase of suites, and retrying the shards that failed.
//!
//! `run_tests` is the retry state machine for one phase: run every suite
//! once, give up early when the change is clearly broken, forgive known
//! flakes, then rerun the failed shards of remote suites and reconcile both
//! runs.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};

use crate::domain::errors::DomainResult;
use crate::domain::models::{Phase, ResultSet, StepStatus, StepSummary};
use crate::services::context::{BuildContext, SKIP_RETRY_FOOTER};
use crate::services::exoneration::exonerate_unrelated_failures;
use crate::services::flake_classifier::clean_failed_suite_list;
use crate::services::summary::mark_invalid_test_results;
use crate::services::test_group::TestGroup;
use crate::services::test_run::TestRun;

/// Which shards `run_tests` may rerun.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryOptions {
    pub retry_failed_shards: bool,
    pub retry_invalid_shards: bool,
    pub sort_by_shard: bool,
}

impl RetryOptions {
    /// Options for the phase with the change applied.
    pub const fn with_patch(retry_failed_shards: bool) -> Self {
        Self {
            retry_failed_shards,
            retry_invalid_shards: retry_failed_shards,
            sort_by_shard: true,
        }
    }

    pub const fn retries(&self) -> bool {
        self.retry_failed_shards || self.retry_invalid_shards
    }
}

/// Suites of one `run_tests_once` pass, by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PhaseResults {
    /// Suites without valid results.
    pub invalid: Vec<String>,
    /// Suites with valid results and deterministic failures.
    pub failed: Vec<String>,
    /// Suites with unexpected failures or invalid results, as reported by
    /// the result backend.
    pub unexpected_failing: Vec<String>,
}

/// Outcome of `run_tests` for one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunTestsOutcome {
    /// Suites still without valid results.
    pub invalid: Vec<String>,
    /// Suites still failing, invalid ones included.
    pub failed: Vec<String>,
    /// Suites rerun only to refresh flakiness statistics.
    pub statistics_retried: Vec<String>,
}

fn selected<'a>(tests: &'a mut [TestRun], names: &BTreeSet<String>) -> Vec<&'a mut TestRun> {
    tests.iter_mut().filter(|t| names.contains(t.name())).collect()
}

/// Run `names` once in `phase`, every venue group dispatching before any
/// group collects.
pub async fn run_tests_once(
    ctx: &BuildContext,
    tests: &mut [TestRun],
    names: &BTreeSet<String>,
    phase: Phase,
    sort_by_shard: bool,
) -> DomainResult<PhaseResults> {
    {
        let mut groups = TestGroup::partition(selected(tests, names), sort_by_shard);
        for group in groups.iter_mut().filter(|g| !g.is_empty()) {
            group.pre_run(ctx, phase).await?;
        }
        for group in groups.iter_mut().filter(|g| !g.is_empty()) {
            group.run(ctx, phase).await?;
        }
    }

    let ran: Vec<&TestRun> = tests.iter().filter(|t| names.contains(t.name())).collect();
    let result_set = ResultSet::create(ran.iter().filter_map(|t| t.suite_result(phase)));

    let mut results = PhaseResults {
        unexpected_failing: result_set
            .unexpected_failing_suites()
            .iter()
            .map(|s| s.suite_name().to_string())
            .collect(),
        ..PhaseResults::default()
    };
    for test in ran {
        if !test.has_valid_results(phase) {
            results.invalid.push(test.name().to_string());
        } else if test.deterministic_failures(phase).is_ok_and(|f| !f.is_empty()) {
            results.failed.push(test.name().to_string());
        }
    }
    debug!(
        %phase,
        invalid = ?results.invalid,
        failed = ?results.failed,
        "phase ran"
    );
    Ok(results)
}

/// Whether retries should be skipped for the whole try job.
///
/// A footer on the change can disable them; so many failing suites
/// indicate the change itself is broken.
pub async fn should_abort_tryjob(ctx: &BuildContext, unexpected_failing: &[String]) -> bool {
    if !ctx.footer(SKIP_RETRY_FOOTER).is_empty() {
        info!("retries disabled by footer");
        ctx.record_step(StepSummary::new(
            "retries disabled",
            StepStatus::Success,
            format!("\nfooter {SKIP_RETRY_FOOTER} disables suite-level retries"),
        ))
        .await;
        return true;
    }

    let threshold = ctx.config.retry.min_failed_suites_to_skip_retry;
    if unexpected_failing.len() >= threshold {
        warn!(
            failing = unexpected_failing.len(),
            threshold, "too many failing suites, skipping retries"
        );
        ctx.record_step(StepSummary::new(
            "abort retry",
            StepStatus::Failure,
            format!(
                "\nskip retrying because there are >= {threshold} test suites with test failures and it \
                 most likely indicates a problem with the CL. These suites being:\n{}",
                unexpected_failing.join("\n")
            ),
        ))
        .await;
        true
    } else {
        ctx.record_step(StepSummary::new(
            "proceed with retry",
            StepStatus::Success,
            format!("\nfewer than {threshold} failures, continue with retries"),
        ))
        .await;
        false
    }
}

fn union_sorted(a: &[String], b: &[String]) -> Vec<String> {
    a.iter().chain(b).cloned().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Run `names` in `phase`, retrying failed shards as `options` allow.
///
/// Suites pruned as weakly flaky run again in the retry phase only to feed
/// flakiness statistics; their outcome never reaches the verdict. That rerun
/// shares the retry gate: when `options` allow no retries it is skipped too.
pub async fn run_tests(
    ctx: &BuildContext,
    tests: &mut [TestRun],
    names: &[String],
    phase: Phase,
    options: RetryOptions,
) -> DomainResult<RunTestsOutcome> {
    let names: BTreeSet<String> = names.iter().cloned().collect();
    let once = run_tests_once(ctx, tests, &names, phase, options.sort_by_shard).await?;
    let invalid = once.invalid;
    let mut failed = once.failed;

    if ctx.is_tryserver && should_abort_tryjob(ctx, &once.unexpected_failing).await {
        return Ok(RunTestsOutcome {
            failed: union_sorted(&invalid, &failed),
            invalid,
            statistics_retried: Vec::new(),
        });
    }

    let mut statistics_only = Vec::new();
    if phase == Phase::WithPatch {
        let cleaned = clean_failed_suite_list(ctx, tests, failed).await;
        failed = cleaned.failed;
        statistics_only = cleaned.statistics_only;
    }

    exonerate_unrelated_failures(ctx, tests.iter().filter(|t| names.contains(t.name())), phase).await?;

    let failed_and_invalid = union_sorted(&failed, &invalid);
    if !options.retries() {
        return Ok(RunTestsOutcome {
            invalid,
            failed: failed_and_invalid,
            statistics_retried: Vec::new(),
        });
    }

    let remote: BTreeSet<String> = tests
        .iter()
        .filter(|t| t.venue().supports_shard_retry())
        .map(|t| t.name().to_string())
        .collect();
    let is_remote = |name: &String| remote.contains(name);
    let mut to_retry: BTreeSet<String> = BTreeSet::new();
    if options.retry_failed_shards {
        to_retry.extend(failed.iter().filter(|n| is_remote(n)).cloned());
    }
    if options.retry_invalid_shards {
        to_retry.extend(invalid.iter().filter(|n| is_remote(n)).cloned());
    }
    let statistics_retried: Vec<String> = statistics_only
        .into_iter()
        .filter(|n| is_remote(n) && !to_retry.contains(n))
        .collect();
    if to_retry.is_empty() && statistics_retried.is_empty() {
        return Ok(RunTestsOutcome {
            invalid,
            failed: failed_and_invalid,
            statistics_retried,
        });
    }

    let retry_phase = phase.retry_shards();
    info!(
        %retry_phase,
        suites = ?to_retry,
        statistics_only = ?statistics_retried,
        "retrying failed shards"
    );
    let retry_names: BTreeSet<String> = to_retry.iter().chain(&statistics_retried).cloned().collect();
    let retried = run_tests_once(ctx, tests, &retry_names, retry_phase, true).await?;

    // A remote suite with valid results from either run is valid; suites
    // that cannot be retried stay invalid.
    let still_invalid: Vec<String> = invalid
        .iter()
        .filter(|n| !is_remote(n) || retried.invalid.contains(n))
        .cloned()
        .collect();

    let still_failing: Vec<String> = failed_and_invalid
        .into_iter()
        .filter(|name| {
            tests
                .iter()
                .find(|t| t.name() == name.as_str())
                .map_or(true, |t| {
                    t.failures_including_retry(phase)
                        .map_or(true, |failures| !failures.is_empty())
                })
        })
        .collect();

    Ok(RunTestsOutcome {
        invalid: still_invalid,
        failed: still_failing,
        statistics_retried,
    })
}

/// Run every suite with the change applied and flag the invalid ones.
pub async fn run_tests_with_patch(
    ctx: &BuildContext,
    tests: &mut [TestRun],
    retry_failed_shards: bool,
) -> DomainResult<RunTestsOutcome> {
    let names: Vec<String> = tests.iter().map(|t| t.name().to_string()).collect();
    let outcome = run_tests(
        ctx,
        tests,
        &names,
        Phase::WithPatch,
        RetryOptions::with_patch(retry_failed_shards),
    )
    .await?;

    for name in &outcome.invalid {
        if let Some(test) = tests.iter().find(|t| t.name() == name.as_str()) {
            mark_invalid_test_results(ctx, test).await;
        }
    }
    Ok(outcome)
}
