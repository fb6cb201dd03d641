//! Classification of failing tests against their flakiness history.
//!
//! Two independent sources mark failures as known flaky: the legacy
//! known-flakes service, which lists flaky tests with a tracking bug, and the
//! failure-rate analysis service, whose interval statistics are classified
//! here as strongly or weakly flaky. Both are best effort: an unreachable
//! service or an unusable answer means nothing is known to be flaky.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::domain::models::{
    FailingVariant, FlakeClassification, FlakeConfig, FlakeTestRef, KnownFlake, KnownFlakesQuery,
    Phase, StepStatus, StepSummary, TestVariantFailureRate,
};
use crate::services::context::BuildContext;
use crate::services::test_run::TestRun;

/// Failed suites left after forgiving known flakes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanedSuites {
    /// Suites with at least one failure not known to be flaky.
    pub failed: Vec<String>,
    /// Pruned suites whose weakly flaky tests should run again anyway.
    pub statistics_only: Vec<String>,
}

/// Classify one variant's history.
///
/// Strongly flaky: enough flaky verdicts in the long window with one of
/// them recent, or enough unexpected verdicts among the latest ones.
/// Weakly flaky: fewer flaky verdicts but still flaky in the short window.
pub fn classify(rate: &TestVariantFailureRate, config: &FlakeConfig, now: DateTime<Utc>) -> FlakeClassification {
    let long_window = rate.flaky_verdicts_in_intervals(config.long_window_intervals);
    let short_window = rate.flaky_verdicts_in_intervals(config.short_window_intervals);
    let recent_cutoff = now - Duration::hours(config.strong_recency_hours);

    let strong = (long_window >= config.strong_min_flaky_verdicts
        && rate.has_flaky_verdict_since(recent_cutoff))
        || rate.unexpected_recent_verdicts(config.recent_verdict_window)
            >= config.strong_min_unexpected_recent_verdicts;
    if strong {
        return FlakeClassification::Strong;
    }

    if long_window >= config.weak_min_flaky_verdicts
        && short_window >= config.weak_min_short_window_flaky_verdicts
    {
        FlakeClassification::Weak
    } else {
        FlakeClassification::NotFlaky
    }
}

fn find_mut<'a>(tests: &'a mut [TestRun], name: &str) -> Option<&'a mut TestRun> {
    tests.iter_mut().find(|t| t.name() == name)
}

fn with_patch_failures(tests: &[TestRun], name: &str) -> Vec<String> {
    tests
        .iter()
        .find(|t| t.name() == name)
        .and_then(|t| t.deterministic_failures(Phase::WithPatch).ok())
        .map(|f| f.into_iter().collect())
        .unwrap_or_default()
}

/// Drop failed suites whose with-patch failures are all known flaky.
///
/// Every failing test is first checked against both flakiness sources and
/// marked on its suite. As long as one failure is not known flaky the whole
/// suite stays failed and is retried.
pub async fn clean_failed_suite_list(
    ctx: &BuildContext,
    tests: &mut [TestRun],
    failed: Vec<String>,
) -> CleanedSuites {
    if !ctx.config.flakes.exonerate_flaky_failures || failed.is_empty() {
        return CleanedSuites {
            failed,
            statistics_only: Vec::new(),
        };
    }

    mark_known_flakes(ctx, tests, &failed).await;
    mark_flaky_variants(ctx, tests, &failed, Utc::now()).await;

    let mut cleaned = CleanedSuites::default();
    for name in failed {
        let Some(test) = tests.iter().find(|t| t.name() == name) else {
            continue;
        };
        let known = test.known_flaky_failures();
        let all_known = !known.is_empty()
            && test
                .deterministic_failures(Phase::WithPatch)
                .is_ok_and(|failures| failures.is_subset(&known));
        if !all_known {
            cleaned.failed.push(name);
            continue;
        }
        info!(suite = %name, flaky = known.len(), "every failure is known flaky, not retrying");
        if !test.weakly_flaky_failures().is_empty() {
            cleaned.statistics_only.push(name);
        }
    }
    cleaned
}

/// Ask the legacy service which failures are known flaky at tip of tree.
async fn mark_known_flakes(ctx: &BuildContext, tests: &mut [TestRun], failed: &[String]) {
    let Some(service) = ctx.services.known_flakes.as_ref() else {
        return;
    };

    let mut query_tests = Vec::new();
    for name in failed {
        let failures = with_patch_failures(tests, name);
        if failures.len() > ctx.config.flakes.max_failing_tests_per_suite {
            debug!(suite = %name, failures = failures.len(), "too many failures to query known flakes");
            continue;
        }
        let step_ui_name = format!("{name} ({})", Phase::WithPatch);
        query_tests.extend(failures.into_iter().map(|test_name| FlakeTestRef {
            step_ui_name: step_ui_name.clone(),
            test_name,
        }));
    }
    if query_tests.is_empty() {
        return;
    }

    let query = KnownFlakesQuery {
        project: ctx.identity.project.clone(),
        bucket: ctx.identity.bucket.clone(),
        builder: ctx.identity.builder.clone(),
        tests: query_tests,
    };
    let mut step = StepSummary::new("query known flaky failures on CQ", StepStatus::Success, "");
    step.logs.insert("input".to_string(), pretty_lines(&query));

    match service.query_known_flakes(&query).await {
        Ok(flakes) => {
            step.logs.insert("output".to_string(), pretty_lines(&flakes));
            apply_known_flakes(tests, &flakes);
        }
        Err(e) => {
            warn!(error = %e, "failed to get known flakes, retrying failures as usual");
            step.status = StepStatus::Warning;
            step.text = "Failed to get known flakes".to_string();
        }
    }
    ctx.record_step(step).await;
}

fn apply_known_flakes(tests: &mut [TestRun], flakes: &[KnownFlake]) {
    for flake in flakes {
        let Some(test) = tests
            .iter_mut()
            .find(|t| t.step_name(Phase::WithPatch) == flake.test.step_ui_name)
        else {
            debug!(step = %flake.test.step_ui_name, "known flake for a suite that did not fail");
            continue;
        };
        test.add_known_flaky_failure(
            flake.test.test_name.clone(),
            Some(flake.monorail_issue.to_string()),
        );
    }
}

/// Classify failing variants by their failure-rate history.
async fn mark_flaky_variants(ctx: &BuildContext, tests: &mut [TestRun], failed: &[String], now: DateTime<Utc>) {
    let Some(service) = ctx.services.flakiness.as_ref() else {
        return;
    };
    let config = &ctx.config.flakes;

    let suite_failures: Vec<(&String, Vec<String>)> = failed
        .iter()
        .map(|name| (name, with_patch_failures(tests, name)))
        .collect();
    let total_failing: usize = suite_failures.iter().map(|(_, f)| f.len()).sum();
    if total_failing > config.max_failing_variants {
        info!(variants = total_failing, "too many failing variants, skipping failure rate analysis");
        return;
    }

    let mut variants = Vec::new();
    let mut owners: BTreeMap<(String, String), (String, String)> = BTreeMap::new();
    for (name, failures) in suite_failures {
        let Some(result) = tests
            .iter()
            .find(|t| t.name() == name.as_str())
            .and_then(|t| t.suite_result(Phase::WithPatch))
        else {
            continue;
        };
        if failures.len() > config.max_failing_tests_per_suite {
            debug!(suite = %name, failures = failures.len(), "too many failures to query failure rates");
            continue;
        }
        for test_name in failures {
            let variant = FailingVariant {
                test_id: result.test_id_for(&test_name).to_string(),
                variant_hash: result.variant_hash().to_string(),
            };
            owners.insert(
                (variant.test_id.clone(), variant.variant_hash.clone()),
                (name.clone(), test_name),
            );
            variants.push(variant);
        }
    }
    if variants.is_empty() {
        return;
    }

    let rates = match service.query_failure_rate(&variants).await {
        Ok(rates) => rates,
        Err(e) => {
            warn!(error = %e, "failure rate analysis failed, treating nothing as flaky");
            return;
        }
    };

    let mut step = StepSummary::new("query test variant failure rates", StepStatus::Success, "");
    for rate in &rates {
        let Some((suite, test_name)) = owners.get(&(rate.test_id.clone(), rate.variant_hash.clone())) else {
            warn!(test_id = %rate.test_id, "failure rate for a variant that was not asked about");
            continue;
        };
        let classification = classify(rate, config, now);
        let Some(test) = find_mut(tests, suite) else {
            continue;
        };
        match classification {
            FlakeClassification::Strong => {
                test.add_known_flaky_failure(test_name.clone(), None);
            }
            FlakeClassification::Weak => {
                test.add_known_flaky_failure(test_name.clone(), None);
                test.add_weakly_flaky_failure(test_name.clone());
            }
            FlakeClassification::NotFlaky => continue,
        }
        debug!(%suite, test = %test_name, ?classification, "exonerating flaky failure");
        step.logs
            .entry(suite.clone())
            .or_default()
            .push(format!("{test_name}: {}", classification_label(classification)));
    }
    if !step.logs.is_empty() {
        ctx.record_step(step).await;
    }
}

const fn classification_label(classification: FlakeClassification) -> &'static str {
    match classification {
        FlakeClassification::Strong => "strongly flaky",
        FlakeClassification::Weak => "weakly flaky",
        FlakeClassification::NotFlaky => "not flaky",
    }
}

fn pretty_lines<T: serde::Serialize>(value: &T) -> Vec<String> {
    serde_json::to_string_pretty(value)
        .map(|json| json.lines().map(str::to_string).collect())
        .unwrap_or_default()
}
