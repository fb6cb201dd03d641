//! Property-based tests for shard sizing, failure lists and suite results.

use std::collections::{BTreeMap, BTreeSet};

use proptest::prelude::*;
use tryjob_reconciler::domain::models::{Invocation, RawTestResult, SuiteResult, Tag, TestStatus};
use tryjob_reconciler::services::summary::limit_failures;
use tryjob_reconciler::services::test_run::retry_shard_count;

fn status_strategy() -> impl Strategy<Value = TestStatus> {
    prop_oneof![
        Just(TestStatus::Pass),
        Just(TestStatus::Fail),
        Just(TestStatus::Crash),
        Just(TestStatus::Abort),
        Just(TestStatus::Skip),
    ]
}

/// Up to 12 tests, each with one to three runs.
fn runs_strategy() -> impl Strategy<Value = Vec<Vec<TestStatus>>> {
    prop::collection::vec(prop::collection::vec(status_strategy(), 1..4), 0..12)
}

fn invocation(runs: &[Vec<TestStatus>]) -> Invocation {
    let test_results = runs
        .iter()
        .enumerate()
        .flat_map(|(i, statuses)| {
            statuses.iter().map(move |status| RawTestResult {
                test_id: format!("ninja://:suite/T.t{i}"),
                variant_hash: "hash".to_string(),
                variant: BTreeMap::from([("test_suite".to_string(), "suite".to_string())]),
                status: *status,
                expected: false,
                duration_ms: None,
                failure_reason: None,
                tags: vec![Tag {
                    key: "test_name".to_string(),
                    value: format!("T.t{i}"),
                }],
            })
        })
        .collect();
    Invocation {
        name: "invocations/prop".to_string(),
        test_results,
    }
}

proptest! {
    /// Property: a retry never uses more shards than the suite had, nor
    /// more shards than tests to retry, and always at least one.
    #[test]
    fn prop_retry_shard_count_bounds(
        original in 1u32..200,
        retried in 0usize..5_000,
        total in 0usize..5_000,
    ) {
        let shards = retry_shard_count(original, retried, total);
        prop_assert!(shards >= 1);
        prop_assert!(shards <= original);
        if retried > 0 {
            prop_assert!(shards as usize <= retried);
        }
    }

    /// Property: limited lists keep the leading failures in order and add at
    /// most one overflow line.
    #[test]
    fn prop_limit_failures_keeps_prefix(
        failures in prop::collection::vec("[A-Z][a-z]{1,5}\\.[a-z]{1,5}", 0..20),
        limit in 1usize..10,
    ) {
        let limited = limit_failures(&failures, limit);
        if failures.len() <= limit {
            prop_assert_eq!(&limited, &failures);
        } else {
            prop_assert_eq!(limited.len(), limit + 1);
            prop_assert_eq!(&limited[..limit], &failures[..limit]);
            let total = format!("({} total)", failures.len());
            prop_assert!(limited[limit].contains(&total));
        }
    }

    /// Property: every unexpected test is either failing or passing, never
    /// both, and tests that only skipped count as failing.
    #[test]
    fn prop_suite_result_partitions_tests(runs in runs_strategy(), failure_on_exit in any::<bool>()) {
        let result = SuiteResult::create(&[invocation(&runs)], "suite", None, None, failure_on_exit)
            .expect("single-suite invocation");

        let failing = result.unexpected_failing_tests();
        let passing = result.unexpected_passing_tests();
        prop_assert!(failing.is_disjoint(passing));
        prop_assert_eq!(failing.len() + passing.len(), runs.len());
        prop_assert!(result.unexpected_skipped_tests().is_subset(failing));

        let all_skipped: BTreeSet<String> = runs
            .iter()
            .enumerate()
            .filter(|(_, statuses)| statuses.iter().all(|s| *s == TestStatus::Skip))
            .map(|(i, _)| format!("T.t{i}"))
            .collect();
        prop_assert_eq!(result.unexpected_skipped_tests(), &all_skipped);
    }

    /// Property: results are only invalid when the harness failed, and a
    /// deterministic failure always makes them valid.
    #[test]
    fn prop_invalid_needs_failure_on_exit(runs in runs_strategy(), failure_on_exit in any::<bool>()) {
        let result = SuiteResult::create(&[invocation(&runs)], "suite", None, None, failure_on_exit)
            .expect("single-suite invocation");

        if result.invalid() {
            prop_assert!(failure_on_exit);
        }
        if !result.unexpected_failing_tests().is_empty() {
            prop_assert!(!result.invalid());
        }
        prop_assert_eq!(result.total_tests_ran(), runs.iter().map(Vec::len).sum::<usize>());
    }
}
