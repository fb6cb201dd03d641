//! Human-readable summaries of test failures.
//!
//! Per-suite "test results summary" steps tell developers which failures
//! their change caused and which were forgiven. The unrecoverable-failures
//! markdown becomes the summary of a failed build and is size-bounded.

use std::collections::BTreeSet;

use tracing::{debug, error};

use crate::domain::models::{Phase, StepStatus, StepSummary};
use crate::services::context::BuildContext;
use crate::services::test_run::TestRun;

pub const NEW_FAILURES_TEXT: &str = "Tests failed with patch, and caused build to fail:";
pub const IGNORED_FAILURES_TEXT: &str =
    "Tests failed with patch, but ignored as they also fail without patch:";
pub const IGNORED_FLAKES_TEXT: &str =
    "Tests failed with patch, but ignored as they are known to be flaky:";

/// Marker text downstream flake tooling searches for.
pub const INVALID_RESULTS_MAGIC: &str = "TEST RESULTS WERE INVALID";

const FLAKE_BUG_HINT: &str =
    "<br/>If the mentioned known flaky tests are incorrect, please file a bug at: http://bit.ly/37I61c2<br/>";

const SUMMARY_SUFFIX: &str = "test results summary";

/// One section of a step's text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    /// Always shown.
    Line(String),
    /// Header plus content lines; dropped entirely when there is no content.
    List(String, Vec<String>),
}

/// Failures to display, with an overflow line once `limit` is exceeded.
pub fn limit_failures(failures: &[String], limit: usize) -> Vec<String> {
    if failures.len() <= limit {
        return failures.to_vec();
    }
    let mut limited: Vec<String> = failures.iter().take(limit).cloned().collect();
    limited.push(format!(
        "... {} more ({} total) ...",
        failures.len() - limit,
        failures.len()
    ));
    limited
}

pub fn format_step_text(sections: &[Section]) -> String {
    let mut text = String::new();
    for section in sections {
        match section {
            Section::Line(line) => {
                text.push_str(&format!("<br/>{line}<br/>"));
            }
            Section::List(header, lines) if !lines.is_empty() => {
                text.push_str(&format!("<br/>{header}<br/>"));
                for line in lines {
                    text.push_str(&format!("{line}<br/>"));
                }
            }
            Section::List(..) => {}
        }
    }
    text
}

/// Pretty-printed JSON list, one log line per output line.
fn json_log_lines(items: &[String]) -> Vec<String> {
    match serde_json::to_string_pretty(items) {
        Ok(json) => json.lines().map(str::to_string).collect(),
        Err(e) => {
            error!(error = %e, "failed to render summary log");
            items.to_vec()
        }
    }
}

/// Build the "test results summary" step of `suite`.
///
/// Returns the step and whether the change caused no new failures.
pub fn summarize_new_and_ignored_failures(
    suite: &str,
    new_failures: &BTreeSet<String>,
    ignored_failures: &BTreeSet<String>,
    ignored_flakes: &[String],
    max_reported_failures: usize,
) -> (StepSummary, bool) {
    let new_failures: Vec<String> = new_failures.iter().cloned().collect();
    let ignored_failures: Vec<String> = ignored_failures.iter().cloned().collect();
    let mut ignored_flakes = ignored_flakes.to_vec();
    ignored_flakes.sort();

    let mut text = format_step_text(&[
        Section::List(
            NEW_FAILURES_TEXT.to_string(),
            limit_failures(&new_failures, max_reported_failures),
        ),
        Section::List(
            IGNORED_FAILURES_TEXT.to_string(),
            limit_failures(&ignored_failures, max_reported_failures),
        ),
        Section::List(
            IGNORED_FLAKES_TEXT.to_string(),
            limit_failures(&ignored_flakes, max_reported_failures),
        ),
    ]);
    if !ignored_flakes.is_empty() {
        text.push_str(FLAKE_BUG_HINT);
    }

    let status = if !new_failures.is_empty() {
        StepStatus::Failure
    } else if !ignored_failures.is_empty() || !ignored_flakes.is_empty() {
        StepStatus::Warning
    } else {
        StepStatus::Success
    };

    let mut step = StepSummary::new(format!("{suite} ({SUMMARY_SUFFIX})"), status, text);
    if !new_failures.is_empty() {
        step.logs
            .insert("failures caused build to fail".to_string(), json_log_lines(&new_failures));
    }
    if !ignored_failures.is_empty() {
        step.logs.insert(
            "failures ignored as they also fail without patch".to_string(),
            json_log_lines(&ignored_failures),
        );
    }
    if !ignored_flakes.is_empty() {
        step.logs.insert(
            "failures ignored as they are known to be flaky".to_string(),
            json_log_lines(&ignored_flakes),
        );
    }
    (step, new_failures.is_empty())
}

async fn record_summary(ctx: &BuildContext, step: StepSummary, no_new_failures: bool) -> bool {
    if !no_new_failures {
        ctx.update_flags(|flags| flags.test_failure = true).await;
    }
    ctx.record_step(step).await;
    no_new_failures
}

/// Flag `test` as having invalid results and leave the marker step.
pub async fn mark_invalid_test_results(ctx: &BuildContext, test: &TestRun) {
    ctx.update_flags(|flags| flags.invalid_test_results = true).await;
    ctx.record_step(StepSummary::new(
        test.name(),
        StepStatus::Success,
        INVALID_RESULTS_MAGIC,
    ))
    .await;
}

/// Summarize a suite that was retried without the change.
///
/// Returns whether every failure with the change also failed without it.
pub async fn summarize_test_with_patch_deapplied(ctx: &BuildContext, test: &TestRun) -> bool {
    let Some(ignored) = test.without_patch_failures_to_ignore() else {
        mark_invalid_test_results(ctx, test).await;
        let step = StepSummary::new(
            format!("{} ({SUMMARY_SUFFIX})", test.name()),
            StepStatus::Failure,
            format!(
                "\n{} (without patch) did not produce valid results, so no failures can safely be ignored",
                test.name()
            ),
        );
        return record_summary(ctx, step, false).await;
    };

    // Only suites with valid results are ever retried without the change.
    let failures = test.failures_including_retry(Phase::WithPatch).unwrap_or_default();
    let new_failures: BTreeSet<String> = failures.difference(&ignored).cloned().collect();
    debug!(
        suite = %test.name(),
        new = new_failures.len(),
        ignored = ignored.len(),
        "summarizing suite retried without patch"
    );

    let (step, no_new_failures) = summarize_new_and_ignored_failures(
        test.name(),
        &new_failures,
        &ignored,
        &test.known_flaky_summary(),
        ctx.config.retry.max_reported_failures,
    );
    record_summary(ctx, step, no_new_failures).await
}

/// Summarize a failing suite that is not retried without the change.
pub async fn summarize_failing_test_with_no_retries(ctx: &BuildContext, test: &TestRun) -> bool {
    let new_failures = test.failures_including_retry(Phase::WithPatch).unwrap_or_default();
    let (step, no_new_failures) = summarize_new_and_ignored_failures(
        test.name(),
        &new_failures,
        &BTreeSet::new(),
        &test.known_flaky_summary(),
        ctx.config.retry.max_reported_failures,
    );
    record_summary(ctx, step, no_new_failures).await
}

/// Markdown list of the failures that failed the build.
///
/// Suite headers and failure lines count towards `size_limit`; at most
/// `failure_limit` failures are listed per suite.
pub fn format_unrecoverable_failures(
    tests: &[&TestRun],
    phase: Phase,
    size_limit: usize,
    failure_limit: usize,
) -> String {
    let mut lines = vec![format!("{} Test Suite(s) failed.", tests.len())];
    let mut current_size = 0;

    for (index, test) in tests.iter().enumerate() {
        let mut failures = test.failures_including_retry(phase).unwrap_or_default();
        if let Some(ignored) = test.without_patch_failures_to_ignore() {
            failures.retain(|f| !ignored.contains(f));
        }

        let header = if failures.is_empty() {
            format!("**{}** failed.", test.name())
        } else {
            format!("**{}** failed because of:", test.name())
        };
        current_size += header.len();
        if current_size >= size_limit {
            lines.push(format!("#### ...{} more test(s)...", tests.len() - index));
            return lines.join("\n\n");
        }
        lines.push(header);

        for (idx, failure) in failures.iter().enumerate() {
            if idx >= failure_limit || current_size >= size_limit {
                let hint = format!(
                    "- ...{} more failure(s) ({} total)...",
                    failures.len() - idx,
                    failures.len()
                );
                current_size += hint.len();
                lines.push(hint);
                break;
            }
            let line = format!("- {failure}");
            current_size += line.len();
            lines.push(line);
        }
    }
    lines.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Invocation, RawTestResult, SuiteResult, TestSpec, TestStatus, Venue};
    use std::collections::BTreeMap;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(ToString::to_string).collect()
    }

    fn failing_run(name: &str, failures: &[&str]) -> TestRun {
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
        let mut run = TestRun::new(TestSpec::new(name, Venue::Remote));
        run.record_results(
            Phase::WithPatch,
            SuiteResult::create(&invocations, name, Some(prefix.as_str()), None, true)
                .expect("create"),
        )
        .expect("record");
        run
    }

    #[test]
    fn test_limit_failures_overflow_line() {
        let failures = strings(&["a", "b", "c", "d"]);
        assert_eq!(limit_failures(&failures, 4), failures);
        assert_eq!(
            limit_failures(&failures, 2),
            strings(&["a", "b", "... 2 more (4 total) ..."])
        );
    }

    #[test]
    fn test_format_step_text_drops_empty_sections() {
        let text = format_step_text(&[
            Section::Line("always".to_string()),
            Section::List("empty".to_string(), vec![]),
            Section::List("header".to_string(), strings(&["x", "y"])),
        ]);
        assert_eq!(text, "<br/>always<br/><br/>header<br/>x<br/>y<br/>");
    }

    #[test]
    fn test_summary_status_and_logs() {
        let new: BTreeSet<String> = strings(&["A.a"]).into_iter().collect();
        let (step, ok) = summarize_new_and_ignored_failures("browser_tests", &new, &BTreeSet::new(), &[], 30);
        assert!(!ok);
        assert_eq!(step.name, "browser_tests (test results summary)");
        assert_eq!(step.status, StepStatus::Failure);
        assert_eq!(step.logs["failures caused build to fail"], strings(&["[", "  \"A.a\"", "]"]));

        let ignored: BTreeSet<String> = strings(&["B.b"]).into_iter().collect();
        let (step, ok) = summarize_new_and_ignored_failures(
            "browser_tests",
            &BTreeSet::new(),
            &ignored,
            &strings(&["C.c: crbug.com/1"]),
            30,
        );
        assert!(ok);
        assert_eq!(step.status, StepStatus::Warning);
        assert!(step.text.contains(IGNORED_FAILURES_TEXT));
        assert!(step.text.ends_with(FLAKE_BUG_HINT));

        let (step, ok) =
            summarize_new_and_ignored_failures("browser_tests", &BTreeSet::new(), &BTreeSet::new(), &[], 30);
        assert!(ok);
        assert_eq!(step.status, StepStatus::Success);
        assert!(step.text.is_empty());
    }

    #[test]
    fn test_unrecoverable_failures_markdown() {
        let browser = failing_run("browser_tests", &["A.a", "B.b", "C.c", "D.d", "E.e", "F.f"]);
        let unit = failing_run("unit_tests", &[]);
        let text = format_unrecoverable_failures(&[&browser, &unit], Phase::WithPatch, 700, 4);
        assert_eq!(
            text,
            [
                "2 Test Suite(s) failed.",
                "**browser_tests** failed because of:",
                "- A.a",
                "- B.b",
                "- C.c",
                "- D.d",
                "- ...2 more failure(s) (6 total)...",
                "**unit_tests** failed.",
            ]
            .join("\n\n")
        );
    }

    #[test]
    fn test_unrecoverable_failures_size_limit() {
        let browser = failing_run("browser_tests", &["A.a", "B.b"]);
        let unit = failing_run("unit_tests", &["U.u"]);
        let text = format_unrecoverable_failures(&[&browser, &unit], Phase::WithPatch, 50, 4);
        assert_eq!(
            text,
            [
                "2 Test Suite(s) failed.",
                "**browser_tests** failed because of:",
                "- A.a",
                "- B.b",
                "#### ...1 more test(s)...",
            ]
            .join("\n\n")
        );
    }
}
