//! Configuration loading from files and `TRYJOB_` environment variables.

use std::io::Write;

use tempfile::NamedTempFile;
use tryjob_reconciler::infrastructure::config::ConfigLoader;

const PROJECT_CONFIG: &str = r"
retry:
  min_failed_suites_to_skip_retry: 3
summary:
  failure_limit: 6
analysis:
  failure_rate_url: https://analysis.example.com/prpc/QueryFailureRate
  project: chromium
logging:
  level: debug
";

fn config_file(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp file");
    file.write_all(content.as_bytes()).expect("write");
    file.flush().expect("flush");
    file
}

#[test]
fn test_load_from_file_merges_defaults() {
    let file = config_file(PROJECT_CONFIG);

    let config = temp_env::with_vars_unset(
        ["TRYJOB_RETRY__MIN_FAILED_SUITES_TO_SKIP_RETRY", "TRYJOB_LOGGING__LEVEL"],
        || ConfigLoader::load_from_file(file.path()),
    )
    .expect("config should load");

    assert_eq!(config.retry.min_failed_suites_to_skip_retry, 3);
    assert_eq!(config.summary.failure_limit, 6);
    assert_eq!(config.summary.size_limit, 700, "unset fields keep defaults");
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.analysis.project, "chromium");
    assert!(config.analysis.known_flakes_url.is_none());
}

#[test]
fn test_environment_overrides_file() {
    let file = config_file(PROJECT_CONFIG);

    let config = temp_env::with_vars(
        [
            ("TRYJOB_RETRY__MIN_FAILED_SUITES_TO_SKIP_RETRY", Some("9")),
            ("TRYJOB_LOGGING__LEVEL", Some("warn")),
        ],
        || ConfigLoader::load_from_file(file.path()),
    )
    .expect("config should load");

    assert_eq!(config.retry.min_failed_suites_to_skip_retry, 9);
    assert_eq!(config.logging.level, "warn");
    assert_eq!(config.summary.failure_limit, 6);
}

#[test]
fn test_invalid_environment_value_is_rejected() {
    let file = config_file(PROJECT_CONFIG);

    let result = temp_env::with_var("TRYJOB_RETRY__MIN_FAILED_SUITES_TO_SKIP_RETRY", Some("0"), || {
        ConfigLoader::load_from_file(file.path())
    });

    let err = result.expect_err("zero threshold must be rejected");
    assert!(format!("{err:#}").contains("min_failed_suites_to_skip_retry"));
}

#[test]
fn test_invalid_endpoint_in_file_is_rejected() {
    let file = config_file("analysis:\n  known_flakes_url: flakes.example.com\n");

    let result = temp_env::with_vars_unset(["TRYJOB_ANALYSIS__KNOWN_FLAKES_URL"], || {
        ConfigLoader::load_from_file(file.path())
    });

    assert!(result.is_err());
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config = temp_env::with_vars_unset(
        ["TRYJOB_RETRY__MIN_FAILED_SUITES_TO_SKIP_RETRY", "TRYJOB_LOGGING__LEVEL"],
        || ConfigLoader::load_from_file(dir.path().join("absent.yaml")),
    )
    .expect("missing files are optional");

    assert_eq!(config.retry.min_failed_suites_to_skip_retry, 5);
    assert_eq!(config.logging.level, "info");
}
