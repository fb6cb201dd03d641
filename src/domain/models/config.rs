use serde::{Deserialize, Serialize};

/// Main configuration structure for the reconciler
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct Config {
    /// Retry policy configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Flake classification thresholds
    #[serde(default)]
    pub flakes: FlakeConfig,

    /// Failure summary limits
    #[serde(default)]
    pub summary: SummaryConfig,

    /// Remote task collection
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Hardware lab scheduling
    #[serde(default)]
    pub lab: LabConfig,

    /// Flakiness analysis endpoints
    #[serde(default)]
    pub analysis: AnalysisConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Retry policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Skip retries once this many suites fail; the change is likely broken
    #[serde(default = "default_min_failed_suites_to_skip_retry")]
    pub min_failed_suites_to_skip_retry: usize,

    /// Failures listed per section of a results summary
    #[serde(default = "default_max_reported_failures")]
    pub max_reported_failures: usize,

    /// At most this many tests to retry switches to repeated isolated runs
    #[serde(default = "default_small_retry_threshold")]
    pub small_retry_threshold: usize,
}

const fn default_min_failed_suites_to_skip_retry() -> usize {
    5
}

const fn default_max_reported_failures() -> usize {
    30
}

const fn default_small_retry_threshold() -> usize {
    100
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            min_failed_suites_to_skip_retry: default_min_failed_suites_to_skip_retry(),
            max_reported_failures: default_max_reported_failures(),
            small_retry_threshold: default_small_retry_threshold(),
        }
    }
}

/// Flake classification thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct FlakeConfig {
    /// Escape hatch: when false no failure is ever forgiven as flaky
    #[serde(default = "default_true")]
    pub exonerate_flaky_failures: bool,

    /// Skip the analysis query when more variants than this are failing
    #[serde(default = "default_query_limit")]
    pub max_failing_variants: usize,

    /// Skip a suite when more of its tests than this are failing
    #[serde(default = "default_query_limit")]
    pub max_failing_tests_per_suite: usize,

    /// Rolling intervals (weekdays) in the long window
    #[serde(default = "default_long_window_intervals")]
    pub long_window_intervals: u32,

    /// Rolling intervals in the short window
    #[serde(default = "default_short_window_intervals")]
    pub short_window_intervals: u32,

    #[serde(default = "default_strong_min_flaky_verdicts")]
    pub strong_min_flaky_verdicts: u32,

    /// A flaky verdict must be this recent for strong exoneration
    #[serde(default = "default_strong_recency_hours")]
    pub strong_recency_hours: i64,

    #[serde(default = "default_strong_min_unexpected_recent_verdicts")]
    pub strong_min_unexpected_recent_verdicts: usize,

    /// Number of recent verdicts tracked per variant
    #[serde(default = "default_recent_verdict_window")]
    pub recent_verdict_window: usize,

    #[serde(default = "default_weak_min_flaky_verdicts")]
    pub weak_min_flaky_verdicts: u32,

    #[serde(default = "default_weak_min_short_window_flaky_verdicts")]
    pub weak_min_short_window_flaky_verdicts: u32,
}

const fn default_true() -> bool {
    true
}

const fn default_query_limit() -> usize {
    100
}

const fn default_long_window_intervals() -> u32 {
    5
}

const fn default_short_window_intervals() -> u32 {
    1
}

const fn default_strong_min_flaky_verdicts() -> u32 {
    4
}

const fn default_strong_recency_hours() -> i64 {
    12
}

const fn default_strong_min_unexpected_recent_verdicts() -> usize {
    7
}

const fn default_recent_verdict_window() -> usize {
    10
}

const fn default_weak_min_flaky_verdicts() -> u32 {
    3
}

const fn default_weak_min_short_window_flaky_verdicts() -> u32 {
    1
}

impl Default for FlakeConfig {
    fn default() -> Self {
        Self {
            exonerate_flaky_failures: true,
            max_failing_variants: default_query_limit(),
            max_failing_tests_per_suite: default_query_limit(),
            long_window_intervals: default_long_window_intervals(),
            short_window_intervals: default_short_window_intervals(),
            strong_min_flaky_verdicts: default_strong_min_flaky_verdicts(),
            strong_recency_hours: default_strong_recency_hours(),
            strong_min_unexpected_recent_verdicts: default_strong_min_unexpected_recent_verdicts(),
            recent_verdict_window: default_recent_verdict_window(),
            weak_min_flaky_verdicts: default_weak_min_flaky_verdicts(),
            weak_min_short_window_flaky_verdicts: default_weak_min_short_window_flaky_verdicts(),
        }
    }
}

/// Limits on the unrecoverable-failures markdown
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SummaryConfig {
    /// Maximum characters of suite headers and failure lines
    #[serde(default = "default_size_limit")]
    pub size_limit: usize,

    /// Failures listed per suite
    #[serde(default = "default_failure_limit")]
    pub failure_limit: usize,
}

const fn default_size_limit() -> usize {
    700
}

const fn default_failure_limit() -> usize {
    4
}

impl Default for SummaryConfig {
    fn default() -> Self {
        Self {
            size_limit: default_size_limit(),
            failure_limit: default_failure_limit(),
        }
    }
}

/// Remote task collection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct RemoteConfig {
    /// Polling rounds before collecting the remaining tasks one by one
    #[serde(default = "default_max_poll_rounds")]
    pub max_poll_rounds: u32,
}

const fn default_max_poll_rounds() -> u32 {
    60
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            max_poll_rounds: default_max_poll_rounds(),
        }
    }
}

/// Hardware lab scheduling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LabConfig {
    /// Lower bound on the timeout of a batched lab build
    #[serde(default = "default_lab_timeout_secs")]
    pub default_timeout_secs: u64,
}

const fn default_lab_timeout_secs() -> u64 {
    3600
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: default_lab_timeout_secs(),
        }
    }
}

/// Flakiness analysis endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct AnalysisConfig {
    /// Endpoint of the failure-rate analysis service
    #[serde(default)]
    pub failure_rate_url: Option<String>,

    /// Endpoint of the legacy known-flakes service
    #[serde(default)]
    pub known_flakes_url: Option<String>,

    /// Project whose history is queried
    #[serde(default = "default_project")]
    pub project: String,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_project() -> String {
    "chromium".to_string()
}

const fn default_timeout_secs() -> u64 {
    30
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            failure_rate_url: None,
            known_flakes_url: None,
            project: default_project(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: json or pretty
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Directory for rotated log files; stderr only when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    /// Number of days to retain logs
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

const fn default_retention_days() -> u32 {
    30
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            log_dir: None,
            retention_days: default_retention_days(),
        }
    }
}
