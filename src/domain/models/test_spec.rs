//! Static configuration of one test suite.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Where a suite executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Venue {
    /// A process on the build machine, run sequentially.
    Local,
    /// The remote task-execution service, dispatched in parallel.
    #[default]
    Remote,
    /// A specialized hardware lab that batches and retries on its own.
    Lab,
}

impl Venue {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
            Self::Lab => "lab",
        }
    }

    /// Only remotely executed suites can be usefully retried by shard.
    pub const fn supports_shard_retry(&self) -> bool {
        matches!(self, Self::Remote)
    }
}

/// Which subset of the suite's tests to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TestSelection {
    #[default]
    Full,
    /// Regression test selection: only tests likely affected by the change.
    Rts,
    /// Everything regression test selection would have skipped.
    InvertedRts,
}

/// Sampling policy for suites that run only on a share of builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentPolicy {
    /// Share of builds, 0..=100, in which the suite runs.
    pub percentage: u8,
}

/// Identity used to bucket a build into an experiment.
#[derive(Debug, Clone, Copy)]
pub struct ExperimentKey<'a> {
    pub builder: &'a str,
    pub change_number: Option<u64>,
    pub build_number: Option<u64>,
}

impl ExperimentPolicy {
    /// Deterministically decide whether `test_name` is in the experiment for
    /// this build.
    ///
    /// The builder, change (or build) number, and test name are hashed; the
    /// first two bytes of the digest form a little-endian bucket in
    /// `0..=0xffff` compared against the configured percentage.
    pub fn is_in_experiment(&self, key: &ExperimentKey<'_>, test_name: &str) -> bool {
        let percentage = u64::from(self.percentage.min(100));
        let id = key
            .change_number
            .or(key.build_number)
            .map_or_else(|| "0".to_string(), |n| n.to_string());

        let mut hasher = Sha256::new();
        hasher.update(key.builder.as_bytes());
        hasher.update(id.as_bytes());
        hasher.update(test_name.as_bytes());
        let digest = hasher.finalize();
        let bucket = u64::from(u16::from_le_bytes([digest[0], digest[1]]));

        percentage * 0xffff >= bucket * 100
    }
}

/// Per-suite run options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOptions {
    /// Explicit repeat count; when unset retries may pick their own.
    #[serde(default)]
    pub repeat_count: Option<u32>,
    /// In-harness retry limit for failing tests.
    #[serde(default)]
    pub retry_limit: Option<u32>,
    /// Whether disabled tests are also run.
    #[serde(default)]
    pub run_disabled: bool,
    /// Explicit test filter applied to every phase.
    #[serde(default)]
    pub test_filter: Vec<String>,
}

/// Timeouts passed through to the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskTimeouts {
    #[serde(default = "default_hard_timeout")]
    pub hard_secs: u64,
    #[serde(default = "default_io_timeout")]
    pub io_secs: u64,
}

const fn default_hard_timeout() -> u64 {
    3600
}

const fn default_io_timeout() -> u64 {
    1200
}

impl Default for TaskTimeouts {
    fn default() -> Self {
        Self {
            hard_secs: default_hard_timeout(),
            io_secs: default_io_timeout(),
        }
    }
}

/// Everything needed to run one suite, independent of its results.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestSpec {
    /// Suite name as it appears in step names.
    pub name: String,
    /// Build target providing the suite's binary and data.
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub venue: Venue,
    #[serde(default = "default_shards")]
    pub shards: u32,
    /// Prefix shared by every test id of the suite.
    #[serde(default)]
    pub test_id_prefix: Option<String>,
    /// A failed run of this suite aborts collection of its group.
    #[serde(default)]
    pub abort_on_failure: bool,
    #[serde(default)]
    pub experiment: Option<ExperimentPolicy>,
    #[serde(default)]
    pub selection: TestSelection,
    #[serde(default)]
    pub options: TestOptions,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    #[serde(default)]
    pub timeouts: TaskTimeouts,
    /// Timeout requested from the lab, in seconds.
    #[serde(default)]
    pub lab_timeout_secs: Option<u64>,
    /// Arguments always passed to the test binary.
    #[serde(default)]
    pub args: Vec<String>,
}

const fn default_shards() -> u32 {
    1
}

impl TestSpec {
    pub fn new(name: impl Into<String>, venue: Venue) -> Self {
        let name = name.into();
        Self {
            target: name.clone(),
            name,
            venue,
            shards: default_shards(),
            test_id_prefix: None,
            abort_on_failure: false,
            experiment: None,
            selection: TestSelection::default(),
            options: TestOptions::default(),
            dimensions: BTreeMap::new(),
            timeouts: TaskTimeouts::default(),
            lab_timeout_secs: None,
            args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_shards(mut self, shards: u32) -> Self {
        self.shards = shards.max(1);
        self
    }

    #[must_use]
    pub fn with_experiment(mut self, percentage: u8) -> Self {
        self.experiment = Some(ExperimentPolicy { percentage });
        self
    }

    #[must_use]
    pub fn with_test_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.test_id_prefix = Some(prefix.into());
        self
    }

    #[must_use]
    pub const fn aborting_on_failure(mut self) -> Self {
        self.abort_on_failure = true;
        self
    }

    pub const fn is_experimental(&self) -> bool {
        self.experiment.is_some()
    }

    /// Remote tasks land on Windows bots, which have a shorter command line.
    pub fn dispatches_to_windows(&self) -> bool {
        self.dimensions
            .get("os")
            .is_some_and(|os| os.starts_with("Windows"))
    }

    /// Longest test filter, in characters, accepted on the command line.
    pub fn test_filter_char_limit(&self) -> usize {
        if self.dispatches_to_windows() {
            6000
        } else {
            90000
        }
    }
}
