//! Build verdicts and the structured records emitted along the way.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildStatus {
    Success,
    Failure,
    InfraFailure,
}

impl BuildStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::InfraFailure => "INFRA_FAILURE",
        }
    }
}

/// Final verdict handed back to the host: a status plus markdown summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawResult {
    pub status: BuildStatus,
    #[serde(default)]
    pub summary_markdown: String,
}

impl RawResult {
    pub fn success() -> Self {
        Self {
            status: BuildStatus::Success,
            summary_markdown: String::new(),
        }
    }

    pub fn failure(summary_markdown: impl Into<String>) -> Self {
        Self {
            status: BuildStatus::Failure,
            summary_markdown: summary_markdown.into(),
        }
    }

    pub fn infra_failure(summary_markdown: impl Into<String>) -> Self {
        Self {
            status: BuildStatus::InfraFailure,
            summary_markdown: summary_markdown.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == BuildStatus::Success
    }
}

/// Result of compiling a set of targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompileOutcome {
    pub status: BuildStatus,
    #[serde(default)]
    pub summary_markdown: String,
    /// Artifact reference (content digest) per built target.
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
}

impl CompileOutcome {
    pub fn into_raw_result(self) -> RawResult {
        RawResult {
            status: self.status,
            summary_markdown: self.summary_markdown,
        }
    }
}

/// Signals recorded for downstream tooling about how the try job ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TryjobFlags {
    pub invalid_test_results: bool,
    pub test_failure: bool,
    pub compile_failure: bool,
    /// The commit queue should not retry this build.
    pub do_not_retry: bool,
    pub clobber_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Success,
    Warning,
    Failure,
}

/// A user-visible record such as a per-suite results summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSummary {
    pub name: String,
    pub status: StepStatus,
    pub text: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub logs: BTreeMap<String, Vec<String>>,
}

impl StepSummary {
    pub fn new(name: impl Into<String>, status: StepStatus, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            text: text.into(),
            logs: BTreeMap::new(),
        }
    }
}
