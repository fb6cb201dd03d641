//! Requests and responses exchanged with the execution venues.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::test_spec::TaskTimeouts;

/// A request to run a suite on the remote task-execution service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Task name, the suite's step name for the phase.
    pub name: String,
    pub suite: String,
    /// Content digest of the isolated build output to run.
    pub artifact: String,
    /// Total shard count of the task.
    pub shards: u32,
    /// Shards to actually trigger; all of `0..shards` for a full run.
    pub shard_indices: Vec<u32>,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub dimensions: BTreeMap<String, String>,
    pub timeouts: TaskTimeouts,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Whether the service may reuse results of an identical earlier task.
    pub idempotent: bool,
}

/// Handle for a dispatched set of shard tasks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    pub task_set_id: String,
    pub task_ids: Vec<String>,
    pub shard_indices: Vec<u32>,
    /// Result backend invocations the shards will report into.
    #[serde(default)]
    pub invocation_names: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ShardState {
    #[default]
    Completed,
    TimedOut,
    BotDied,
    Expired,
}

/// Completion record of a single shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardResult {
    pub index: u32,
    #[serde(default)]
    pub state: ShardState,
    /// Harness exit code; absent when the shard never finished.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl ShardResult {
    pub fn failed(&self) -> bool {
        self.state != ShardState::Completed || self.exit_code != Some(0)
    }
}

/// Everything known about a collected task set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectedTask {
    pub shards: Vec<ShardResult>,
    /// Result backend invocations the shards reported into.
    #[serde(default)]
    pub invocation_names: Vec<String>,
}

impl CollectedTask {
    pub fn failed_shards(&self) -> Vec<u32> {
        let mut failed: Vec<u32> = self.shards.iter().filter(|s| s.failed()).map(|s| s.index).collect();
        failed.sort_unstable();
        failed
    }

    pub fn failure_on_exit(&self) -> bool {
        self.shards.iter().any(ShardResult::failed)
    }
}

/// Outcome of one polling round over outstanding task sets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinishedTaskSets {
    /// Task set ids that completed, in completion order.
    pub finished: Vec<String>,
    /// Polling attempts consumed so far, threaded into the next call.
    pub attempts: u32,
}

/// A suite submitted to the hardware lab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabRequest {
    pub suite: String,
    pub step_name: String,
    pub artifact: String,
    pub timeout_secs: u64,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Lab verdict for one submitted suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabResponse {
    pub step_name: String,
    pub passed: bool,
    #[serde(default)]
    pub invocation_names: Vec<String>,
}

/// A suite run as a process on the build machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRunRequest {
    pub suite: String,
    pub step_name: String,
    pub target: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalOutcome {
    pub exit_code: i32,
    #[serde(default)]
    pub invocation_names: Vec<String>,
}
