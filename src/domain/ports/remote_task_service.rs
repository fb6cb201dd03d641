//! Remote task-execution port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{CollectedTask, FinishedTaskSets, TaskHandle, TaskRequest};

/// The distributed task-execution service that runs sharded suites.
///
/// Dispatch never blocks on completion; completion is observed by polling
/// [`RemoteTaskService::wait_for_finished_task_set`] and then collecting.
#[async_trait]
pub trait RemoteTaskService: Send + Sync {
    /// Enqueue the shards described by `request`.
    async fn submit(&self, request: TaskRequest) -> DomainResult<TaskHandle>;

    /// Wait until at least one of `task_sets` finishes.
    ///
    /// `attempts` is the polling state from the previous call and is
    /// returned updated. An empty `finished` list means the service gave up
    /// and the caller should fall back to collecting every set.
    async fn wait_for_finished_task_set(
        &self,
        task_sets: &[String],
        attempts: u32,
    ) -> DomainResult<FinishedTaskSets>;

    /// Block until every shard of `handle` completed and return its results.
    async fn collect(&self, handle: &TaskHandle) -> DomainResult<CollectedTask>;
}
