//! Hardware lab port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{LabRequest, LabResponse};

/// A specialized hardware lab that runs suites in batches.
///
/// The lab owns retries of its own; the engine only submits and waits.
#[async_trait]
pub trait LabService: Send + Sync {
    /// Submit all requests as one batch and return the batch id.
    async fn schedule_suites(&self, requests: Vec<LabRequest>, timeout_secs: u64) -> DomainResult<String>;

    /// Wait for a batch to finish and return one response per request.
    async fn wait_on_suites(&self, batch_id: &str, timeout_secs: u64) -> DomainResult<Vec<LabResponse>>;
}
