//! Local test execution port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{LocalOutcome, LocalRunRequest};

/// Runs a suite as a process on the build machine.
#[async_trait]
pub trait LocalTestRunner: Send + Sync {
    async fn run(&self, request: LocalRunRequest) -> DomainResult<LocalOutcome>;
}
