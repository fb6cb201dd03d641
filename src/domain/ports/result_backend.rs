//! Result ingestion backend port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{Exoneration, Invocation};

/// The structured test-result store.
#[async_trait]
pub trait ResultBackend: Send + Sync {
    /// Whether results are available at all for this build.
    fn enabled(&self) -> bool;

    /// Fetch the variants with unexpected results from `invocation_names`.
    async fn query(&self, invocation_names: &[String]) -> DomainResult<Vec<Invocation>>;

    /// Make invocations part of the build's own invocation.
    async fn include_invocations(&self, invocation_names: &[String]) -> DomainResult<()>;

    /// Record failures that must not count against the change.
    ///
    /// One-way: exonerations are never read back within a build.
    async fn exonerate(&self, exonerations: Vec<Exoneration>) -> DomainResult<()>;
}
