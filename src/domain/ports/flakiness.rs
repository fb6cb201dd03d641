//! Flakiness analysis ports.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{FailingVariant, KnownFlake, KnownFlakesQuery, TestVariantFailureRate};

/// Statistical failure-rate analysis of test variants.
#[async_trait]
pub trait FlakinessAnalysis: Send + Sync {
    /// Interval statistics and recent verdicts for each failing variant.
    ///
    /// Variants the service knows nothing about are simply absent from the
    /// response.
    async fn query_failure_rate(&self, variants: &[FailingVariant]) -> DomainResult<Vec<TestVariantFailureRate>>;
}

/// The legacy service listing tests known to be flaky at tip of tree.
#[async_trait]
pub trait KnownFlakesService: Send + Sync {
    async fn query_known_flakes(&self, query: &KnownFlakesQuery) -> DomainResult<Vec<KnownFlake>>;
}
