//! Source checkout port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;

/// Access to the checkout holding the change under test.
#[async_trait]
pub trait SourceCheckout: Send + Sync {
    /// Paths, relative to the checkout root, modified by the change.
    async fn affected_files(&self) -> DomainResult<Vec<String>>;

    /// Revert the change so the checkout matches tip of tree.
    ///
    /// Called at most once per build, before the `without patch` rebuild.
    async fn deapply_patch(&self) -> DomainResult<()>;
}
