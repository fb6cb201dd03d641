//! Compile/build port.

use async_trait::async_trait;

use crate::domain::errors::DomainResult;
use crate::domain::models::{CompileOutcome, Phase};

/// Compiles and isolates test targets.
#[async_trait]
pub trait BuildService: Send + Sync {
    /// Compile `targets` for `phase` and return artifact references.
    ///
    /// A failed compile is reported through [`CompileOutcome::status`];
    /// `Err` is reserved for infrastructure failures.
    async fn compile(&self, targets: &[String], phase: Phase) -> DomainResult<CompileOutcome>;

    /// Wipe the output directory so the next build starts clean.
    async fn clobber(&self) -> DomainResult<()>;
}
