//! Domain errors for the try-job reconciliation engine.

use thiserror::Error;

/// Raised when mirrored builder specs disagree on a field that must be
/// uniform across all of them.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Inconsistent value for '{field}' across builders: {}", .builder_ids.join(", "))]
pub struct InconsistentConfigError {
    /// Name of the field whose values differ.
    pub field: String,
    /// Ids of every builder that contributed a value, in input order.
    pub builder_ids: Vec<String>,
}

/// Domain-level errors that can occur while running and reconciling tests.
#[derive(Debug, Error)]
pub enum DomainError {
    /// The environment or a collaborating service is broken.
    #[error("Infrastructure failure: {0}")]
    InfraFailure(String),

    /// Work for a suite could not be dispatched (e.g. a missing artifact).
    #[error("Failed to dispatch {suite}: {reason}")]
    Dispatch { suite: String, reason: String },

    /// A caller broke an ordering or state contract.
    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error(transparent)]
    InconsistentConfig(#[from] InconsistentConfigError),

    /// An optional analysis service could not be reached.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// An optional analysis service answered with data we cannot use.
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// The test harness for a suite exited unsuccessfully.
    #[error("Test step failed: {suite}")]
    TestStepFailed { suite: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl DomainError {
    /// Whether the error must bypass test-level reasoning and surface as an
    /// infrastructure verdict.
    pub const fn is_infra(&self) -> bool {
        matches!(
            self,
            Self::InfraFailure(_) | Self::Dispatch { .. } | Self::ServiceUnavailable(_)
        )
    }
}

pub type DomainResult<T> = Result<T, DomainError>;

impl From<serde_json::Error> for DomainError {
    fn from(err: serde_json::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for DomainError {
    fn from(err: serde_yaml::Error) -> Self {
        DomainError::SerializationError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inconsistent_config_lists_builders() {
        let err = InconsistentConfigError {
            field: "retry_failed_shards".to_string(),
            builder_ids: vec!["try/linux-rel".to_string(), "ci/Linux Tests".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Inconsistent value for 'retry_failed_shards' across builders: try/linux-rel, ci/Linux Tests"
        );
    }

    #[test]
    fn test_infra_classification() {
        assert!(DomainError::InfraFailure("bot died".into()).is_infra());
        assert!(DomainError::Dispatch {
            suite: "browser_tests".into(),
            reason: "missing artifact".into()
        }
        .is_infra());
        assert!(!DomainError::TestStepFailed { suite: "x".into() }.is_infra());
        assert!(!DomainError::Precondition("x".into()).is_infra());
    }
}
