//! Test phases of a try job.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One stage of testing a change.
///
/// Phases run in a fixed order: `WithPatch`, then `RetryShardsWithPatch`
/// for suites that need it, then `WithoutPatch` for suites that still fail,
/// and `RetryShardsWithoutPatch` only when explicitly requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// The change under test is applied.
    WithPatch,
    /// Failed shards of `WithPatch` rerun with the change applied.
    RetryShardsWithPatch,
    /// The change is deapplied and failing suites rerun at tip of tree.
    WithoutPatch,
    /// Failed shards of `WithoutPatch` rerun.
    RetryShardsWithoutPatch,
}

impl Phase {
    pub const ALL: [Self; 4] = [
        Self::WithPatch,
        Self::RetryShardsWithPatch,
        Self::WithoutPatch,
        Self::RetryShardsWithoutPatch,
    ];

    /// Suffix used in step names, e.g. `browser_tests (with patch)`.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::WithPatch => "with patch",
            Self::RetryShardsWithPatch => "retry shards with patch",
            Self::WithoutPatch => "without patch",
            Self::RetryShardsWithoutPatch => "retry shards without patch",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().replace(['_', '-'], " ").as_str() {
            "with patch" => Some(Self::WithPatch),
            "retry shards with patch" => Some(Self::RetryShardsWithPatch),
            "without patch" => Some(Self::WithoutPatch),
            "retry shards without patch" => Some(Self::RetryShardsWithoutPatch),
            _ => None,
        }
    }

    /// The retry-shards phase that follows this one.
    pub const fn retry_shards(self) -> Self {
        match self {
            Self::WithPatch | Self::RetryShardsWithPatch => Self::RetryShardsWithPatch,
            Self::WithoutPatch | Self::RetryShardsWithoutPatch => Self::RetryShardsWithoutPatch,
        }
    }

    /// The phase a retry-shards phase retries.
    pub const fn base(self) -> Self {
        match self {
            Self::WithPatch | Self::RetryShardsWithPatch => Self::WithPatch,
            Self::WithoutPatch | Self::RetryShardsWithoutPatch => Self::WithoutPatch,
        }
    }

    pub const fn is_retry_shards(self) -> bool {
        matches!(self, Self::RetryShardsWithPatch | Self::RetryShardsWithoutPatch)
    }

    /// Whether the change under test is applied in this phase.
    pub const fn is_patched(self) -> bool {
        matches!(self, Self::WithPatch | Self::RetryShardsWithPatch)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_suffixes() {
        assert_eq!(Phase::WithPatch.to_string(), "with patch");
        assert_eq!(Phase::RetryShardsWithPatch.to_string(), "retry shards with patch");
        assert_eq!(Phase::WithoutPatch.to_string(), "without patch");
        assert_eq!(
            Phase::RetryShardsWithoutPatch.to_string(),
            "retry shards without patch"
        );
    }

    #[test]
    fn test_round_trips_through_suffix() {
        for phase in Phase::ALL {
            assert_eq!(Phase::from_str(phase.as_str()), Some(phase));
        }
        assert_eq!(Phase::from_str("retry_shards_with_patch"), Some(Phase::RetryShardsWithPatch));
        assert_eq!(Phase::from_str("sideways"), None);
    }

    #[test]
    fn test_retry_shards_mapping() {
        assert_eq!(Phase::WithPatch.retry_shards(), Phase::RetryShardsWithPatch);
        assert_eq!(Phase::WithoutPatch.retry_shards(), Phase::RetryShardsWithoutPatch);
        assert_eq!(Phase::RetryShardsWithPatch.base(), Phase::WithPatch);
        assert!(Phase::RetryShardsWithPatch.is_patched());
        assert!(!Phase::WithoutPatch.is_patched());
        assert!(Phase::RetryShardsWithoutPatch.is_retry_shards());
    }
}
