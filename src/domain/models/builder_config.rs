//! Builder configuration reduced from one or more mirrored builder specs.

use serde::{Deserialize, Serialize};

use crate::domain::errors::{DomainError, DomainResult, InconsistentConfigError};

/// Settings of a single builder that a try builder may mirror.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderSpec {
    /// `bucket/builder` identifier.
    pub builder_id: String,
    #[serde(default = "default_true")]
    pub retry_failed_shards: bool,
    #[serde(default = "default_true")]
    pub retry_without_patch: bool,
    /// Source-side files defining which tests the builder runs.
    #[serde(default)]
    pub source_side_spec_files: Vec<String>,
}

const fn default_true() -> bool {
    true
}

impl BuilderSpec {
    pub fn new(builder_id: impl Into<String>) -> Self {
        Self {
            builder_id: builder_id.into(),
            retry_failed_shards: true,
            retry_without_patch: true,
            source_side_spec_files: Vec::new(),
        }
    }
}

/// Reduce one field over all specs, requiring every spec to agree.
pub fn reconcile_field<T, F>(specs: &[BuilderSpec], field: &str, accessor: F) -> Result<T, InconsistentConfigError>
where
    T: PartialEq + Clone,
    F: Fn(&BuilderSpec) -> T,
{
    let inconsistent = || InconsistentConfigError {
        field: field.to_string(),
        builder_ids: specs.iter().map(|s| s.builder_id.clone()).collect(),
    };

    let mut values = specs.iter().map(&accessor);
    let first = values.next().ok_or_else(inconsistent)?;
    if values.all(|v| v == first) {
        Ok(first)
    } else {
        Err(inconsistent())
    }
}

/// Effective configuration of the running builder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuilderConfig {
    pub builder_ids: Vec<String>,
    pub retry_failed_shards: bool,
    pub retry_without_patch: bool,
    pub source_side_spec_files: Vec<String>,
}

impl BuilderConfig {
    pub fn from_specs(specs: &[BuilderSpec]) -> DomainResult<Self> {
        if specs.is_empty() {
            return Err(DomainError::Precondition(
                "a builder config needs at least one builder spec".to_string(),
            ));
        }

        let mut spec_files: Vec<String> = specs
            .iter()
            .flat_map(|s| s.source_side_spec_files.iter().cloned())
            .collect();
        spec_files.sort();
        spec_files.dedup();

        Ok(Self {
            builder_ids: specs.iter().map(|s| s.builder_id.clone()).collect(),
            retry_failed_shards: reconcile_field(specs, "retry_failed_shards", |s| s.retry_failed_shards)?,
            retry_without_patch: reconcile_field(specs, "retry_without_patch", |s| s.retry_without_patch)?,
            source_side_spec_files: spec_files,
        })
    }

    /// Spec files touched by the change under test.
    pub fn affected_spec_files<'a>(&self, affected_files: &'a [String]) -> Vec<&'a str> {
        let mut affected: Vec<&str> = affected_files
            .iter()
            .filter(|f| self.source_side_spec_files.contains(*f))
            .map(String::as_str)
            .collect();
        affected.sort_unstable();
        affected
    }
}
