//! Failure-rate analysis over HTTP.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::JsonEndpoint;
use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::models::{AnalysisConfig, FailingVariant, TestVariantFailureRate};
use crate::domain::ports::FlakinessAnalysis;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryFailureRateRequest<'a> {
    project: &'a str,
    test_variants: &'a [FailingVariant],
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryFailureRateResponse {
    #[serde(default)]
    test_variants: Vec<TestVariantFailureRate>,
}

/// Client of the failure-rate analysis service.
#[derive(Debug, Clone)]
pub struct FailureRateClient {
    endpoint: JsonEndpoint,
    project: String,
}

impl FailureRateClient {
    pub fn new(url: impl Into<String>, project: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            endpoint: JsonEndpoint::new(url, timeout_secs)?,
            project: project.into(),
        })
    }

    /// Client for the configured endpoint, if there is one.
    pub fn from_config(config: &AnalysisConfig) -> Result<Option<Self>> {
        config
            .failure_rate_url
            .as_deref()
            .map(|url| Self::new(url, config.project.as_str(), config.timeout_secs))
            .transpose()
    }
}

#[async_trait]
impl FlakinessAnalysis for FailureRateClient {
    async fn query_failure_rate(&self, variants: &[FailingVariant]) -> DomainResult<Vec<TestVariantFailureRate>> {
        let request = QueryFailureRateRequest {
            project: &self.project,
            test_variants: variants,
        };
        let value = self.endpoint.post(&request).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        let response: QueryFailureRateResponse = serde_json::from_value(value)
            .map_err(|e| DomainError::MalformedResponse(format!("failure rate response: {e}")))?;
        Ok(response.test_variants)
    }
}
