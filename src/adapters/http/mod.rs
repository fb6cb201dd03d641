//! HTTP clients for the flakiness services.

pub mod failure_rate;
pub mod known_flakes;

pub use failure_rate::FailureRateClient;
pub use known_flakes::KnownFlakesClient;

use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client as ReqwestClient;
use serde::Serialize;
use tracing::debug;

use crate::domain::errors::{DomainError, DomainResult};

/// JSON-over-HTTP endpoint shared by both flakiness clients.
#[derive(Debug, Clone)]
pub(crate) struct JsonEndpoint {
    http_client: ReqwestClient,
    url: String,
}

impl JsonEndpoint {
    pub(crate) fn new(url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let http_client = ReqwestClient::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http_client,
            url: url.into(),
        })
    }

    /// POST `body` and return the decoded JSON answer.
    ///
    /// Transport errors and error statuses map to `ServiceUnavailable`; an
    /// answer that is not JSON maps to `MalformedResponse`.
    pub(crate) async fn post<B: Serialize + Sync>(&self, body: &B) -> DomainResult<serde_json::Value> {
        debug!(url = %self.url, "posting query");
        let response = self
            .http_client
            .post(&self.url)
            .header("accept", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| DomainError::ServiceUnavailable(format!("{}: {e}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            return Err(DomainError::ServiceUnavailable(format!(
                "{} answered {status}: {body}",
                self.url
            )));
        }

        let text = response
            .text()
            .await
            .map_err(|e| DomainError::ServiceUnavailable(format!("{}: {e}", self.url)))?;
        parse_json_body(&text)
    }
}

/// Decode a JSON body, tolerating the `)]}'` guard prefix some RPC servers
/// prepend.
pub(crate) fn parse_json_body(text: &str) -> DomainResult<serde_json::Value> {
    let text = text.strip_prefix(")]}'").unwrap_or(text).trim_start();
    if text.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(text).map_err(|e| DomainError::MalformedResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_json_body() {
        assert_eq!(
            parse_json_body(")]}'\n{\"a\": 1}").expect("parse"),
            serde_json::json!({"a": 1})
        );
        assert_eq!(parse_json_body("").expect("parse"), serde_json::Value::Null);
        assert!(matches!(
            parse_json_body("<html>"),
            Err(DomainError::MalformedResponse(_))
        ));
    }
}
