//! Legacy known-flakes service over HTTP.

use anyhow::Result;
use async_trait::async_trait;

use super::JsonEndpoint;
use crate::domain::errors::DomainResult;
use crate::domain::models::{parse_known_flakes, AnalysisConfig, KnownFlake, KnownFlakesQuery};
use crate::domain::ports::KnownFlakesService;

#[derive(Debug, Clone)]
pub struct KnownFlakesClient {
    endpoint: JsonEndpoint,
}

impl KnownFlakesClient {
    pub fn new(url: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        Ok(Self {
            endpoint: JsonEndpoint::new(url, timeout_secs)?,
        })
    }

    pub fn from_config(config: &AnalysisConfig) -> Result<Option<Self>> {
        config
            .known_flakes_url
            .as_deref()
            .map(|url| Self::new(url, config.timeout_secs))
            .transpose()
    }
}

#[async_trait]
impl KnownFlakesService for KnownFlakesClient {
    async fn query_known_flakes(&self, query: &KnownFlakesQuery) -> DomainResult<Vec<KnownFlake>> {
        let value = self.endpoint.post(query).await?;
        parse_known_flakes(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::DomainError;
    use crate::domain::models::FlakeTestRef;
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn query() -> KnownFlakesQuery {
        KnownFlakesQuery {
            project: "chromium".to_string(),
            bucket: "try".to_string(),
            builder: "linux-rel".to_string(),
            tests: vec![FlakeTestRef {
                step_ui_name: "browser_tests (with patch)".to_string(),
                test_name: "A.a".to_string(),
            }],
        }
    }

    #[tokio::test]
    async fn test_query_known_flakes() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", "/flakes")
            .match_body(Matcher::PartialJson(json!({"builder": "linux-rel"})))
            .with_status(200)
            .with_body(
                json!({
                    "flakes": [{
                        "test": {"step_ui_name": "browser_tests (with patch)", "test_name": "A.a"},
                        "affected_gerrit_changes": ["123", "234"],
                        "monorail_issue": "999",
                    }]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = KnownFlakesClient::new(format!("{}/flakes", server.url()), 5).expect("client");
        let flakes = client.query_known_flakes(&query()).await.expect("query");

        mock.assert_async().await;
        assert_eq!(flakes.len(), 1);
        assert_eq!(flakes[0].test.test_name, "A.a");
        assert_eq!(flakes[0].monorail_issue.to_string(), "999");
    }

    #[tokio::test]
    async fn test_empty_answer_knows_nothing() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/flakes")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = KnownFlakesClient::new(format!("{}/flakes", server.url()), 5).expect("client");
        assert!(client.query_known_flakes(&query()).await.expect("query").is_empty());
    }

    #[tokio::test]
    async fn test_ill_formed_answer() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/flakes")
            .with_status(200)
            .with_body(r#"{"flakes": [{"test": {"test_name": "A.a"}}]}"#)
            .create_async()
            .await;

        let client = KnownFlakesClient::new(format!("{}/flakes", server.url()), 5).expect("client");
        let err = client.query_known_flakes(&query()).await.unwrap_err();
        assert!(matches!(err, DomainError::MalformedResponse(_)));
    }
}
