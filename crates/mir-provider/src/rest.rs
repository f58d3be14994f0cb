//! reqwest adapter for the provider's REST surface.
//!
//! Retries stay inside this adapter: transient failures (network, 5xx, rate
//! limits) are retried with exponential backoff, honoring `Retry-After` when
//! the provider sends one. Beyond the attempt budget the error propagates and
//! the page driver fails the current object-run — the driver itself never
//! loops on rate limits.

use mir_schemas::{ListParams, ObjectPage};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::warn;

use crate::{ProviderError, RemoteClient};

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 250,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        if let Some(secs) = retry_after_secs {
            return Duration::from_secs(secs);
        }
        Duration::from_millis(self.base_delay_ms.saturating_mul(1u64 << attempt.min(10)))
    }
}

/// Live HTTP adapter. The API credential is passed in by the caller (config
/// layer); it is never logged.
#[derive(Debug, Clone)]
pub struct RestRemoteClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    retry: RetryPolicy,
}

impl RestRemoteClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self::new_with_retry(api_key, base_url, RetryPolicy::default())
    }

    pub fn new_with_retry(api_key: String, base_url: String, retry: RetryPolicy) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url,
            retry,
        }
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn get_json(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Value, ProviderError> {
        let mut attempt: u32 = 0;
        loop {
            match self.get_json_once(url, query).await {
                Ok(v) => return Ok(v),
                Err(err) if err.is_transient() && attempt + 1 < self.retry.max_attempts => {
                    let retry_after = match &err {
                        ProviderError::RateLimited { retry_after_secs } => *retry_after_secs,
                        _ => None,
                    };
                    let delay = self.retry.delay_for(attempt, retry_after);
                    warn!(
                        url,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "transient provider error, retrying: {err}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn get_json_once(
        &self,
        url: &str,
        query: &[(String, String)],
    ) -> Result<Value, ProviderError> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .query(query)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = resp.status();
        if status.as_u16() == 429 {
            let retry_after_secs = resp
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok());
            return Err(ProviderError::RateLimited { retry_after_secs });
        }
        if status.as_u16() == 401 {
            return Err(ProviderError::Auth(error_message(resp).await));
        }
        if status.as_u16() == 403 {
            return Err(ProviderError::PermissionDenied(error_message(resp).await));
        }
        if status.is_server_error() {
            return Err(ProviderError::Transport(format!(
                "status={} {}",
                status.as_u16(),
                error_message(resp).await
            )));
        }
        if !status.is_success() {
            return Err(ProviderError::Api {
                status: Some(status.as_u16()),
                message: error_message(resp).await,
            });
        }

        resp.json::<Value>()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

/// Best-effort extraction of `{ "error": { "message": … } }`.
async fn error_message(resp: reqwest::Response) -> String {
    match resp.json::<ErrorEnvelope>().await {
        Ok(env) => env.error.and_then(|e| e.message).unwrap_or_default(),
        Err(_) => String::new(),
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: Option<ErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListEnvelope {
    #[serde(default)]
    data: Vec<Value>,
    #[serde(default)]
    has_more: bool,
}

fn list_query(params: &ListParams) -> Vec<(String, String)> {
    let mut query = vec![("limit".to_string(), params.limit.to_string())];
    if let Some(after) = &params.starting_after {
        query.push(("starting_after".to_string(), after.clone()));
    }
    if let Some(gte) = params.created_gte {
        query.push(("created[gte]".to_string(), gte.to_string()));
    }
    if let Some(lte) = params.created_lte {
        query.push(("created[lte]".to_string(), lte.to_string()));
    }
    for (k, v) in &params.extra {
        query.push((k.clone(), v.clone()));
    }
    query
}

#[async_trait::async_trait]
impl RemoteClient for RestRemoteClient {
    fn source_name(&self) -> &'static str {
        "rest"
    }

    async fn list(&self, path: &str, params: &ListParams) -> Result<ObjectPage, ProviderError> {
        let url = self.build_url(path);
        let body = self.get_json(&url, &list_query(params)).await?;
        let envelope: ListEnvelope = serde_json::from_value(body)
            .map_err(|e| ProviderError::Decode(format!("list envelope: {e}")))?;
        Ok(ObjectPage {
            data: envelope.data,
            has_more: envelope.has_more,
        })
    }

    async fn retrieve(&self, path: &str, id: &str) -> Result<Value, ProviderError> {
        let url = format!("{}/{id}", self.build_url(path));
        self.get_json(&url, &[]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn fast_client(base_url: String) -> RestRemoteClient {
        RestRemoteClient::new_with_retry(
            "sk_test_key".to_string(),
            base_url,
            RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 1,
            },
        )
    }

    #[tokio::test]
    async fn list_sends_pagination_query_and_decodes_envelope() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/v1/customers")
                .query_param("limit", "100")
                .query_param("starting_after", "cus_50")
                .query_param("created[gte]", "1715000000");
            then.status(200).json_body(json!({
                "object": "list",
                "data": [
                    {"id": "cus_51", "object": "customer", "created": 1715000100},
                    {"id": "cus_52", "object": "customer", "created": 1715000200}
                ],
                "has_more": true
            }));
        });

        let client = fast_client(server.base_url());
        let params = ListParams {
            limit: 100,
            starting_after: Some("cus_50".to_string()),
            created_gte: Some(1_715_000_000),
            ..Default::default()
        };
        let page = client.list("/v1/customers", &params).await.unwrap();

        mock.assert();
        assert_eq!(page.data.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.last_id(), Some("cus_52"));
    }

    #[tokio::test]
    async fn rate_limit_is_retried_then_succeeds() {
        let server = MockServer::start();
        let limited = server.mock(|when, then| {
            when.method(GET).path("/v1/plans").query_param("limit", "100");
            then.status(429).header("retry-after", "0");
        });

        let client = fast_client(server.base_url());
        let params = ListParams::with_limit(100);
        let err = client.list("/v1/plans", &params).await.unwrap_err();
        // All attempts consumed against a persistently limited endpoint.
        assert!(err.is_rate_limited());
        assert_eq!(limited.hits(), 3);
    }

    #[tokio::test]
    async fn auth_errors_are_not_retried() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/v1/customers");
            then.status(401)
                .json_body(json!({"error": {"message": "Invalid API Key provided"}}));
        });

        let client = fast_client(server.base_url());
        let err = client
            .list("/v1/customers", &ListParams::with_limit(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
        assert_eq!(mock.hits(), 1, "auth failures must not burn retries");
    }

    #[tokio::test]
    async fn forbidden_maps_to_permission_denied() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/charges");
            then.status(403)
                .json_body(json!({"error": {"message": "restricted key"}}));
        });

        let client = fast_client(server.base_url());
        let err = client
            .list("/v1/charges", &ListParams::with_limit(100))
            .await
            .unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn server_errors_exhaust_retries_as_transport() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/v1/invoices");
            then.status(502);
        });

        let client = fast_client(server.base_url());
        let err = client
            .list("/v1/invoices", &ListParams::with_limit(100))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Transport(_)));
        assert_eq!(mock.hits(), 3);
    }

    #[tokio::test]
    async fn retrieve_joins_the_id_onto_the_path() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/v1/customers/cus_9");
            then.status(200)
                .json_body(json!({"id": "cus_9", "object": "customer"}));
        });

        let client = fast_client(server.base_url());
        let obj = client.retrieve("/v1/customers", "cus_9").await.unwrap();

        mock.assert();
        assert_eq!(obj["id"], "cus_9");
    }
}
