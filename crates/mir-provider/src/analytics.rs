//! Analytical-query transport: submit a SQL-like query, poll the run until
//! terminal, download the result file, parse CSV rows.
//!
//! The engine builds the query text (cursor-tuple WHERE + ORDER BY) and owns
//! normalization; this module only moves bytes and parses.

use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::ProviderError;

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryRunStatus {
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl QueryRunStatus {
    pub fn parse(s: &str) -> Result<Self, ProviderError> {
        match s {
            "running" => Ok(QueryRunStatus::Running),
            "succeeded" => Ok(QueryRunStatus::Succeeded),
            "failed" => Ok(QueryRunStatus::Failed),
            "canceled" => Ok(QueryRunStatus::Canceled),
            other => Err(ProviderError::Decode(format!(
                "unknown query-run status: {other:?}"
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, QueryRunStatus::Running)
    }
}

#[derive(Debug, Clone)]
pub struct QueryRunState {
    pub status: QueryRunStatus,
    pub file_id: Option<String>,
    pub error: Option<String>,
}

#[async_trait::async_trait]
pub trait AnalyticsClient: Send + Sync {
    async fn create_query_run(&self, sql: &str) -> Result<String, ProviderError>;

    async fn get_query_run(&self, id: &str) -> Result<QueryRunState, ProviderError>;

    /// Download the result CSV for a succeeded run.
    async fn download_file(&self, file_id: &str) -> Result<String, ProviderError>;
}

/// Poll until the run is terminal or `timeout` elapses.
pub async fn poll_query_run(
    client: &dyn AnalyticsClient,
    id: &str,
    interval: Duration,
    timeout: Duration,
) -> Result<QueryRunState, ProviderError> {
    let deadline = Instant::now() + timeout;
    loop {
        let state = client.get_query_run(id).await?;
        if state.status.is_terminal() {
            return Ok(state);
        }
        if Instant::now() + interval > deadline {
            return Err(ProviderError::Transport(format!(
                "query run {id} still running after {}s",
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(interval).await;
    }
}

// ---------------------------------------------------------------------------
// CSV parsing
// ---------------------------------------------------------------------------

/// Parse result CSV into one map per row, keyed by lower-cased header.
///
/// Headers are case-insensitive and order can vary between result files;
/// the engine's normalizer addresses columns by name, never by position.
pub fn parse_csv_rows(csv_text: &str) -> Result<Vec<BTreeMap<String, String>>, ProviderError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(csv_text.as_bytes());

    let headers: Vec<String> = rdr
        .headers()
        .map_err(|e| ProviderError::Decode(format!("csv header: {e}")))?
        .iter()
        .map(|h| h.trim().to_ascii_lowercase())
        .collect();

    let mut rows = Vec::new();
    for rec in rdr.records() {
        let rec = rec.map_err(|e| ProviderError::Decode(format!("csv record: {e}")))?;
        let mut row = BTreeMap::new();
        for (i, header) in headers.iter().enumerate() {
            if let Some(field) = rec.get(i) {
                row.insert(header.clone(), field.to_string());
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

// ---------------------------------------------------------------------------
// HTTP adapter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RestAnalyticsClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl RestAnalyticsClient {
    pub fn new(api_key: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url,
        }
    }

    fn build_url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[derive(Debug, Deserialize)]
struct QueryRunBody {
    id: Option<String>,
    status: Option<String>,
    #[serde(default)]
    file_id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = resp.status();
    if status.as_u16() == 401 {
        return Err(ProviderError::Auth("rejected analytics credential".to_string()));
    }
    if status.as_u16() == 429 {
        return Err(ProviderError::RateLimited {
            retry_after_secs: None,
        });
    }
    if status.is_server_error() {
        return Err(ProviderError::Transport(format!("status={}", status.as_u16())));
    }
    if !status.is_success() {
        return Err(ProviderError::Api {
            status: Some(status.as_u16()),
            message: String::new(),
        });
    }
    Ok(resp)
}

#[async_trait::async_trait]
impl AnalyticsClient for RestAnalyticsClient {
    async fn create_query_run(&self, sql: &str) -> Result<String, ProviderError> {
        let resp = self
            .http
            .post(self.build_url("/v1/query_runs"))
            .bearer_auth(&self.api_key)
            .json(&json!({ "sql": sql }))
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let resp = check_status(resp).await?;
        let body: QueryRunBody = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        body.id
            .ok_or_else(|| ProviderError::Decode("query run response missing id".to_string()))
    }

    async fn get_query_run(&self, id: &str) -> Result<QueryRunState, ProviderError> {
        let resp = self
            .http
            .get(self.build_url(&format!("/v1/query_runs/{id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let resp = check_status(resp).await?;
        let body: QueryRunBody = resp
            .json()
            .await
            .map_err(|e| ProviderError::Decode(e.to_string()))?;
        let status = QueryRunStatus::parse(
            body.status
                .as_deref()
                .ok_or_else(|| ProviderError::Decode("query run missing status".to_string()))?,
        )?;
        Ok(QueryRunState {
            status,
            file_id: body.file_id,
            error: body.error,
        })
    }

    async fn download_file(&self, file_id: &str) -> Result<String, ProviderError> {
        let resp = self
            .http
            .get(self.build_url(&format!("/v1/files/{file_id}/contents")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let resp = check_status(resp).await?;
        resp.text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn csv_rows_parse_by_lowercased_header() {
        let csv = "Created,ID,Amount\n1715000000,txn_1,250\n1715000100,txn_2,-40\n";
        let rows = parse_csv_rows(csv).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["created"], "1715000000");
        assert_eq!(rows[0]["id"], "txn_1");
        assert_eq!(rows[1]["amount"], "-40");
    }

    #[test]
    fn csv_quoted_fields_keep_commas() {
        let csv = "id,description\ntxn_1,\"fee, prorated\"\n";
        let rows = parse_csv_rows(csv).unwrap();
        assert_eq!(rows[0]["description"], "fee, prorated");
    }

    #[test]
    fn empty_csv_yields_no_rows() {
        let rows = parse_csv_rows("id,created\n").unwrap();
        assert!(rows.is_empty());
    }

    #[test]
    fn status_parse_is_closed() {
        assert_eq!(QueryRunStatus::parse("running").unwrap(), QueryRunStatus::Running);
        assert!(QueryRunStatus::parse("succeeded").unwrap().is_terminal());
        assert!(QueryRunStatus::parse("exploded").is_err());
    }

    #[tokio::test]
    async fn submit_poll_download_round_trip() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/query_runs");
            then.status(200).json_body(serde_json::json!({"id": "qr_1", "status": "running"}));
        });
        server.mock(|when, then| {
            when.method(GET).path("/v1/query_runs/qr_1");
            then.status(200).json_body(serde_json::json!({
                "id": "qr_1", "status": "succeeded", "file_id": "file_1"
            }));
        });
        server.mock(|when, then| {
            when.method(GET).path("/v1/files/file_1/contents");
            then.status(200).body("id,created\ntxn_1,1715000000\n");
        });

        let client = RestAnalyticsClient::new("sk_test".to_string(), server.base_url());
        let id = client.create_query_run("select 1").await.unwrap();
        let state = poll_query_run(
            &client,
            &id,
            Duration::from_millis(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(state.status, QueryRunStatus::Succeeded);

        let csv = client.download_file(state.file_id.as_deref().unwrap()).await.unwrap();
        let rows = parse_csv_rows(&csv).unwrap();
        assert_eq!(rows[0]["id"], "txn_1");
    }

    #[tokio::test]
    async fn failed_run_carries_the_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/query_runs/qr_bad");
            then.status(200).json_body(serde_json::json!({
                "id": "qr_bad", "status": "failed", "error": "syntax error at line 1"
            }));
        });

        let client = RestAnalyticsClient::new("sk_test".to_string(), server.base_url());
        let state = client.get_query_run("qr_bad").await.unwrap();
        assert_eq!(state.status, QueryRunStatus::Failed);
        assert_eq!(state.error.as_deref(), Some("syntax error at line 1"));
    }
}
