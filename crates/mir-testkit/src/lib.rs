//! mir-testkit
//!
//! In-process mocks for the provider boundary plus engine wiring helpers.
//! The mock REST client models the provider's actual pagination contract —
//! newest-first ordering, `starting_after` continuation, `created[gte]`
//! narrowing, the 100-row ceiling — so scenario tests exercise the real
//! cursor protocol instead of canned page sequences.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use mir_engine::{EngineConfig, SyncEngine};
use mir_provider::{
    AnalyticsClient, ProviderError, QueryRunState, QueryRunStatus, RemoteClient,
};
use mir_schemas::{ListParams, ObjectPage};

// ---------------------------------------------------------------------------
// Mock REST client
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockRestState {
    /// Objects per list path; order here is irrelevant, the mock sorts
    /// newest-first on every call like the provider does.
    objects: HashMap<String, Vec<Value>>,
    /// Overrides for retrieve responses, keyed `"{path}/{id}"`.
    retrieve: HashMap<String, Value>,
    /// Paths answering `{data: [], has_more: true}` (malformed-server fault).
    empty_with_has_more: HashSet<String>,
    /// Paths answering 403.
    permission_denied: HashSet<String>,
    list_calls: HashMap<String, u64>,
    retrieve_calls: HashMap<String, u64>,
}

#[derive(Default)]
pub struct MockRemoteClient {
    state: Mutex<MockRestState>,
}

impl MockRemoteClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_objects(&self, path: &str, objects: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .objects
            .insert(path.to_string(), objects);
    }

    /// Add objects to a path (newcomers arriving mid-walk).
    pub fn push_objects(&self, path: &str, objects: Vec<Value>) {
        self.state
            .lock()
            .unwrap()
            .objects
            .entry(path.to_string())
            .or_default()
            .extend(objects);
    }

    pub fn set_retrieve(&self, path: &str, id: &str, object: Value) {
        self.state
            .lock()
            .unwrap()
            .retrieve
            .insert(format!("{path}/{id}"), object);
    }

    pub fn fail_empty_with_has_more(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .empty_with_has_more
            .insert(path.to_string());
    }

    pub fn clear_fault(&self, path: &str) {
        self.state.lock().unwrap().empty_with_has_more.remove(path);
    }

    pub fn deny(&self, path: &str) {
        self.state
            .lock()
            .unwrap()
            .permission_denied
            .insert(path.to_string());
    }

    pub fn list_calls(&self, path: &str) -> u64 {
        *self
            .state
            .lock()
            .unwrap()
            .list_calls
            .get(path)
            .unwrap_or(&0)
    }

    pub fn retrieve_calls(&self, path: &str) -> u64 {
        *self
            .state
            .lock()
            .unwrap()
            .retrieve_calls
            .get(path)
            .unwrap_or(&0)
    }
}

#[async_trait]
impl RemoteClient for MockRemoteClient {
    fn source_name(&self) -> &'static str {
        "mock"
    }

    async fn list(&self, path: &str, params: &ListParams) -> Result<ObjectPage, ProviderError> {
        let mut st = self.state.lock().unwrap();
        *st.list_calls.entry(path.to_string()).or_default() += 1;

        if params.limit > 100 {
            return Err(ProviderError::Api {
                status: Some(400),
                message: format!("limit must be <= 100, got {}", params.limit),
            });
        }
        if st.permission_denied.contains(path) {
            return Err(ProviderError::PermissionDenied(
                "restricted key cannot access this endpoint".to_string(),
            ));
        }
        if st.empty_with_has_more.contains(path) {
            return Ok(ObjectPage {
                data: Vec::new(),
                has_more: true,
            });
        }

        let mut items: Vec<Value> = st.objects.get(path).cloned().unwrap_or_default();

        for (key, value) in &params.extra {
            items.retain(|o| o.get(key).and_then(Value::as_str) == Some(value.as_str()));
        }
        if let Some(gte) = params.created_gte {
            items.retain(|o| mir_schemas::object_created(o).map_or(true, |c| c >= gte));
        }
        if let Some(lte) = params.created_lte {
            items.retain(|o| mir_schemas::object_created(o).map_or(true, |c| c <= lte));
        }

        // Provider contract: newest first, ids as tiebreaker.
        items.sort_by(|a, b| {
            let ka = (mir_schemas::object_created(a).unwrap_or(0), id_of(a));
            let kb = (mir_schemas::object_created(b).unwrap_or(0), id_of(b));
            kb.cmp(&ka)
        });

        if let Some(after) = &params.starting_after {
            if let Some(pos) = items.iter().position(|o| id_of(o) == after.as_str()) {
                items = items.split_off(pos + 1);
            }
        }

        let limit = params.limit.max(0) as usize;
        let has_more = items.len() > limit;
        items.truncate(limit);
        Ok(ObjectPage {
            data: items,
            has_more,
        })
    }

    async fn retrieve(&self, path: &str, id: &str) -> Result<Value, ProviderError> {
        let mut st = self.state.lock().unwrap();
        *st.retrieve_calls.entry(path.to_string()).or_default() += 1;

        if let Some(obj) = st.retrieve.get(&format!("{path}/{id}")) {
            return Ok(obj.clone());
        }
        if let Some(objects) = st.objects.get(path) {
            if let Some(obj) = objects.iter().find(|o| id_of(o) == id) {
                return Ok(obj.clone());
            }
        }
        Err(ProviderError::Api {
            status: Some(404),
            message: format!("no such object: {id}"),
        })
    }
}

fn id_of(obj: &Value) -> String {
    mir_schemas::object_id(obj).unwrap_or_default().to_string()
}

// ---------------------------------------------------------------------------
// Mock analytics client
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockAnalyticsState {
    /// CSV result pages handed out in submission order; an exhausted queue
    /// yields an empty result set.
    pages: VecDeque<String>,
    files: HashMap<String, String>,
    queries: Vec<String>,
    next_id: u64,
}

#[derive(Default)]
pub struct MockAnalyticsClient {
    state: Mutex<MockAnalyticsState>,
}

impl MockAnalyticsClient {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn enqueue_csv(&self, csv: &str) {
        self.state.lock().unwrap().pages.push_back(csv.to_string());
    }

    /// Every query text submitted so far, oldest first.
    pub fn queries(&self) -> Vec<String> {
        self.state.lock().unwrap().queries.clone()
    }
}

#[async_trait]
impl AnalyticsClient for MockAnalyticsClient {
    async fn create_query_run(&self, sql: &str) -> Result<String, ProviderError> {
        let mut st = self.state.lock().unwrap();
        st.queries.push(sql.to_string());
        st.next_id += 1;
        let id = format!("qr_{}", st.next_id);
        let csv = st.pages.pop_front().unwrap_or_default();
        let next_id = st.next_id;
        st.files.insert(format!("file_{}", next_id), csv);
        Ok(id)
    }

    async fn get_query_run(&self, id: &str) -> Result<QueryRunState, ProviderError> {
        let file_id = id.replace("qr_", "file_");
        Ok(QueryRunState {
            status: QueryRunStatus::Succeeded,
            file_id: Some(file_id),
            error: None,
        })
    }

    async fn download_file(&self, file_id: &str) -> Result<String, ProviderError> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(file_id)
            .cloned()
            .ok_or_else(|| ProviderError::Api {
                status: Some(404),
                message: format!("no such file: {file_id}"),
            })
    }
}

// ---------------------------------------------------------------------------
// Engine wiring
// ---------------------------------------------------------------------------

pub const TEST_WEBHOOK_SECRET: &str = "whsec_testkit";

/// Build an engine over the shared test database with mocked transports.
pub async fn build_engine(
    pool: sqlx::PgPool,
    account_id: &str,
    client: Arc<MockRemoteClient>,
    analytics: Option<Arc<MockAnalyticsClient>>,
) -> anyhow::Result<Arc<SyncEngine>> {
    mir_db::upsert_account(&pool, account_id, None, None).await?;
    let analytics = analytics.map(|a| a as Arc<dyn AnalyticsClient>);
    Ok(Arc::new(SyncEngine::new(
        pool,
        client,
        analytics,
        mir_registry::standard(),
        account_id.to_string(),
        Some(TEST_WEBHOOK_SECRET.to_string()),
        EngineConfig {
            analytics_poll_interval: std::time::Duration::from_millis(1),
            ..EngineConfig::default()
        },
    )))
}

/// `n` customer objects with ascending `created` starting at `created_base`.
/// Ids are zero-padded so lexicographic tiebreaks match numeric order.
pub fn seed_customers(prefix: &str, n: usize, created_base: i64) -> Vec<Value> {
    (0..n)
        .map(|i| {
            json!({
                "id": format!("{prefix}_{i:06}"),
                "object": "customer",
                "email": format!("{prefix}_{i:06}@example.com"),
                "created": created_base + i as i64,
            })
        })
        .collect()
}

pub fn unique(prefix: &str) -> String {
    format!(
        "{prefix}_{}",
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_paginates_newest_first_with_starting_after() {
        let client = MockRemoteClient::new();
        client.set_objects("/v1/customers", seed_customers("cus", 5, 1000));

        let page = client
            .list("/v1/customers", &ListParams::with_limit(2))
            .await
            .unwrap();
        assert_eq!(page.data.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.data[0]["id"], "cus_000004", "newest first");

        let next = client
            .list(
                "/v1/customers",
                &ListParams {
                    limit: 2,
                    starting_after: page.last_id().map(str::to_string),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(next.data[0]["id"], "cus_000002");
    }

    #[tokio::test]
    async fn mock_enforces_the_provider_page_ceiling() {
        let client = MockRemoteClient::new();
        let err = client
            .list("/v1/customers", &ListParams::with_limit(101))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Api { status: Some(400), .. }));
    }

    #[tokio::test]
    async fn mock_created_gte_narrows() {
        let client = MockRemoteClient::new();
        client.set_objects("/v1/customers", seed_customers("cus", 10, 1000));
        let page = client
            .list(
                "/v1/customers",
                &ListParams {
                    limit: 100,
                    created_gte: Some(1007),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(page.data.len(), 3);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn analytics_mock_hands_out_pages_in_order() {
        let analytics = MockAnalyticsClient::new();
        analytics.enqueue_csv("id,created\ntxn_1,100\n");

        let id = analytics.create_query_run("select 1").await.unwrap();
        let state = analytics.get_query_run(&id).await.unwrap();
        assert_eq!(state.status, QueryRunStatus::Succeeded);
        let csv = analytics
            .download_file(state.file_id.as_deref().unwrap())
            .await
            .unwrap();
        assert!(csv.contains("txn_1"));
        assert_eq!(analytics.queries(), vec!["select 1".to_string()]);
    }
}
