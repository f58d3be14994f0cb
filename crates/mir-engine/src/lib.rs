//! mir-engine
//!
//! The sync engine proper: page driver, backfill orchestrator, webhook
//! applier and analytical-query driver, all running against the persisted
//! run state in mir-db and the provider boundary in mir-provider.
//!
//! One [`SyncEngine`] instance serves one account. It is cheap to share:
//! workers hold it behind an `Arc` and coordinate exclusively through
//! Postgres — the only in-process shared state is the cooperative shutdown
//! flag.

use mir_provider::{AnalyticsClient, RemoteClient};
use mir_registry::Registry;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

mod expand;
mod orchestrator;
mod page_driver;
mod related;
mod sigma;
mod webhook_apply;

pub use orchestrator::{BackfillTotals, ParallelOpts};
pub use page_driver::ProcessOpts;
pub use webhook_apply::EventOutcome;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Page size for list calls; the provider caps at 100 and the driver
    /// never asks for more.
    pub page_limit: i64,
    /// Default worker-pool size and per-run concurrency cap.
    pub max_parallel: usize,
    /// Fetch referenced-but-missing parents while backfilling children.
    pub backfill_related_entities: bool,
    /// Open runs older than this are cancelled at startup.
    pub stale_run_max_age_minutes: i32,
    /// `running` object-runs untouched for this long are demoted to pending.
    pub stuck_running_threshold_minutes: i32,
    pub analytics_poll_interval: Duration,
    pub analytics_poll_timeout: Duration,
    /// Webhook signature timestamp tolerance.
    pub webhook_tolerance_secs: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            page_limit: 100,
            max_parallel: 4,
            backfill_related_entities: true,
            stale_run_max_age_minutes: 24 * 60,
            stuck_running_threshold_minutes: 30,
            analytics_poll_interval: Duration::from_secs(2),
            analytics_poll_timeout: Duration::from_secs(600),
            webhook_tolerance_secs: 300,
        }
    }
}

pub struct SyncEngine {
    pool: PgPool,
    client: Arc<dyn RemoteClient>,
    analytics: Option<Arc<dyn AnalyticsClient>>,
    registry: Registry,
    account_id: String,
    webhook_secret: Option<String>,
    config: EngineConfig,
    /// Cooperative shutdown: workers finish their current page, release
    /// their claim and exit.
    shutdown: Arc<AtomicBool>,
    /// Which tables carry a `deleted` projection; resolved from the schema
    /// catalog once per table and cached for the process lifetime.
    deleted_columns: Mutex<HashMap<String, bool>>,
}

impl SyncEngine {
    pub fn new(
        pool: PgPool,
        client: Arc<dyn RemoteClient>,
        analytics: Option<Arc<dyn AnalyticsClient>>,
        registry: Registry,
        account_id: String,
        webhook_secret: Option<String>,
        config: EngineConfig,
    ) -> Self {
        Self {
            pool,
            client,
            analytics,
            registry,
            account_id,
            webhook_secret,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            deleted_columns: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Signal workers to stop after their current page.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Effective list limit; never exceeds the provider's ceiling.
    pub(crate) fn list_limit(&self) -> i64 {
        self.config.page_limit.clamp(1, 100)
    }

    /// Whether `table` has a `deleted` projection, cached per process.
    pub(crate) async fn table_has_deleted_column(&self, table: &str) -> anyhow::Result<bool> {
        if let Some(hit) = self.deleted_columns.lock().unwrap().get(table) {
            return Ok(*hit);
        }
        let exists = mir_db::column_exists(&self.pool, table, "deleted").await?;
        self.deleted_columns
            .lock()
            .unwrap()
            .insert(table.to_string(), exists);
        Ok(exists)
    }
}
