//! Page driver: advance one object by exactly one page.
//!
//! Each invocation fetches one page, upserts it with timestamp protection,
//! records progress, and moves the two cursors: the watermark (max `created`
//! observed this run, carried to the next run) and the page cursor (id of the
//! last row, consumed by the next fetch as `starting_after`). Failing in the
//! middle of a page is safe everywhere — the upserts are idempotent and the
//! page cursor only advances after the batch is written.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use mir_schemas::{Cursor, ListParams, ObjectRunStatus, PageOutcome, TriggeredBy};
use std::time::Duration;
use tracing::{debug, info};

use crate::SyncEngine;

#[derive(Debug, Clone, Default)]
pub struct ProcessOpts {
    /// Join this run (parallel claim path) instead of resolving one.
    pub run_started_at: Option<DateTime<Utc>>,
    /// Caller-supplied lower bound; suppresses the watermark history read.
    pub created_gte: Option<i64>,
}

impl SyncEngine {
    /// Advance `object` by one page. See module docs for the protocol.
    pub async fn process_next(&self, object: &str, opts: &ProcessOpts) -> Result<PageOutcome> {
        let resource = self
            .registry()
            .get(object)
            .ok_or_else(|| anyhow!("unknown object type: {object}"))?;
        if !resource.is_listable() {
            bail!("{object} has no list source; its rows arrive via parent payloads");
        }

        let run_started_at = match opts.run_started_at {
            Some(ts) => ts,
            None => {
                let run = mir_db::get_or_create_sync_run(
                    &self.pool,
                    &self.account_id,
                    TriggeredBy::Operator.as_str(),
                    self.config.max_parallel as i32,
                )
                .await?;
                mir_db::create_object_runs(
                    &self.pool,
                    &self.account_id,
                    run.started_at,
                    &[(object.to_string(), resource.order)],
                )
                .await?;
                run.started_at
            }
        };

        let row = mir_db::get_object_run(&self.pool, &self.account_id, run_started_at, object)
            .await?
            .ok_or_else(|| anyhow!("object-run row missing for {object}"))?;

        if row.status.is_terminal() {
            return Ok(PageOutcome {
                processed: 0,
                has_more: false,
                run_started_at,
            });
        }

        if row.status == ObjectRunStatus::Pending
            && !mir_db::try_start_object_sync(&self.pool, &self.account_id, run_started_at, object)
                .await?
        {
            // Concurrency cap reached (or a peer claimed the row first):
            // nothing processed, but the caller should come back.
            return Ok(PageOutcome {
                processed: 0,
                has_more: true,
                run_started_at,
            });
        }

        match self.drive_one_page(resource, run_started_at, &row, opts).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                let msg = format!("{err:#}");
                let _ = mir_db::fail_object_sync(
                    &self.pool,
                    &self.account_id,
                    run_started_at,
                    object,
                    &msg,
                )
                .await;
                Err(err)
            }
        }
    }

    async fn drive_one_page(
        &self,
        resource: &mir_registry::ResourceConfig,
        run_started_at: DateTime<Utc>,
        row: &mir_db::ObjectRun,
        opts: &ProcessOpts,
    ) -> Result<PageOutcome> {
        if resource.analytical().is_some() {
            let (processed, has_more) =
                self.process_analytical_page(resource, run_started_at, row).await?;
            if !has_more {
                mir_db::complete_object_sync(
                    &self.pool,
                    &self.account_id,
                    run_started_at,
                    resource.name,
                )
                .await?;
            }
            return Ok(PageOutcome {
                processed,
                has_more,
                run_started_at,
            });
        }

        let rest = resource.rest().expect("listable non-analytical resource is REST");

        // Watermark for the fetch comes from history (the last *completed*
        // run), never from this run's in-flight cursor.
        let fetch_watermark = match opts.created_gte {
            Some(c) => Some(c),
            None if rest.supports_created_filter => mir_db::get_last_cursor_before_run(
                &self.pool,
                &self.account_id,
                resource.name,
                run_started_at,
            )
            .await?
            .and_then(|s| Cursor::parse(&s).ok())
            .and_then(|c| c.as_created()),
            None => None,
        };

        let params = ListParams {
            limit: self.list_limit(),
            starting_after: row.page_cursor.clone(),
            created_gte: fetch_watermark,
            created_lte: None,
            extra: Vec::new(),
        };
        let page = self
            .client
            .list(rest.list_path, &params)
            .await
            .map_err(anyhow::Error::new)?;

        if page.is_empty_but_has_more() {
            // A malformed server response; looping on it would never finish.
            bail!("empty page with has_more=true from {}", rest.list_path);
        }

        let mir_schemas::ObjectPage { mut data, has_more } = page;
        let mut processed = 0u64;

        if !data.is_empty() {
            self.expand_truncated_collections(rest, &mut data).await?;

            let applied = mir_db::upsert_many(
                &self.pool,
                resource.table,
                &self.account_id,
                &data,
                Some(Utc::now()),
            )
            .await?;
            if applied.len() < data.len() {
                debug!(
                    object = resource.name,
                    dropped = data.len() - applied.len(),
                    "timestamp guard dropped stale page entries"
                );
            }

            self.sync_child_collections(resource, &self.account_id, &data).await?;

            if self.config.backfill_related_entities {
                self.backfill_missing_parents(resource, &data).await?;
            }

            processed = data.len() as u64;
            let total = mir_db::increment_object_progress(
                &self.pool,
                &self.account_id,
                run_started_at,
                resource.name,
                processed as i64,
            )
            .await?;
            info!(object = resource.name, page = processed, total, "processed page");

            // Watermark only ever advances: pages arrive newest-to-oldest,
            // so later pages carry smaller maxima.
            if let Some(page_max) = data.iter().filter_map(mir_schemas::object_created).max() {
                let current = row
                    .cursor
                    .as_deref()
                    .and_then(|s| Cursor::parse(s).ok())
                    .and_then(|c| c.as_created());
                if current.map_or(true, |c| page_max > c) {
                    mir_db::update_object_cursor(
                        &self.pool,
                        &self.account_id,
                        run_started_at,
                        resource.name,
                        &Cursor::Created(page_max).encode(),
                    )
                    .await?;
                }
            }

            let next_page_cursor = if has_more {
                data.last().and_then(mir_schemas::object_id)
            } else {
                None
            };
            mir_db::update_object_page_cursor(
                &self.pool,
                &self.account_id,
                run_started_at,
                resource.name,
                next_page_cursor,
            )
            .await?;
        }

        if !has_more {
            mir_db::complete_object_sync(&self.pool, &self.account_id, run_started_at, resource.name)
                .await?;
        }

        Ok(PageOutcome {
            processed,
            has_more,
            run_started_at,
        })
    }

    /// Drive one object to completion, summing page totals.
    ///
    /// The run is closed on the way out — success or failure — whenever every
    /// object-run in it is terminal, so a failed object does not pin the run
    /// open and a fresh run can recover.
    pub async fn process_until_done(
        &self,
        object: &str,
        created_gte: Option<i64>,
    ) -> Result<u64> {
        let mut total = 0u64;
        let mut run_started_at: Option<DateTime<Utc>> = None;
        let result = self
            .drive_until_done(object, created_gte, &mut total, &mut run_started_at)
            .await;

        if let Some(ts) = run_started_at {
            if mir_db::all_object_runs_terminal(&self.pool, &self.account_id, ts).await? {
                mir_db::close_sync_run(&self.pool, &self.account_id, ts).await?;
            }
        }
        result.map(|()| total)
    }

    async fn drive_until_done(
        &self,
        object: &str,
        created_gte: Option<i64>,
        total: &mut u64,
        run_started_at: &mut Option<DateTime<Utc>>,
    ) -> Result<()> {
        loop {
            if self.is_shutdown() {
                if let Some(ts) = *run_started_at {
                    self.release_if_running(ts, object).await?;
                }
                return Ok(());
            }

            let opts = ProcessOpts {
                run_started_at: *run_started_at,
                created_gte,
            };
            let outcome = self.process_next(object, &opts).await?;
            *run_started_at = Some(outcome.run_started_at);
            *total += outcome.processed;

            if !outcome.has_more {
                return Ok(());
            }
            if outcome.processed == 0 {
                // Deferred by the concurrency cap; give the running peer room.
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
    }

    /// Yield a running object back to pending, preserving its walk position.
    pub(crate) async fn release_if_running(
        &self,
        run_started_at: DateTime<Utc>,
        object: &str,
    ) -> Result<()> {
        if let Some(row) =
            mir_db::get_object_run(&self.pool, &self.account_id, run_started_at, object).await?
        {
            if row.status == ObjectRunStatus::Running {
                mir_db::release_object_sync(
                    &self.pool,
                    &self.account_id,
                    run_started_at,
                    object,
                    row.page_cursor.as_deref(),
                )
                .await?;
            }
        }
        Ok(())
    }
}
