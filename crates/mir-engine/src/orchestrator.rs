//! Backfill orchestrator: join-or-create the run, fan out workers over the
//! claim queue, aggregate totals, close the run.
//!
//! Workers coordinate only through Postgres: each loops on `claim_next_task`
//! → one page via `process_next` → release-if-more, so a page boundary is
//! also a scheduling boundary and any worker in any process can pick up the
//! next page. The shutdown flag is cooperative — a signalled worker finishes
//! its current page, releases its claim, and exits; anything it leaves
//! `running` is recovered by the stuck-object reset on the next run.

use anyhow::Result;
use chrono::{DateTime, Utc};
use mir_db::SyncRunHandle;
use mir_provider::ProviderError;
use mir_schemas::{ObjectRunStatus, TriggeredBy};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::{ProcessOpts, SyncEngine};

#[derive(Debug, Clone, Default)]
pub struct ParallelOpts {
    /// Objects to cover; `None` means every listable resource.
    pub objects: Option<Vec<String>>,
    /// Worker-pool size; defaults to the engine config.
    pub max_parallel: Option<usize>,
    /// Let a failed object isolate without halting the others.
    pub continue_on_error: bool,
    /// Downgrade permission-denied transport errors to a skip.
    pub skip_inaccessible: bool,
    /// Time-box the whole backfill; on expiry workers are signalled to stop.
    pub deadline: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct BackfillTotals {
    /// Rows processed by this invocation (not counting peers in other
    /// processes working the same run).
    pub processed: u64,
    pub run_started_at: DateTime<Utc>,
    /// `(object, error)` for every object-run that ended in error.
    pub failed_objects: Vec<(String, String)>,
}

impl SyncEngine {
    /// Ensure a run exists covering `objects` (default: all listable
    /// resources) and return it with the object list. Idempotent across
    /// concurrent callers; also performs startup recovery.
    pub async fn join_or_create_sync_run(
        &self,
        triggered_by: TriggeredBy,
        objects: Option<&[String]>,
    ) -> Result<(SyncRunHandle, Vec<(String, i32)>)> {
        let cancelled = mir_db::cancel_stale_runs(
            &self.pool,
            &self.account_id,
            self.config.stale_run_max_age_minutes,
        )
        .await?;
        if cancelled > 0 {
            warn!(cancelled, "cancelled stale open runs at startup");
        }

        let run = mir_db::get_or_create_sync_run(
            &self.pool,
            &self.account_id,
            triggered_by.as_str(),
            self.config.max_parallel as i32,
        )
        .await?;

        let resources: Vec<(String, i32)> = match objects {
            Some(names) => {
                let mut out = Vec::with_capacity(names.len());
                for name in names {
                    let r = self
                        .registry
                        .get(name)
                        .ok_or_else(|| anyhow::anyhow!("unknown object type: {name}"))?;
                    if !r.is_listable() {
                        anyhow::bail!("{name} is synced through its parent and cannot be backfilled directly");
                    }
                    out.push((r.name.to_string(), r.order));
                }
                out
            }
            None => self
                .registry
                .listable()
                .map(|r| (r.name.to_string(), r.order))
                .collect(),
        };

        mir_db::create_object_runs(&self.pool, &self.account_id, run.started_at, &resources)
            .await?;

        if !run.is_new {
            let reset = mir_db::reset_stuck_running_objects(
                &self.pool,
                &self.account_id,
                run.started_at,
                self.config.stuck_running_threshold_minutes,
            )
            .await?;
            if reset > 0 {
                warn!(reset, "reset stuck running object-runs from a dead worker");
            }
        }

        Ok((run, resources))
    }

    /// Backfill with a pool of workers stealing pages off the claim queue.
    pub async fn process_until_done_parallel(
        self: Arc<Self>,
        opts: ParallelOpts,
    ) -> Result<BackfillTotals> {
        let (run, resources) = self
            .join_or_create_sync_run(TriggeredBy::Operator, opts.objects.as_deref())
            .await?;
        info!(
            run_started_at = %run.started_at,
            objects = resources.len(),
            is_new = run.is_new,
            "starting parallel backfill"
        );

        let workers = opts.max_parallel.unwrap_or(self.config.max_parallel).max(1);
        let processed = Arc::new(AtomicU64::new(0));

        let mut set = JoinSet::new();
        for worker_id in 0..workers {
            let engine = Arc::clone(&self);
            let counter = Arc::clone(&processed);
            let continue_on_error = opts.continue_on_error;
            let skip_inaccessible = opts.skip_inaccessible;
            let started_at = run.started_at;
            set.spawn(async move {
                engine
                    .worker_loop(
                        started_at,
                        worker_id,
                        continue_on_error,
                        skip_inaccessible,
                        counter,
                    )
                    .await
            });
        }

        let mut first_error: Option<anyhow::Error> = None;
        if let Some(deadline) = opts.deadline {
            // Workers-done OR timeout; on timeout, signal and drain.
            tokio::select! {
                _ = drain_workers(&mut set, &mut first_error) => {}
                _ = tokio::time::sleep(deadline) => {
                    warn!("backfill deadline reached, signalling workers to stop");
                    self.shutdown();
                }
            }
        }
        drain_workers(&mut set, &mut first_error).await;

        if mir_db::all_object_runs_terminal(&self.pool, &self.account_id, run.started_at).await? {
            mir_db::close_sync_run(&self.pool, &self.account_id, run.started_at).await?;
        }

        if let Some(err) = first_error {
            return Err(err);
        }

        let failed_objects = mir_db::list_object_runs(&self.pool, &self.account_id, run.started_at)
            .await?
            .into_iter()
            .filter(|o| o.status == ObjectRunStatus::Error)
            .map(|o| (o.object, o.error.unwrap_or_default()))
            .collect();

        Ok(BackfillTotals {
            processed: processed.load(Ordering::SeqCst),
            run_started_at: run.started_at,
            failed_objects,
        })
    }

    async fn worker_loop(
        &self,
        run_started_at: DateTime<Utc>,
        worker_id: usize,
        continue_on_error: bool,
        skip_inaccessible: bool,
        processed: Arc<AtomicU64>,
    ) -> Result<()> {
        loop {
            if self.is_shutdown() {
                return Ok(());
            }

            let Some(task) =
                mir_db::claim_next_task(&self.pool, &self.account_id, run_started_at).await?
            else {
                return Ok(());
            };

            let opts = ProcessOpts {
                run_started_at: Some(run_started_at),
                created_gte: None,
            };
            match self.process_next(&task.object, &opts).await {
                Ok(outcome) => {
                    processed.fetch_add(outcome.processed, Ordering::SeqCst);
                    if outcome.has_more {
                        // Page done, walk not: hand the object back so any
                        // peer (or this worker, next claim) continues it.
                        self.release_if_running(run_started_at, &task.object).await?;
                    }
                }
                Err(err) => {
                    let denied = err
                        .downcast_ref::<ProviderError>()
                        .is_some_and(ProviderError::is_permission_denied);
                    if denied && skip_inaccessible {
                        warn!(worker_id, object = %task.object, "skipping inaccessible object: {err:#}");
                        continue;
                    }
                    if continue_on_error {
                        warn!(worker_id, object = %task.object, "object failed, continuing: {err:#}");
                        continue;
                    }
                    self.shutdown();
                    return Err(err);
                }
            }
        }
    }
}

async fn drain_workers(set: &mut JoinSet<Result<()>>, first_error: &mut Option<anyhow::Error>) {
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                if first_error.is_none() {
                    *first_error = Some(err);
                }
            }
            Err(join_err) => {
                if first_error.is_none() {
                    *first_error = Some(anyhow::anyhow!("worker panicked: {join_err}"));
                }
            }
        }
    }
}
