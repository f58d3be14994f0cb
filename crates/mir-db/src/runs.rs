//! Persisted run / object-run state machine.
//!
//! A run is an account-scoped coordination context keyed `(account_id,
//! started_at)`. Each object inside a run has its own row whose `status`
//! walks `pending → running → complete | error`, with `running → pending`
//! allowed when a worker yields between pages. Every transition touching
//! `running` is a CAS update guarded by `where status = …`; work stealing
//! comes from `FOR UPDATE SKIP LOCKED` on the claim query.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use mir_schemas::ObjectRunStatus;
use sqlx::{PgPool, Row};

use crate::lock::with_advisory_lock;

// ---------------------------------------------------------------------------
// Row types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncRunHandle {
    pub account_id: String,
    pub started_at: DateTime<Utc>,
    /// Exactly one concurrent caller of get_or_create observes `true`.
    pub is_new: bool,
}

#[derive(Debug, Clone)]
pub struct ObjectRun {
    pub account_id: String,
    pub run_started_at: DateTime<Utc>,
    pub object: String,
    pub status: ObjectRunStatus,
    pub sort_order: i32,
    pub cursor: Option<String>,
    pub page_cursor: Option<String>,
    pub progress_count: i64,
    pub error: Option<String>,
}

/// What `claim_next_task` hands a worker.
#[derive(Debug, Clone)]
pub struct ClaimedTask {
    pub object: String,
    pub cursor: Option<String>,
    pub page_cursor: Option<String>,
}

/// One row of the derived `sync_runs` view.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub account_id: String,
    pub started_at: DateTime<Utc>,
    pub triggered_by: String,
    pub status: String,
    pub pending_count: i64,
    pub running_count: i64,
    pub complete_count: i64,
    pub error_count: i64,
    pub closed_at: Option<DateTime<Utc>>,
}

fn object_run_from_row(row: &sqlx::postgres::PgRow) -> Result<ObjectRun> {
    Ok(ObjectRun {
        account_id: row.try_get("account_id")?,
        run_started_at: row.try_get("run_started_at")?,
        object: row.try_get("object")?,
        status: ObjectRunStatus::parse(&row.try_get::<String, _>("status")?)
            .map_err(|e| anyhow!(e))?,
        sort_order: row.try_get("sort_order")?,
        cursor: row.try_get("cursor")?,
        page_cursor: row.try_get("page_cursor")?,
        progress_count: row.try_get("progress_count")?,
        error: row.try_get("error")?,
    })
}

// ---------------------------------------------------------------------------
// Run lifecycle
// ---------------------------------------------------------------------------

/// Return the open run for the account, creating one if none exists.
///
/// Serialized per account by an advisory lock, so concurrent callers agree on
/// one `(account_id, started_at)` and exactly one of them sees `is_new`.
pub async fn get_or_create_sync_run(
    pool: &PgPool,
    account_id: &str,
    triggered_by: &str,
    max_concurrency: i32,
) -> Result<SyncRunHandle> {
    let lock_name = format!("mir:sync-run:{account_id}");
    with_advisory_lock(pool, &lock_name, || async {
        let open: Option<(DateTime<Utc>,)> = sqlx::query_as(
            r#"
            select started_at
            from _sync_runs
            where account_id = $1 and closed_at is null
            order by started_at desc
            limit 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(pool)
        .await
        .context("get_or_create_sync_run: open-run query failed")?;

        if let Some((started_at,)) = open {
            return Ok(SyncRunHandle {
                account_id: account_id.to_string(),
                started_at,
                is_new: false,
            });
        }

        let (started_at,): (DateTime<Utc>,) = sqlx::query_as(
            r#"
            insert into _sync_runs (account_id, started_at, triggered_by, max_concurrency)
            values ($1, now(), $2, $3)
            returning started_at
            "#,
        )
        .bind(account_id)
        .bind(triggered_by)
        .bind(max_concurrency)
        .fetch_one(pool)
        .await
        .context("get_or_create_sync_run: insert failed")?;

        Ok(SyncRunHandle {
            account_id: account_id.to_string(),
            started_at,
            is_new: true,
        })
    })
    .await
}

/// Idempotent creation of one pending object-run per resource.
///
/// `resources` pairs each object name with its registry order; re-invocation
/// for an existing `(run, object)` leaves the row untouched.
pub async fn create_object_runs(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
    resources: &[(String, i32)],
) -> Result<()> {
    for (object, sort_order) in resources {
        sqlx::query(
            r#"
            insert into _sync_obj_runs (account_id, run_started_at, object, status, sort_order)
            values ($1, $2, $3, 'pending', $4)
            on conflict (account_id, run_started_at, object) do nothing
            "#,
        )
        .bind(account_id)
        .bind(run_started_at)
        .bind(object)
        .bind(sort_order)
        .execute(pool)
        .await
        .with_context(|| format!("create_object_runs failed for {object}"))?;
    }
    Ok(())
}

/// Set `closed_at` once all object-runs are terminal. Idempotent.
pub async fn close_sync_run(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        r#"
        update _sync_runs
        set closed_at = now()
        where account_id = $1 and started_at = $2 and closed_at is null
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .execute(pool)
    .await
    .context("close_sync_run failed")?;
    Ok(())
}

/// True when no object-run of the run is still `pending` or `running`.
pub async fn all_object_runs_terminal(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
) -> Result<bool> {
    let (live,): (i64,) = sqlx::query_as(
        r#"
        select count(*)
        from _sync_obj_runs
        where account_id = $1 and run_started_at = $2
          and status in ('pending', 'running')
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .fetch_one(pool)
    .await
    .context("all_object_runs_terminal failed")?;
    Ok(live == 0)
}

// ---------------------------------------------------------------------------
// Object-run transitions
// ---------------------------------------------------------------------------

/// CAS `pending → running`, honoring the run's concurrency cap.
///
/// The parent `_sync_runs` row is locked `FOR UPDATE` before counting running
/// object-runs, so two workers racing for the last slot serialize on the run
/// row rather than both squeezing through.
///
/// Returns `false` when the cap is reached or the row is not `pending`.
pub async fn try_start_object_sync(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
    object: &str,
) -> Result<bool> {
    let mut tx = pool.begin().await.context("try_start_object_sync: begin failed")?;

    let (cap,): (i32,) = sqlx::query_as(
        r#"
        select max_concurrency
        from _sync_runs
        where account_id = $1 and started_at = $2
        for update
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .fetch_one(&mut *tx)
    .await
    .context("try_start_object_sync: run lookup failed")?;

    let (running,): (i64,) = sqlx::query_as(
        r#"
        select count(*)
        from _sync_obj_runs
        where account_id = $1 and run_started_at = $2 and status = 'running'
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .fetch_one(&mut *tx)
    .await
    .context("try_start_object_sync: running count failed")?;

    if running >= i64::from(cap) {
        tx.rollback().await.ok();
        return Ok(false);
    }

    let started: Option<(String,)> = sqlx::query_as(
        r#"
        update _sync_obj_runs
        set status = 'running'
        where account_id = $1 and run_started_at = $2 and object = $3
          and status = 'pending'
        returning object
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .bind(object)
    .fetch_optional(&mut *tx)
    .await
    .context("try_start_object_sync: transition failed")?;

    tx.commit().await.context("try_start_object_sync: commit failed")?;
    Ok(started.is_some())
}

/// Atomically claim one `pending` object-run for this worker.
///
/// `FOR UPDATE SKIP LOCKED` means concurrent claimers never receive the same
/// row; a worker that finds nothing gets `None` and can exit. Claims hand out
/// work in registry order so parents go before children.
pub async fn claim_next_task(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
) -> Result<Option<ClaimedTask>> {
    let row = sqlx::query(
        r#"
        with to_claim as (
            select object
            from _sync_obj_runs
            where account_id = $1 and run_started_at = $2 and status = 'pending'
            order by sort_order asc, object asc
            limit 1
            for update skip locked
        )
        update _sync_obj_runs
           set status = 'running'
         where account_id = $1 and run_started_at = $2
           and object in (select object from to_claim)
        returning object, cursor, page_cursor
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .fetch_optional(pool)
    .await
    .context("claim_next_task failed")?;

    let Some(row) = row else { return Ok(None) };

    Ok(Some(ClaimedTask {
        object: row.try_get("object")?,
        cursor: row.try_get("cursor")?,
        page_cursor: row.try_get("page_cursor")?,
    }))
}

/// Yield a `running` object back to `pending` with its walk position saved,
/// so any worker can pick up the next page.
pub async fn release_object_sync(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
    object: &str,
    page_cursor: Option<&str>,
) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        update _sync_obj_runs
        set status = 'pending', page_cursor = $4
        where account_id = $1 and run_started_at = $2 and object = $3
          and status = 'running'
        returning object
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .bind(object)
    .bind(page_cursor)
    .fetch_optional(pool)
    .await
    .context("release_object_sync failed")?;
    Ok(row.is_some())
}

/// CAS `running → complete`; clears the page cursor.
pub async fn complete_object_sync(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
    object: &str,
) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        update _sync_obj_runs
        set status = 'complete', page_cursor = null, error = null
        where account_id = $1 and run_started_at = $2 and object = $3
          and status = 'running'
        returning object
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .bind(object)
    .fetch_optional(pool)
    .await
    .context("complete_object_sync failed")?;
    Ok(row.is_some())
}

/// Any non-terminal state → `error`, recording the message.
pub async fn fail_object_sync(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
    object: &str,
    error: &str,
) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        update _sync_obj_runs
        set status = 'error', error = $4
        where account_id = $1 and run_started_at = $2 and object = $3
          and status in ('pending', 'running')
        returning object
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .bind(object)
    .bind(error)
    .fetch_optional(pool)
    .await
    .context("fail_object_sync failed")?;
    Ok(row.is_some())
}

// ---------------------------------------------------------------------------
// Progress & cursors
// ---------------------------------------------------------------------------

/// Add `count` processed rows; returns the running total for logging.
pub async fn increment_object_progress(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
    object: &str,
    count: i64,
) -> Result<i64> {
    let (total,): (i64,) = sqlx::query_as(
        r#"
        update _sync_obj_runs
        set progress_count = progress_count + $4
        where account_id = $1 and run_started_at = $2 and object = $3
        returning progress_count
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .bind(object)
    .bind(count)
    .fetch_one(pool)
    .await
    .context("increment_object_progress failed")?;
    Ok(total)
}

pub async fn update_object_cursor(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
    object: &str,
    cursor: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        update _sync_obj_runs
        set cursor = $4
        where account_id = $1 and run_started_at = $2 and object = $3
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .bind(object)
    .bind(cursor)
    .execute(pool)
    .await
    .context("update_object_cursor failed")?;
    Ok(())
}

/// Clear the intra-walk continuation token (end of walk).
pub async fn clear_object_page_cursor(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
    object: &str,
) -> Result<()> {
    update_object_page_cursor(pool, account_id, run_started_at, object, None).await
}

/// `None` clears the page cursor (end of walk).
pub async fn update_object_page_cursor(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
    object: &str,
    page_cursor: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        update _sync_obj_runs
        set page_cursor = $4
        where account_id = $1 and run_started_at = $2 and object = $3
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .bind(object)
    .bind(page_cursor)
    .execute(pool)
    .await
    .context("update_object_page_cursor failed")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

pub async fn get_object_run(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
    object: &str,
) -> Result<Option<ObjectRun>> {
    let row = sqlx::query(
        r#"
        select account_id, run_started_at, object, status, sort_order,
               cursor, page_cursor, progress_count, error
        from _sync_obj_runs
        where account_id = $1 and run_started_at = $2 and object = $3
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .bind(object)
    .fetch_optional(pool)
    .await
    .context("get_object_run failed")?;

    row.as_ref().map(object_run_from_row).transpose()
}

/// All object-runs of a run, in claim order.
pub async fn list_object_runs(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
) -> Result<Vec<ObjectRun>> {
    let rows = sqlx::query(
        r#"
        select account_id, run_started_at, object, status, sort_order,
               cursor, page_cursor, progress_count, error
        from _sync_obj_runs
        where account_id = $1 and run_started_at = $2
        order by sort_order asc, object asc
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .fetch_all(pool)
    .await
    .context("list_object_runs failed")?;

    rows.iter().map(object_run_from_row).collect()
}

/// Watermark seed for a successor run: the cursor of the most recent run that
/// *completed* this object before `run_started_at`. Never reads the current
/// run's in-flight cursor — re-reading your own half-advanced watermark is
/// how pagination loops get stuck.
pub async fn get_last_cursor_before_run(
    pool: &PgPool,
    account_id: &str,
    object: &str,
    run_started_at: DateTime<Utc>,
) -> Result<Option<String>> {
    let row: Option<(Option<String>,)> = sqlx::query_as(
        r#"
        select cursor
        from _sync_obj_runs
        where account_id = $1 and object = $2 and run_started_at < $3
          and status = 'complete' and cursor is not null
        order by run_started_at desc
        limit 1
        "#,
    )
    .bind(account_id)
    .bind(object)
    .bind(run_started_at)
    .fetch_optional(pool)
    .await
    .context("get_last_cursor_before_run failed")?;
    Ok(row.and_then(|(c,)| c))
}

/// Read the derived `sync_runs` view, newest first.
pub async fn list_run_summaries(
    pool: &PgPool,
    account_id: &str,
    limit: i64,
) -> Result<Vec<RunSummary>> {
    let rows = sqlx::query(
        r#"
        select account_id, started_at, triggered_by, status,
               pending_count, running_count, complete_count, error_count, closed_at
        from sync_runs
        where account_id = $1
        order by started_at desc
        limit $2
        "#,
    )
    .bind(account_id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("list_run_summaries failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in rows {
        out.push(RunSummary {
            account_id: row.try_get("account_id")?,
            started_at: row.try_get("started_at")?,
            triggered_by: row.try_get("triggered_by")?,
            status: row.try_get("status")?,
            pending_count: row.try_get("pending_count")?,
            running_count: row.try_get("running_count")?,
            complete_count: row.try_get("complete_count")?,
            error_count: row.try_get("error_count")?,
            closed_at: row.try_get("closed_at")?,
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Crash recovery
// ---------------------------------------------------------------------------

/// Close out runs that have been open longer than `max_age_minutes`, marking
/// their live object-runs as errored. Startup recovery for crashed processes.
///
/// Returns the number of runs cancelled.
pub async fn cancel_stale_runs(
    pool: &PgPool,
    account_id: &str,
    max_age_minutes: i32,
) -> Result<u64> {
    let mut tx = pool.begin().await.context("cancel_stale_runs: begin failed")?;

    let stale: Vec<(DateTime<Utc>,)> = sqlx::query_as(
        r#"
        select started_at
        from _sync_runs
        where account_id = $1 and closed_at is null
          and started_at < now() - make_interval(mins => $2)
        for update
        "#,
    )
    .bind(account_id)
    .bind(max_age_minutes)
    .fetch_all(&mut *tx)
    .await
    .context("cancel_stale_runs: stale-run query failed")?;

    for (started_at,) in &stale {
        sqlx::query(
            r#"
            update _sync_obj_runs
            set status = 'error', error = 'stale run cancelled at startup'
            where account_id = $1 and run_started_at = $2
              and status in ('pending', 'running')
            "#,
        )
        .bind(account_id)
        .bind(started_at)
        .execute(&mut *tx)
        .await
        .context("cancel_stale_runs: object-run update failed")?;

        sqlx::query(
            r#"
            update _sync_runs
            set closed_at = now()
            where account_id = $1 and started_at = $2 and closed_at is null
            "#,
        )
        .bind(account_id)
        .bind(started_at)
        .execute(&mut *tx)
        .await
        .context("cancel_stale_runs: run close failed")?;
    }

    tx.commit().await.context("cancel_stale_runs: commit failed")?;
    Ok(stale.len() as u64)
}

/// Demote `running` object-runs whose heartbeat (`_updated_at`) is older than
/// the threshold back to `pending`, keeping their `page_cursor` so the walk
/// resumes where the dead worker stopped.
pub async fn reset_stuck_running_objects(
    pool: &PgPool,
    account_id: &str,
    run_started_at: DateTime<Utc>,
    threshold_minutes: i32,
) -> Result<u64> {
    let rows = sqlx::query(
        r#"
        update _sync_obj_runs
        set status = 'pending'
        where account_id = $1 and run_started_at = $2 and status = 'running'
          and _updated_at < now() - make_interval(mins => $3)
        returning object
        "#,
    )
    .bind(account_id)
    .bind(run_started_at)
    .bind(threshold_minutes)
    .fetch_all(pool)
    .await
    .context("reset_stuck_running_objects failed")?;
    Ok(rows.len() as u64)
}
