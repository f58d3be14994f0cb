//! Timestamp-protected write path for synced object tables.
//!
//! Every synced row is the raw remote payload plus bookkeeping columns; the
//! projections are generated, so writes only ever touch `_raw_data`,
//! `_account_id` and `_last_synced_at`. The ON CONFLICT guard
//!
//! ```text
//! where cur._last_synced_at is null
//!    or cur._last_synced_at <= excluded._last_synced_at
//! ```
//!
//! linearizes backfill pages and webhook events racing for the same row: the
//! freshest source-truth observation wins, and a delayed event carrying older
//! state is dropped silently rather than clobbering newer data. The guard is
//! in the statement itself — pre-reading `_last_synced_at` in application
//! code would reopen the race as a two-round-trip check.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::assert_sql_ident;

/// Upsert a batch of raw remote objects into `table`.
///
/// Every entry must carry a string `id`; a missing id fails the whole call
/// before anything is written. `sync_timestamp` defaults to now() — callers
/// pass the event's `created` when applying webhook payloads verbatim.
///
/// Returns the ids actually applied; entries dropped by the timestamp guard
/// are absent (they are not errors).
pub async fn upsert_many(
    pool: &PgPool,
    table: &str,
    account_id: &str,
    entries: &[Value],
    sync_timestamp: Option<DateTime<Utc>>,
) -> Result<Vec<String>> {
    assert_sql_ident(table)?;

    for entry in entries {
        if mir_schemas::object_id(entry).is_none() {
            bail!("upsert_many into {table}: entry missing string id: {entry}");
        }
    }

    let ts = sync_timestamp.unwrap_or_else(Utc::now);
    let mut applied = Vec::new();
    for entry in entries {
        if let Some(id) = upsert_one(pool, table, account_id, entry, ts).await? {
            applied.push(id);
        }
    }
    Ok(applied)
}

async fn upsert_one<'e, E>(
    exec: E,
    table: &str,
    account_id: &str,
    entry: &Value,
    sync_timestamp: DateTime<Utc>,
) -> Result<Option<String>>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let sql = format!(
        r#"
        insert into {table} as cur (_raw_data, _account_id, _last_synced_at)
        values ($1, $2, $3)
        on conflict (id) do update set
            _raw_data = excluded._raw_data,
            _account_id = excluded._account_id,
            _last_synced_at = excluded._last_synced_at
        where cur._last_synced_at is null
           or cur._last_synced_at <= excluded._last_synced_at
        returning id
        "#
    );

    let row: Option<(String,)> = sqlx::query_as(&sql)
        .bind(entry)
        .bind(account_id)
        .bind(sync_timestamp)
        .fetch_optional(exec)
        .await
        .with_context(|| format!("upsert into {table} failed"))?;
    Ok(row.map(|(id,)| id))
}

/// Soft delete: merge `{deleted: true}` into the stored payload, still under
/// the timestamp guard. If the row does not exist yet (the delete event beat
/// the backfill), a minimal tombstone row is inserted so a later, older
/// backfill page cannot resurrect the object.
///
/// Only call for tables that carry a `deleted` projection.
pub async fn mark_deleted(
    pool: &PgPool,
    table: &str,
    account_id: &str,
    id: &str,
    sync_timestamp: Option<DateTime<Utc>>,
) -> Result<bool> {
    assert_sql_ident(table)?;
    let ts = sync_timestamp.unwrap_or_else(Utc::now);
    mark_deleted_exec(pool, table, account_id, id, ts).await
}

async fn mark_deleted_exec<'e, E>(
    exec: E,
    table: &str,
    account_id: &str,
    id: &str,
    sync_timestamp: DateTime<Utc>,
) -> Result<bool>
where
    E: sqlx::Executor<'e, Database = sqlx::Postgres>,
{
    let sql = format!(
        r#"
        insert into {table} as cur (_raw_data, _account_id, _last_synced_at)
        values (jsonb_build_object('id', $1::text, 'deleted', true), $2, $3)
        on conflict (id) do update set
            _raw_data = cur._raw_data || jsonb_build_object('deleted', true),
            _last_synced_at = excluded._last_synced_at
        where cur._last_synced_at is null
           or cur._last_synced_at <= excluded._last_synced_at
        returning id
        "#
    );

    let row: Option<(String,)> = sqlx::query_as(&sql)
        .bind(id)
        .bind(account_id)
        .bind(sync_timestamp)
        .fetch_optional(exec)
        .await
        .with_context(|| format!("mark_deleted in {table} failed"))?;
    Ok(row.is_some())
}

/// Hard delete for tables without a `deleted` projection.
/// Returns whether a row was removed.
pub async fn hard_delete(pool: &PgPool, table: &str, id: &str) -> Result<bool> {
    assert_sql_ident(table)?;
    let sql = format!("delete from {table} where id = $1");
    let done = sqlx::query(&sql)
        .bind(id)
        .execute(pool)
        .await
        .with_context(|| format!("hard_delete from {table} failed"))?;
    Ok(done.rows_affected() > 0)
}

#[derive(Debug, Clone, Default)]
pub struct ChildReconcileOutcome {
    /// Child ids upserted (subject to the timestamp guard).
    pub applied: Vec<String>,
    /// Previously stored child ids tombstoned because the new parent payload
    /// no longer lists them.
    pub tombstoned: Vec<String>,
}

/// Reconcile a parent's child collection against the set the provider just
/// returned (e.g. a subscription's items).
///
/// The provider never sends explicit child deletions — a child missing from
/// the parent payload *is* the deletion — so after upserting the new set,
/// any stored child of this parent absent from it is tombstoned. Runs in one
/// transaction so readers never observe a half-swapped collection.
///
/// The child table must carry `deleted` and a generated projection named
/// `parent_field` holding the parent id.
pub async fn reconcile_child_collection(
    pool: &PgPool,
    child_table: &str,
    parent_field: &str,
    parent_id: &str,
    account_id: &str,
    children: &[Value],
    sync_timestamp: Option<DateTime<Utc>>,
) -> Result<ChildReconcileOutcome> {
    assert_sql_ident(child_table)?;
    assert_sql_ident(parent_field)?;

    for child in children {
        if mir_schemas::object_id(child).is_none() {
            bail!("reconcile_child_collection into {child_table}: child missing string id: {child}");
        }
    }

    let ts = sync_timestamp.unwrap_or_else(Utc::now);
    let mut tx = pool
        .begin()
        .await
        .context("reconcile_child_collection: begin failed")?;

    let mut outcome = ChildReconcileOutcome::default();
    for child in children {
        if let Some(id) = upsert_one(&mut *tx, child_table, account_id, child, ts).await? {
            outcome.applied.push(id);
        }
    }

    let select = format!(
        r#"
        select id from {child_table}
        where {parent_field} = $1 and coalesce(deleted, false) = false
        "#
    );
    let stored: Vec<(String,)> = sqlx::query_as(&select)
        .bind(parent_id)
        .fetch_all(&mut *tx)
        .await
        .with_context(|| format!("reconcile_child_collection: stored-id query on {child_table} failed"))?;

    let new_ids: std::collections::HashSet<&str> = children
        .iter()
        .filter_map(mir_schemas::object_id)
        .collect();

    for (stored_id,) in stored {
        if !new_ids.contains(stored_id.as_str()) {
            if mark_deleted_exec(&mut *tx, child_table, account_id, &stored_id, ts).await? {
                outcome.tombstoned.push(stored_id);
            }
        }
    }

    tx.commit()
        .await
        .context("reconcile_child_collection: commit failed")?;
    Ok(outcome)
}

/// Which of `ids` have no row in `table` yet. Drives opportunistic
/// related-entity backfill: only referenced-and-missing parents get fetched.
pub async fn find_missing_ids(pool: &PgPool, table: &str, ids: &[String]) -> Result<Vec<String>> {
    assert_sql_ident(table)?;
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let sql = format!("select id from {table} where id = any($1)");
    let present: Vec<(String,)> = sqlx::query_as(&sql)
        .bind(ids)
        .fetch_all(pool)
        .await
        .with_context(|| format!("find_missing_ids on {table} failed"))?;

    let present: std::collections::HashSet<String> =
        present.into_iter().map(|(id,)| id).collect();
    Ok(ids
        .iter()
        .filter(|id| !present.contains(*id))
        .cloned()
        .collect())
}

/// Latest stored cursor tuple of an analytical destination table, as text in
/// the configured column order. Seeds a first-run cursor so previously loaded
/// history is not re-ingested.
pub async fn latest_cursor_tuple(
    pool: &PgPool,
    table: &str,
    columns: &[&str],
    account_id: &str,
) -> Result<Option<Vec<String>>> {
    assert_sql_ident(table)?;
    for col in columns {
        assert_sql_ident(col)?;
    }
    if columns.is_empty() {
        bail!("latest_cursor_tuple on {table}: no cursor columns configured");
    }

    let selects: Vec<String> = columns.iter().map(|c| format!("{c}::text")).collect();
    let not_null: Vec<String> = columns.iter().map(|c| format!("{c} is not null")).collect();
    let order: Vec<String> = columns.iter().map(|c| format!("{c} desc")).collect();
    let sql = format!(
        "select {} from {table} where _account_id = $1 and {} order by {} limit 1",
        selects.join(", "),
        not_null.join(" and "),
        order.join(", "),
    );

    let row = sqlx::query(&sql)
        .bind(account_id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("latest_cursor_tuple on {table} failed"))?;

    let Some(row) = row else { return Ok(None) };
    let mut tuple = Vec::with_capacity(columns.len());
    for i in 0..columns.len() {
        tuple.push(row.try_get::<String, _>(i)?);
    }
    Ok(Some(tuple))
}

/// Convenience for tests and the CLI: count an account's rows in a table.
pub async fn count_rows(pool: &PgPool, table: &str, account_id: &str) -> Result<i64> {
    assert_sql_ident(table)?;
    let sql = format!("select count(*) from {table} where _account_id = $1");
    let (n,): (i64,) = sqlx::query_as(&sql)
        .bind(account_id)
        .fetch_one(pool)
        .await
        .with_context(|| format!("count_rows on {table} failed"))?;
    Ok(n)
}

/// Raw payload of one stored row, if present.
pub async fn get_raw(pool: &PgPool, table: &str, id: &str) -> Result<Option<Value>> {
    assert_sql_ident(table)?;
    let sql = format!("select _raw_data from {table} where id = $1");
    let row: Option<(Value,)> = sqlx::query_as(&sql)
        .bind(id)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("get_raw on {table} failed"))?;
    Ok(row.map(|(v,)| v))
}
