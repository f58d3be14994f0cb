//! Account store.
//!
//! Workers never see the remote API credential after startup; they look up
//! their tenant by a deterministic one-way hash of it (computed in
//! mir-config). Synced-object tables reference `accounts.id`, with deletes
//! cascaded at the application layer by [`dangerously_delete_synced_account_data`].

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::{PgPool, Row};

use crate::assert_sql_ident;

#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: String,
    pub raw_data: Option<Value>,
    pub api_key_hash: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Insert or refresh an account. `raw_data` / `api_key_hash` passed as `None`
/// keep whatever is already stored.
pub async fn upsert_account(
    pool: &PgPool,
    id: &str,
    raw_data: Option<&Value>,
    api_key_hash: Option<&str>,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into accounts (id, _raw_data, _api_key_hash, _last_synced_at)
        values ($1, $2, $3, now())
        on conflict (id) do update set
            _raw_data = coalesce(excluded._raw_data, accounts._raw_data),
            _api_key_hash = coalesce(excluded._api_key_hash, accounts._api_key_hash),
            _last_synced_at = excluded._last_synced_at
        "#,
    )
    .bind(id)
    .bind(raw_data)
    .bind(api_key_hash)
    .execute(pool)
    .await
    .context("upsert_account failed")?;
    Ok(())
}

/// Resolve the tenant a worker operates for from its hashed credential.
pub async fn find_account_by_api_key_hash(
    pool: &PgPool,
    api_key_hash: &str,
) -> Result<Option<AccountRow>> {
    let row = sqlx::query(
        r#"
        select id, _raw_data, _api_key_hash, _last_synced_at
        from accounts
        where _api_key_hash = $1
        "#,
    )
    .bind(api_key_hash)
    .fetch_optional(pool)
    .await
    .context("find_account_by_api_key_hash failed")?;

    let Some(row) = row else { return Ok(None) };
    Ok(Some(AccountRow {
        id: row.try_get("id")?,
        raw_data: row.try_get("_raw_data")?,
        api_key_hash: row.try_get("_api_key_hash")?,
        last_synced_at: row.try_get("_last_synced_at")?,
    }))
}

/// Remove every trace of an account: all synced rows across `tables`, its
/// runs and object-runs, and the account row itself, in one transaction.
///
/// Returns the number of synced-object rows removed. The name is the
/// operator-facing contract: there is no undo.
pub async fn dangerously_delete_synced_account_data(
    pool: &PgPool,
    account_id: &str,
    tables: &[&str],
) -> Result<u64> {
    for table in tables {
        assert_sql_ident(table)?;
    }

    let mut tx = pool
        .begin()
        .await
        .context("dangerously_delete_synced_account_data: begin failed")?;

    let mut removed = 0u64;
    for table in tables {
        let sql = format!("delete from {table} where _account_id = $1");
        let done = sqlx::query(&sql)
            .bind(account_id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("purge of {table} failed"))?;
        removed += done.rows_affected();
    }

    // _sync_obj_runs cascades from _sync_runs.
    sqlx::query("delete from _sync_runs where account_id = $1")
        .bind(account_id)
        .execute(&mut *tx)
        .await
        .context("purge of _sync_runs failed")?;

    sqlx::query("delete from accounts where id = $1")
        .bind(account_id)
        .execute(&mut *tx)
        .await
        .context("purge of accounts row failed")?;

    tx.commit()
        .await
        .context("dangerously_delete_synced_account_data: commit failed")?;
    Ok(removed)
}
