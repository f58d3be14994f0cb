//! mir-db
//!
//! Postgres storage layer for the sync engine: pool bootstrap, embedded
//! migrations, advisory locks, the persisted run / object-run state machine,
//! and the timestamp-protected write path.
//!
//! All cross-worker coordination lives in Postgres. Nothing in this crate
//! holds in-process shared state; every function takes `&PgPool` and the
//! multi-process story falls out of CAS updates, `FOR UPDATE SKIP LOCKED`
//! claims and the `ON CONFLICT` guard.

use anyhow::{anyhow, Context, Result};
use sqlx::{postgres::PgPoolOptions, PgPool};

pub const ENV_DB_URL: &str = "MIR_DATABASE_URL";

pub mod accounts;
pub mod lock;
pub mod runs;
pub mod writes;

pub use accounts::{
    dangerously_delete_synced_account_data, find_account_by_api_key_hash, upsert_account,
    AccountRow,
};
pub use lock::{advisory_key, with_advisory_lock, AdvisoryLock};
pub use runs::{
    all_object_runs_terminal, cancel_stale_runs, claim_next_task, clear_object_page_cursor,
    close_sync_run,
    complete_object_sync, create_object_runs, fail_object_sync, get_last_cursor_before_run,
    get_object_run, get_or_create_sync_run, increment_object_progress, list_object_runs,
    list_run_summaries,
    release_object_sync, reset_stuck_running_objects, try_start_object_sync, update_object_cursor,
    update_object_page_cursor, ClaimedTask, ObjectRun, RunSummary, SyncRunHandle,
};
pub use writes::{
    count_rows, find_missing_ids, get_raw, hard_delete, latest_cursor_tuple, mark_deleted,
    reconcile_child_collection, upsert_many, ChildReconcileOutcome,
};

/// Connect to Postgres using MIR_DATABASE_URL.
pub async fn connect_from_env() -> Result<PgPool> {
    let url = std::env::var(ENV_DB_URL).with_context(|| format!("missing env var {ENV_DB_URL}"))?;
    connect(&url, 10).await
}

pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
        .context("failed to connect to Postgres")?;
    Ok(pool)
}

/// Test helper used by integration tests:
/// - Connect using MIR_DATABASE_URL
/// - Ensure migrations are applied
pub async fn testkit_db_pool() -> Result<PgPool> {
    let pool = connect_from_env().await?;
    migrate(&pool).await?;
    Ok(pool)
}

/// Run embedded SQLx migrations.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("db migrate failed")?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct DbStatus {
    pub ok: bool,
    pub has_sync_tables: bool,
}

/// Simple status query (connectivity + schema presence).
pub async fn status(pool: &PgPool) -> Result<DbStatus> {
    let (one,): (i32,) = sqlx::query_as::<_, (i32,)>("select 1")
        .fetch_one(pool)
        .await
        .context("status connectivity query failed")?;

    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.tables
            where table_schema = 'public' and table_name = '_sync_runs'
        )
        "#,
    )
    .fetch_one(pool)
    .await
    .context("status table-exists query failed")?;

    Ok(DbStatus {
        ok: one == 1,
        has_sync_tables: exists,
    })
}

/// Schema-catalog introspection: does `table.column` exist?
///
/// The webhook applier uses this to pick soft vs hard delete; callers may
/// cache the answer per table for the process lifetime (the DDL only changes
/// with a migration and a restart).
pub async fn column_exists(pool: &PgPool, table: &str, column: &str) -> Result<bool> {
    let (exists,): (bool,) = sqlx::query_as::<_, (bool,)>(
        r#"
        select exists (
            select 1
            from information_schema.columns
            where table_schema = 'public' and table_name = $1 and column_name = $2
        )
        "#,
    )
    .bind(table)
    .bind(column)
    .fetch_one(pool)
    .await
    .context("column_exists query failed")?;
    Ok(exists)
}

/// Guard for identifiers interpolated into per-table SQL. Table and column
/// names come from the static registry, never from remote payloads; this
/// check is the backstop that keeps it that way.
pub(crate) fn assert_sql_ident(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    if valid_first
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Ok(());
    }
    Err(anyhow!("invalid sql identifier: {name:?}"))
}

/// Detect a Postgres unique constraint violation by name.
pub fn is_unique_constraint_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            db_err.constraint() == Some(constraint)
                || (db_err.code().as_deref() == Some("23505")
                    && db_err.constraint() == Some(constraint))
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_ident_accepts_snake_case() {
        assert!(assert_sql_ident("customers").is_ok());
        assert!(assert_sql_ident("_sync_obj_runs").is_ok());
        assert!(assert_sql_ident("balance_transactions").is_ok());
    }

    #[test]
    fn sql_ident_rejects_injection_shapes() {
        assert!(assert_sql_ident("").is_err());
        assert!(assert_sql_ident("customers; drop table accounts").is_err());
        assert!(assert_sql_ident("Customers").is_err());
        assert!(assert_sql_ident("cust\"omers").is_err());
        assert!(assert_sql_ident("1customers").is_err());
    }
}
