//! Analytical-query driver: cursor-tuple pagination over CSV results.
//!
//! Objects without a REST list endpoint are pulled from the provider's
//! analytical store: build a SQL query ordered by the configured cursor
//! columns, bound below by the serialized cursor tuple, submit it, poll to
//! completion, download the CSV, normalize rows into raw payloads and upsert
//! them. Unlike REST resources the cursor advances *within* a run — each page
//! moves the tuple to its last row — and a full page means more may exist.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use mir_provider::{parse_csv_rows, poll_query_run, QueryRunStatus};
use mir_registry::{AnalyticalSource, ResourceConfig};
use mir_schemas::Cursor;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::info;

use crate::SyncEngine;

impl SyncEngine {
    pub(crate) async fn process_analytical_page(
        &self,
        resource: &ResourceConfig,
        run_started_at: DateTime<Utc>,
        row: &mir_db::ObjectRun,
    ) -> Result<(u64, bool)> {
        let sigma = resource.analytical().expect("analytical resource");
        let analytics = self
            .analytics
            .as_ref()
            .ok_or_else(|| anyhow!("no analytics client configured for {}", resource.name))?;

        // Cursor state: this run's tuple if any; otherwise seed from the
        // destination table so previously loaded history is not re-ingested.
        let cursor: Option<Vec<String>> = match row.cursor.as_deref() {
            Some(s) => match Cursor::parse(s).map_err(|e| anyhow!(e))? {
                Cursor::Tuple(vals) => Some(vals),
                Cursor::Created(ts) => bail!(
                    "{} carries a scalar cursor {ts} but is analytical",
                    resource.name
                ),
            },
            None => {
                mir_db::latest_cursor_tuple(
                    &self.pool,
                    resource.table,
                    sigma.cursor_columns,
                    &self.account_id,
                )
                .await?
            }
        };

        let sql = build_query(sigma, cursor.as_deref())?;
        let query_run_id = analytics
            .create_query_run(&sql)
            .await
            .map_err(anyhow::Error::new)?;
        let state = poll_query_run(
            analytics.as_ref(),
            &query_run_id,
            self.config.analytics_poll_interval,
            self.config.analytics_poll_timeout,
        )
        .await
        .map_err(anyhow::Error::new)?;

        match state.status {
            QueryRunStatus::Succeeded => {}
            status => bail!(
                "analytical query {query_run_id} ended {status:?}: {}",
                state.error.unwrap_or_default()
            ),
        }
        let file_id = state
            .file_id
            .ok_or_else(|| anyhow!("analytical query {query_run_id} succeeded without a file"))?;
        let csv = analytics
            .download_file(&file_id)
            .await
            .map_err(anyhow::Error::new)?;
        let rows = parse_csv_rows(&csv).map_err(anyhow::Error::new)?;

        if rows.is_empty() {
            return Ok((0, false));
        }

        let entries: Vec<Value> = rows
            .iter()
            .map(|r| normalize_row(resource.name, sigma, r))
            .collect::<Result<_>>()?;

        mir_db::upsert_many(
            &self.pool,
            resource.table,
            &self.account_id,
            &entries,
            Some(Utc::now()),
        )
        .await?;

        let processed = rows.len() as u64;
        let total = mir_db::increment_object_progress(
            &self.pool,
            &self.account_id,
            run_started_at,
            resource.name,
            processed as i64,
        )
        .await?;
        info!(object = resource.name, page = processed, total, "processed analytical page");

        // Advance the tuple to the last row; consistent with the ORDER BY.
        let last = rows.last().expect("non-empty");
        let tuple: Vec<String> = sigma
            .cursor_columns
            .iter()
            .map(|col| {
                last.get(*col)
                    .cloned()
                    .with_context(|| format!("result row missing cursor column {col}"))
            })
            .collect::<Result<_>>()?;
        mir_db::update_object_cursor(
            &self.pool,
            &self.account_id,
            run_started_at,
            resource.name,
            &Cursor::Tuple(tuple).encode(),
        )
        .await?;

        let has_more = rows.len() == sigma.page_size;
        Ok((processed, has_more))
    }
}

/// Build the page query: configured columns, tuple lower bound, stable order.
fn build_query(sigma: &AnalyticalSource, cursor: Option<&[String]>) -> Result<String> {
    let mut sql = format!(
        "select {} from {}",
        sigma.columns.join(", "),
        sigma.query_table
    );

    if let Some(values) = cursor {
        if values.len() != sigma.cursor_columns.len() {
            bail!(
                "cursor tuple has {} values but {} columns are configured",
                values.len(),
                sigma.cursor_columns.len()
            );
        }
        write!(sql, " where {}", tuple_predicate(sigma, values)?).expect("write to string");
    }

    let order: Vec<String> = sigma
        .cursor_columns
        .iter()
        .map(|c| format!("{c} asc"))
        .collect();
    write!(sql, " order by {} limit {}", order.join(", "), sigma.page_size)
        .expect("write to string");
    Ok(sql)
}

/// Strict tuple comparison unrolled for SQL dialects without row-value
/// syntax: `(a > va) or (a = va and b > vb) or …`.
fn tuple_predicate(sigma: &AnalyticalSource, values: &[String]) -> Result<String> {
    let mut alternatives = Vec::with_capacity(values.len());
    for depth in 0..values.len() {
        let mut clauses = Vec::with_capacity(depth + 1);
        for (i, (col, val)) in sigma.cursor_columns.iter().zip(values).enumerate().take(depth + 1) {
            let op = if i == depth { ">" } else { "=" };
            clauses.push(format!("{col} {op} {}", sql_literal(sigma, col, val)?));
        }
        alternatives.push(format!("({})", clauses.join(" and ")));
    }
    Ok(alternatives.join(" or "))
}

fn sql_literal(sigma: &AnalyticalSource, column: &str, value: &str) -> Result<String> {
    if sigma.integer_columns.contains(&column) {
        let n: i64 = value
            .parse()
            .with_context(|| format!("cursor value for {column} is not an integer: {value:?}"))?;
        Ok(n.to_string())
    } else {
        Ok(format!("'{}'", value.replace('\'', "''")))
    }
}

/// Map one CSV row into the raw-payload shape the destination table projects.
fn normalize_row(
    resource_name: &str,
    sigma: &AnalyticalSource,
    row: &BTreeMap<String, String>,
) -> Result<Value> {
    let mut obj = serde_json::Map::new();
    obj.insert(
        "object".to_string(),
        Value::String(resource_name.to_string()),
    );

    for col in sigma.columns {
        let Some(raw) = row.get(*col) else { continue };
        // Nulls arrive as empty fields.
        if raw.is_empty() {
            continue;
        }
        let value = if sigma.integer_columns.contains(col) {
            let n: i64 = raw
                .parse()
                .with_context(|| format!("column {col} is not an integer: {raw:?}"))?;
            Value::Number(n.into())
        } else {
            Value::String(raw.clone())
        };
        obj.insert((*col).to_string(), value);
    }

    if !obj.get("id").is_some_and(Value::is_string) {
        bail!("analytical row missing id: {row:?}");
    }
    Ok(Value::Object(obj))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sigma() -> AnalyticalSource {
        AnalyticalSource {
            query_table: "balance_transactions",
            cursor_columns: &["created", "id"],
            columns: &["id", "created", "type", "amount", "currency", "description"],
            integer_columns: &["created", "amount"],
            page_size: 500,
        }
    }

    #[test]
    fn first_run_query_has_no_lower_bound() {
        let sql = build_query(&sigma(), None).unwrap();
        assert_eq!(
            sql,
            "select id, created, type, amount, currency, description \
             from balance_transactions order by created asc, id asc limit 500"
        );
    }

    #[test]
    fn cursor_tuple_becomes_a_strict_lower_bound() {
        let cursor = vec!["1715000000".to_string(), "txn_42".to_string()];
        let sql = build_query(&sigma(), Some(&cursor)).unwrap();
        assert!(sql.contains(
            "where (created > 1715000000) or (created = 1715000000 and id > 'txn_42')"
        ));
        assert!(sql.ends_with("order by created asc, id asc limit 500"));
    }

    #[test]
    fn string_cursor_values_are_escaped() {
        let cursor = vec!["1715000000".to_string(), "txn_o'brien".to_string()];
        let sql = build_query(&sigma(), Some(&cursor)).unwrap();
        assert!(sql.contains("id > 'txn_o''brien'"));
    }

    #[test]
    fn non_integer_value_in_integer_column_is_rejected() {
        let cursor = vec!["not-a-number".to_string(), "txn_1".to_string()];
        assert!(build_query(&sigma(), Some(&cursor)).is_err());
    }

    #[test]
    fn arity_mismatch_is_rejected() {
        let cursor = vec!["1715000000".to_string()];
        assert!(build_query(&sigma(), Some(&cursor)).is_err());
    }

    #[test]
    fn rows_normalize_with_typed_columns() {
        let mut row = BTreeMap::new();
        row.insert("id".to_string(), "txn_1".to_string());
        row.insert("created".to_string(), "1715000000".to_string());
        row.insert("amount".to_string(), "-250".to_string());
        row.insert("type".to_string(), "charge".to_string());
        row.insert("description".to_string(), String::new());

        let v = normalize_row("balance_transaction", &sigma(), &row).unwrap();
        assert_eq!(v["id"], "txn_1");
        assert_eq!(v["object"], "balance_transaction");
        assert_eq!(v["created"], 1_715_000_000);
        assert_eq!(v["amount"], -250);
        assert!(v.get("description").is_none(), "empty fields are nulls");
    }

    #[test]
    fn rows_without_id_are_rejected() {
        let mut row = BTreeMap::new();
        row.insert("created".to_string(), "1".to_string());
        assert!(normalize_row("balance_transaction", &sigma(), &row).is_err());
    }
}
