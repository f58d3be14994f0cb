//! mir-schemas
//!
//! Shared plain types for the sync engine. This crate owns only data shapes
//! and their (de)serialization; no I/O, no DB logic, no provider logic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// Object-run status
// ---------------------------------------------------------------------------

/// Lifecycle of one object within a run.
///
/// `Complete` and `Error` are terminal. The only transitions into and out of
/// `Running` are CAS updates against the object-run row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectRunStatus {
    Pending,
    Running,
    Complete,
    Error,
}

impl ObjectRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectRunStatus::Pending => "pending",
            ObjectRunStatus::Running => "running",
            ObjectRunStatus::Complete => "complete",
            ObjectRunStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        match s {
            "pending" => Ok(ObjectRunStatus::Pending),
            "running" => Ok(ObjectRunStatus::Running),
            "complete" => Ok(ObjectRunStatus::Complete),
            "error" => Ok(ObjectRunStatus::Error),
            other => Err(format!("invalid object-run status: {other}")),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ObjectRunStatus::Complete | ObjectRunStatus::Error)
    }
}

// ---------------------------------------------------------------------------
// Run identity / trigger
// ---------------------------------------------------------------------------

/// What started a run. Stored as text on `_sync_runs.triggered_by`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggeredBy {
    Operator,
    Schedule,
    Webhook,
}

impl TriggeredBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggeredBy::Operator => "operator",
            TriggeredBy::Schedule => "schedule",
            TriggeredBy::Webhook => "webhook",
        }
    }
}

// ---------------------------------------------------------------------------
// Cursors
// ---------------------------------------------------------------------------

/// Watermark cursor: a monotonic bound on "fully observed up to here",
/// carried between runs on `_sync_obj_runs.cursor`.
///
/// REST resources use the max `created` unix timestamp seen. Analytical
/// resources use an ordered tuple of column values matching the configured
/// `ORDER BY` (timestamp first, then tiebreakers).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Cursor {
    Created(i64),
    Tuple(Vec<String>),
}

impl Cursor {
    /// Serialize for the `cursor` text column.
    ///
    /// `Created` is a plain decimal so historic rows stay readable in psql;
    /// `Tuple` is a JSON array so tiebreaker values may contain anything.
    pub fn encode(&self) -> String {
        match self {
            Cursor::Created(ts) => ts.to_string(),
            Cursor::Tuple(vals) => {
                serde_json::to_string(vals).expect("string vec serializes")
            }
        }
    }

    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty cursor".to_string());
        }
        if let Ok(ts) = s.parse::<i64>() {
            return Ok(Cursor::Created(ts));
        }
        let vals: Vec<String> =
            serde_json::from_str(s).map_err(|e| format!("invalid cursor '{s}': {e}"))?;
        Ok(Cursor::Tuple(vals))
    }

    pub fn as_created(&self) -> Option<i64> {
        match self {
            Cursor::Created(ts) => Some(*ts),
            Cursor::Tuple(_) => None,
        }
    }

    pub fn as_tuple(&self) -> Option<&[String]> {
        match self {
            Cursor::Created(_) => None,
            Cursor::Tuple(vals) => Some(vals),
        }
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

// ---------------------------------------------------------------------------
// List calls
// ---------------------------------------------------------------------------

/// Parameters for one paginated list call against the remote provider.
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    /// Page size; the provider caps this at 100.
    pub limit: i64,
    /// Intra-walk continuation: id of the last row of the previous page.
    pub starting_after: Option<String>,
    /// Incremental narrowing: only objects created at/after this timestamp.
    pub created_gte: Option<i64>,
    pub created_lte: Option<i64>,
    /// Endpoint-specific filters (e.g. `subscription=sub_x` for item lists).
    pub extra: Vec<(String, String)>,
}

impl ListParams {
    pub fn with_limit(limit: i64) -> Self {
        Self {
            limit,
            ..Self::default()
        }
    }
}

/// One page of a paginated list response.
#[derive(Debug, Clone, Default)]
pub struct ObjectPage {
    pub data: Vec<Value>,
    pub has_more: bool,
}

impl ObjectPage {
    /// The malformed-server shape the page driver refuses to loop on.
    pub fn is_empty_but_has_more(&self) -> bool {
        self.data.is_empty() && self.has_more
    }

    /// Id of the last row, for the next `starting_after`.
    pub fn last_id(&self) -> Option<&str> {
        self.data.last().and_then(object_id)
    }

    /// Max `created` across rows, ignoring rows without one.
    pub fn max_created(&self) -> Option<i64> {
        self.data.iter().filter_map(object_created).max()
    }
}

// ---------------------------------------------------------------------------
// Webhook events
// ---------------------------------------------------------------------------

/// Decoded webhook event: `{ id, type, created, data: { object } }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds at which the provider emitted the event.
    pub created: i64,
    /// Tenant override carried by multi-account event streams.
    #[serde(default)]
    pub account: Option<String>,
    pub data: WebhookEventData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventData {
    pub object: Value,
}

impl WebhookEvent {
    /// `<type>.<verb>` convention: `verb == "deleted"` selects the delete path.
    pub fn is_delete(&self) -> bool {
        self.event_type
            .rsplit('.')
            .next()
            .is_some_and(|verb| verb == "deleted")
    }
}

// ---------------------------------------------------------------------------
// Raw-object field helpers
// ---------------------------------------------------------------------------

/// `id` of a raw remote object, if present and a string.
pub fn object_id(obj: &Value) -> Option<&str> {
    obj.get("id").and_then(Value::as_str)
}

/// The `object` type tag every remote payload carries.
pub fn object_type(obj: &Value) -> Option<&str> {
    obj.get("object").and_then(Value::as_str)
}

/// `created` unix timestamp, if present and positive.
pub fn object_created(obj: &Value) -> Option<i64> {
    obj.get("created").and_then(Value::as_i64).filter(|c| *c > 0)
}

/// Tombstone marker on retrieve responses for deleted objects.
pub fn object_deleted(obj: &Value) -> bool {
    obj.get("deleted").and_then(Value::as_bool).unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Page-driver outcome
// ---------------------------------------------------------------------------

/// Result of advancing one object by one page.
#[derive(Debug, Clone)]
pub struct PageOutcome {
    /// Rows upserted from this page.
    pub processed: u64,
    /// Whether the walk should continue (provider has more, or the start was
    /// deferred by the concurrency cap).
    pub has_more: bool,
    /// The run this page was processed under.
    pub run_started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cursor_created_round_trips_as_decimal() {
        let c = Cursor::Created(1_715_000_000);
        assert_eq!(c.encode(), "1715000000");
        assert_eq!(Cursor::parse("1715000000").unwrap(), c);
    }

    #[test]
    fn cursor_tuple_round_trips_as_json_array() {
        let c = Cursor::Tuple(vec![
            "2024-05-06 00:00:00".to_string(),
            "txn_123".to_string(),
        ]);
        let enc = c.encode();
        assert!(enc.starts_with('['));
        assert_eq!(Cursor::parse(&enc).unwrap(), c);
    }

    #[test]
    fn cursor_parse_rejects_garbage() {
        assert!(Cursor::parse("").is_err());
        assert!(Cursor::parse("not a cursor").is_err());
    }

    #[test]
    fn object_run_status_round_trips() {
        for s in [
            ObjectRunStatus::Pending,
            ObjectRunStatus::Running,
            ObjectRunStatus::Complete,
            ObjectRunStatus::Error,
        ] {
            assert_eq!(ObjectRunStatus::parse(s.as_str()).unwrap(), s);
        }
        assert!(ObjectRunStatus::parse("done").is_err());
        assert!(ObjectRunStatus::Complete.is_terminal());
        assert!(!ObjectRunStatus::Running.is_terminal());
    }

    #[test]
    fn page_helpers_read_last_id_and_max_created() {
        let page = ObjectPage {
            data: vec![
                json!({"id": "cus_a", "object": "customer", "created": 100}),
                json!({"id": "cus_b", "object": "customer", "created": 300}),
                json!({"id": "cus_c", "object": "customer", "created": 200}),
            ],
            has_more: true,
        };
        assert_eq!(page.last_id(), Some("cus_c"));
        assert_eq!(page.max_created(), Some(300));
        assert!(!page.is_empty_but_has_more());

        let empty = ObjectPage {
            data: vec![],
            has_more: true,
        };
        assert!(empty.is_empty_but_has_more());
    }

    #[test]
    fn created_zero_is_treated_as_absent() {
        assert_eq!(object_created(&json!({"created": 0})), None);
        assert_eq!(object_created(&json!({"created": 5})), Some(5));
        assert_eq!(object_created(&json!({})), None);
    }

    #[test]
    fn webhook_event_decodes_and_classifies_deletes() {
        let ev: WebhookEvent = serde_json::from_value(json!({
            "id": "evt_1",
            "type": "customer.deleted",
            "created": 1_715_000_000,
            "data": { "object": { "id": "cus_a", "object": "customer" } }
        }))
        .unwrap();
        assert!(ev.is_delete());
        assert_eq!(ev.account, None);

        let ev: WebhookEvent = serde_json::from_value(json!({
            "id": "evt_2",
            "type": "customer.subscription.updated",
            "created": 1_715_000_001,
            "account": "acct_x",
            "data": { "object": { "id": "sub_a", "object": "subscription" } }
        }))
        .unwrap();
        assert!(!ev.is_delete());
        assert_eq!(ev.account.as_deref(), Some("acct_x"));
    }
}
