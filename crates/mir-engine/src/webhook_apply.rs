//! Webhook reconciliation path.
//!
//! Applies single-object mutations with ordering semantics consistent with
//! backfills. The applier never touches run state; correctness against
//! concurrent backfill pages rests entirely on the monotonic
//! `_last_synced_at` guard:
//!
//! - a *final* event payload is trusted as-is and stamped with the event's
//!   `created` (the provider will not mutate the object again);
//! - anything else is refetched — capturing the latest mutable state — and
//!   stamped `now()`.
//!
//! Under at-least-once delivery both sides of the race are expected, and the
//! freshest source-truth observation wins.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, Utc};
use mir_provider::{decode_event, verify_signature, ProviderError};
use mir_schemas::WebhookEvent;
use tracing::{info, warn};

use crate::SyncEngine;

/// What applying one event did, for logs and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventOutcome {
    Applied { object: String, id: String },
    /// The timestamp guard saw newer data already stored.
    DroppedByGuard { object: String, id: String },
    SoftDeleted { object: String, id: String },
    HardDeleted { object: String, id: String, removed: bool },
    /// Event for an object type the registry does not know.
    Ignored { event_type: String },
}

impl SyncEngine {
    /// Verify, decode, apply. A signature failure applies nothing and
    /// surfaces as an auth error so the caller returns non-2xx and the
    /// provider redelivers.
    pub async fn process_webhook(
        &self,
        raw_body: &str,
        signature_header: &str,
    ) -> Result<EventOutcome> {
        let secret = self.webhook_secret.as_deref().ok_or_else(|| {
            anyhow::Error::new(ProviderError::Auth("no webhook secret configured".into()))
        })?;

        verify_signature(
            secret,
            raw_body,
            signature_header,
            self.config.webhook_tolerance_secs,
            Utc::now().timestamp(),
        )
        .map_err(anyhow::Error::new)?;

        let event = decode_event(raw_body).map_err(anyhow::Error::new)?;
        self.process_event(&event).await
    }

    pub async fn process_event(&self, event: &WebhookEvent) -> Result<EventOutcome> {
        let payload = &event.data.object;
        let Some(type_tag) = mir_schemas::object_type(payload) else {
            bail!("event {} object has no type tag", event.id);
        };
        let Some(resource) = self.registry.for_object_type(type_tag) else {
            warn!(event = %event.event_type, "ignoring event for unknown object type");
            return Ok(EventOutcome::Ignored {
                event_type: event.event_type.clone(),
            });
        };
        let id = mir_schemas::object_id(payload)
            .ok_or_else(|| anyhow!("event {} object missing id", event.id))?
            .to_string();

        // Multi-account streams carry the tenant on the event; default to the
        // engine's own account.
        let account_id = event.account.clone().unwrap_or_else(|| self.account_id.clone());
        mir_db::upsert_account(&self.pool, &account_id, None, None).await?;

        let event_ts = DateTime::<Utc>::from_timestamp(event.created, 0)
            .ok_or_else(|| anyhow!("event {} has invalid created timestamp", event.id))?;

        if event.is_delete() {
            return self.apply_delete(resource.table, &account_id, type_tag, &id, event_ts).await;
        }

        // Final states may be applied verbatim with source-truth time; mutable
        // objects are refetched so a delayed event cannot freeze old state.
        let (mut entry, sync_ts) = if resource.is_final(payload) {
            (payload.clone(), event_ts)
        } else if let Some(rest) = resource.rest() {
            let refetched = self
                .client
                .retrieve(rest.list_path, &id)
                .await
                .map_err(anyhow::Error::new)?;
            (refetched, Utc::now())
        } else {
            (payload.clone(), event_ts)
        };

        // A refetch can come back as a tombstone when the object died between
        // the event and now.
        if mir_schemas::object_deleted(&entry) {
            return self.apply_delete(resource.table, &account_id, type_tag, &id, sync_ts).await;
        }

        // Event payloads truncate inline collections exactly like list
        // responses do. Expand before anything is persisted: the stored raw
        // payload must carry the full set, and reconciling children against a
        // truncated slice would tombstone every child past the inline limit.
        if let Some(rest) = resource.rest() {
            self.expand_truncated_collections(rest, std::slice::from_mut(&mut entry))
                .await?;
        }

        let applied = mir_db::upsert_many(
            &self.pool,
            resource.table,
            &account_id,
            std::slice::from_ref(&entry),
            Some(sync_ts),
        )
        .await?;

        if applied.is_empty() {
            info!(object = type_tag, id = %id, "event dropped by timestamp guard");
            return Ok(EventOutcome::DroppedByGuard {
                object: type_tag.to_string(),
                id,
            });
        }

        self.sync_child_collections(resource, &account_id, std::slice::from_ref(&entry))
            .await?;

        Ok(EventOutcome::Applied {
            object: type_tag.to_string(),
            id,
        })
    }

    async fn apply_delete(
        &self,
        table: &str,
        account_id: &str,
        object: &str,
        id: &str,
        sync_ts: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        if self.table_has_deleted_column(table).await? {
            let applied =
                mir_db::mark_deleted(&self.pool, table, account_id, id, Some(sync_ts)).await?;
            if applied {
                Ok(EventOutcome::SoftDeleted {
                    object: object.to_string(),
                    id: id.to_string(),
                })
            } else {
                Ok(EventOutcome::DroppedByGuard {
                    object: object.to_string(),
                    id: id.to_string(),
                })
            }
        } else {
            let removed = mir_db::hard_delete(&self.pool, table, id).await?;
            Ok(EventOutcome::HardDeleted {
                object: object.to_string(),
                id: id.to_string(),
                removed,
            })
        }
    }
}
