//! Cross-object consistency: child-collection sync and opportunistic
//! related-entity backfill.

use anyhow::Result;
use chrono::Utc;
use mir_provider::ProviderError;
use mir_registry::ResourceConfig;
use serde_json::Value;
use tracing::warn;

fn collection_is_truncated(collection: &Value) -> bool {
    collection
        .get("has_more")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

use crate::SyncEngine;

impl SyncEngine {
    /// Write the child rows embedded in a freshly-upserted parent batch and
    /// tombstone children the provider dropped (removals are implicit in the
    /// parent payload).
    pub(crate) async fn sync_child_collections(
        &self,
        resource: &ResourceConfig,
        account_id: &str,
        data: &[Value],
    ) -> Result<()> {
        for (child_cfg, pc) in self.registry.children_of(resource.name) {
            for obj in data {
                let Some(parent_id) = mir_schemas::object_id(obj) else {
                    continue;
                };
                let Some(collection) = obj.get(pc.property) else {
                    continue;
                };
                // A slice still flagged has_more is not the full set; deriving
                // removals from it would tombstone every child past the inline
                // limit. Callers expand first; if one could not, skip.
                if collection_is_truncated(collection) {
                    warn!(
                        parent = resource.name,
                        id = %parent_id,
                        property = pc.property,
                        "embedded collection is truncated; skipping child reconciliation"
                    );
                    continue;
                }
                let Some(children) = collection.get("data").and_then(Value::as_array) else {
                    continue;
                };

                // Children embedded in a parent payload do not always repeat
                // the parent id; the child table's projection needs it.
                let children: Vec<Value> = children
                    .iter()
                    .filter(|c| c.is_object())
                    .cloned()
                    .map(|mut child| {
                        if child.get(pc.parent_field).is_none() {
                            child[pc.parent_field] = Value::String(parent_id.to_string());
                        }
                        child
                    })
                    .collect();

                mir_db::reconcile_child_collection(
                    &self.pool,
                    child_cfg.table,
                    pc.parent_field,
                    parent_id,
                    account_id,
                    &children,
                    None,
                )
                .await?;
            }
        }
        Ok(())
    }

    /// Fetch parents referenced by this batch that are not stored yet.
    ///
    /// Opportunistic, not closure-complete: one level, only ids this batch
    /// names, and a parent the credential cannot see (or that no longer
    /// exists remotely) is logged and skipped rather than failing the page.
    pub(crate) async fn backfill_missing_parents(
        &self,
        resource: &ResourceConfig,
        data: &[Value],
    ) -> Result<u64> {
        let mut fetched = 0u64;

        for dep in resource.dependencies {
            let parent = self
                .registry
                .get(dep.resource)
                .expect("registry validated dependencies at build");
            let Some(parent_rest) = parent.rest() else {
                continue;
            };

            let mut ids: Vec<String> = data
                .iter()
                .filter_map(|obj| obj.get(dep.field).and_then(Value::as_str))
                .map(str::to_string)
                .collect();
            ids.sort();
            ids.dedup();
            if ids.is_empty() {
                continue;
            }

            let missing = mir_db::find_missing_ids(&self.pool, parent.table, &ids).await?;
            for id in missing {
                match self.client.retrieve(parent_rest.list_path, &id).await {
                    Ok(obj) => {
                        mir_db::upsert_many(
                            &self.pool,
                            parent.table,
                            &self.account_id,
                            &[obj],
                            Some(Utc::now()),
                        )
                        .await?;
                        fetched += 1;
                    }
                    Err(err @ (ProviderError::Api { .. } | ProviderError::PermissionDenied(_))) => {
                        warn!(
                            parent = dep.resource,
                            id = %id,
                            "skipping related-entity backfill: {err}"
                        );
                    }
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Ok(fetched)
    }
}
