//! Truncated-collection expansion.
//!
//! List responses embed child collections cut off at the provider's inline
//! limit with `has_more: true`. Before a parent batch is upserted, each
//! truncated collection is walked to the end via its own list endpoint so the
//! stored payload — and the child-table reconciliation derived from it — sees
//! the complete set.

use anyhow::{bail, Result};
use mir_registry::RestSource;
use mir_schemas::ListParams;
use serde_json::Value;

use crate::SyncEngine;

impl SyncEngine {
    pub(crate) async fn expand_truncated_collections(
        &self,
        rest: &RestSource,
        data: &mut [Value],
    ) -> Result<()> {
        for rule in rest.expands {
            for obj in data.iter_mut() {
                let Some(parent_id) = mir_schemas::object_id(obj).map(str::to_string) else {
                    continue;
                };
                let Some(collection) = obj.get_mut(rule.property) else {
                    continue;
                };
                let truncated = collection
                    .get("has_more")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                if !truncated {
                    continue;
                }

                let mut items: Vec<Value> = collection
                    .get("data")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default();
                let mut after = items
                    .last()
                    .and_then(mir_schemas::object_id)
                    .map(str::to_string);

                loop {
                    let params = ListParams {
                        limit: self.list_limit(),
                        starting_after: after.clone(),
                        created_gte: None,
                        created_lte: None,
                        extra: vec![(rule.parent_param.to_string(), parent_id.clone())],
                    };
                    let page = self
                        .client
                        .list(rule.list_path, &params)
                        .await
                        .map_err(anyhow::Error::new)?;

                    if page.is_empty_but_has_more() {
                        bail!("empty page with has_more=true from {}", rule.list_path);
                    }

                    after = page.last_id().map(str::to_string);
                    let done = !page.has_more;
                    items.extend(page.data);

                    if done {
                        break;
                    }
                    if after.is_none() {
                        bail!(
                            "cannot continue {} expansion for {parent_id}: page rows carry no id",
                            rule.property
                        );
                    }
                }

                collection["data"] = Value::Array(items);
                collection["has_more"] = Value::Bool(false);
            }
        }
        Ok(())
    }
}
