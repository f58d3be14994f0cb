//! mir-config
//!
//! Layered YAML configuration: files merge in order (later overrides
//! earlier via deep-merge), the result canonicalizes to stable JSON and is
//! hashed so two processes can prove they run the same configuration.
//!
//! Secrets never live in the YAML — files name env vars, `secrets.rs`
//! resolves them once at startup.

use anyhow::{Context, Result};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

pub mod secrets;

pub use secrets::{resolve_secrets, ResolvedSecrets};

/// Load YAML layers in order and fold them into one config value: objects
/// merge key-by-key, anything else (arrays, scalars) is replaced by the
/// later layer. The merged value is also rendered in a canonical form
/// (recursively sorted keys, compact separators) and hashed, so two
/// processes can prove they run the same configuration regardless of key
/// order or formatting in the files.
pub fn load_layered_yaml(paths: &[&str]) -> Result<LoadedConfig> {
    let mut merged = Value::Object(Default::default());

    for p in paths {
        let s = fs::read_to_string(p).with_context(|| format!("read config: {p}"))?;
        let layer: serde_yaml::Value =
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml: {p}"))?;
        let layer = serde_json::to_value(layer)
            .with_context(|| format!("config layer is not representable as json: {p}"))?;
        merge_layer(&mut merged, layer);
    }

    let canonical_json = canonical_json(&merged);
    let config_hash = hex::encode(Sha256::digest(canonical_json.as_bytes()));

    Ok(LoadedConfig {
        config_json: merged,
        canonical_json,
        config_hash,
    })
}

#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config_json: Value,
    pub canonical_json: String,
    pub config_hash: String,
}

impl LoadedConfig {
    pub fn settings(&self) -> Result<Settings> {
        Settings::from_config(&self.config_json)
    }
}

fn merge_layer(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                merge_layer(base.entry(key).or_insert(Value::Null), value);
            }
        }
        (slot, layer) => *slot = layer,
    }
}

/// Render `v` with every object's keys in sorted order and no insignificant
/// whitespace. This is the hashing input; it is written directly rather than
/// rebuilding a sorted tree so the byte form cannot drift with the map
/// implementation behind `serde_json::Map`.
fn canonical_json(v: &Value) -> String {
    let mut out = String::new();
    write_canonical(v, &mut out);
    out
}

fn write_canonical(v: &Value, out: &mut String) {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(key).expect("json strings serialize"));
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&serde_json::to_string(leaf).expect("json leaves serialize")),
    }
}

// ---------------------------------------------------------------------------
// Typed settings
// ---------------------------------------------------------------------------

/// Engine settings read from the merged config. Everything has a default so
/// a minimal config only names the provider base URL and account.
#[derive(Debug, Clone)]
pub struct Settings {
    pub account_id: String,
    pub base_url: String,
    /// Analytical-query endpoint; defaults to `base_url`.
    pub analytics_base_url: String,
    pub pool_size: u32,
    pub page_limit: i64,
    pub max_parallel: usize,
    pub backfill_related_entities: bool,
    pub stale_run_max_age_minutes: i32,
    pub stuck_running_threshold_minutes: i32,
    pub webhook_tolerance_secs: i64,
}

fn cfg_str<'a>(v: &'a Value, ptr: &str) -> Option<&'a str> {
    v.pointer(ptr).and_then(|x| x.as_str())
}

fn cfg_i64(v: &Value, ptr: &str) -> Option<i64> {
    v.pointer(ptr).and_then(|x| x.as_i64())
}

fn cfg_bool(v: &Value, ptr: &str, default: bool) -> bool {
    v.pointer(ptr).and_then(|x| x.as_bool()).unwrap_or(default)
}

impl Settings {
    pub fn from_config(cfg: &Value) -> Result<Self> {
        let account_id = cfg_str(cfg, "/sync/account_id")
            .context("config missing sync.account_id")?
            .to_string();
        let base_url = cfg_str(cfg, "/provider/base_url")
            .context("config missing provider.base_url")?
            .to_string();
        let analytics_base_url = cfg_str(cfg, "/provider/analytics_base_url")
            .map(str::to_string)
            .unwrap_or_else(|| base_url.clone());

        Ok(Self {
            account_id,
            base_url,
            analytics_base_url,
            pool_size: cfg_i64(cfg, "/db/pool_size").unwrap_or(10) as u32,
            page_limit: cfg_i64(cfg, "/sync/page_limit").unwrap_or(100),
            max_parallel: cfg_i64(cfg, "/sync/max_parallel").unwrap_or(4) as usize,
            backfill_related_entities: cfg_bool(cfg, "/sync/backfill_related_entities", true),
            stale_run_max_age_minutes: cfg_i64(cfg, "/sync/stale_run_max_age_minutes")
                .unwrap_or(24 * 60) as i32,
            stuck_running_threshold_minutes: cfg_i64(cfg, "/sync/stuck_running_threshold_minutes")
                .unwrap_or(30) as i32,
            webhook_tolerance_secs: cfg_i64(cfg, "/webhook/tolerance_secs").unwrap_or(300),
        })
    }
}

/// Deterministic one-way hash of the remote API credential, stored on
/// `accounts._api_key_hash` so workers can look up their tenant without the
/// key itself ever reaching the database.
pub fn api_key_hash(api_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(api_key.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn write_yaml(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        f.write_all(content.as_bytes()).expect("write yaml");
        f
    }

    #[test]
    fn later_layers_override_earlier_ones() {
        let base = write_yaml("sync:\n  account_id: acct_1\n  max_parallel: 4\nprovider:\n  base_url: https://api.example.com\n");
        let env = write_yaml("sync:\n  max_parallel: 8\n");

        let loaded = load_layered_yaml(&[
            base.path().to_str().unwrap(),
            env.path().to_str().unwrap(),
        ])
        .unwrap();

        let settings = loaded.settings().unwrap();
        assert_eq!(settings.account_id, "acct_1");
        assert_eq!(settings.max_parallel, 8, "env layer wins");
        assert_eq!(settings.page_limit, 100, "defaults fill the gaps");
        assert_eq!(
            settings.analytics_base_url, settings.base_url,
            "analytics endpoint defaults to the provider base"
        );
    }

    #[test]
    fn canonical_json_sorts_keys_and_strips_whitespace() {
        let v = json!({"b": [1, 2], "a": {"z": null, "m": "x"}});
        assert_eq!(canonical_json(&v), r#"{"a":{"m":"x","z":null},"b":[1,2]}"#);
    }

    #[test]
    fn object_layers_merge_while_arrays_and_scalars_replace() {
        let mut base = json!({"sync": {"max_parallel": 4, "objects": ["customer"]}});
        merge_layer(
            &mut base,
            json!({"sync": {"objects": ["invoice"], "page_limit": 50}}),
        );
        assert_eq!(
            base,
            json!({"sync": {"max_parallel": 4, "objects": ["invoice"], "page_limit": 50}})
        );
    }

    #[test]
    fn config_hash_is_stable_across_key_order() {
        let a = write_yaml("sync:\n  account_id: acct_1\nprovider:\n  base_url: u\n");
        let b = write_yaml("provider:\n  base_url: u\nsync:\n  account_id: acct_1\n");

        let ha = load_layered_yaml(&[a.path().to_str().unwrap()]).unwrap().config_hash;
        let hb = load_layered_yaml(&[b.path().to_str().unwrap()]).unwrap().config_hash;
        assert_eq!(ha, hb);
    }

    #[test]
    fn missing_required_keys_are_reported_by_name() {
        let err = Settings::from_config(&json!({})).unwrap_err();
        assert!(err.to_string().contains("sync.account_id"));
    }

    #[test]
    fn api_key_hash_is_deterministic_and_one_way_shaped() {
        let h1 = api_key_hash("sk_live_abc");
        let h2 = api_key_hash("sk_live_abc");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64, "sha-256 hex");
        assert_ne!(h1, api_key_hash("sk_live_abd"));
        assert!(!h1.contains("sk_live"), "no credential material leaks through");
    }
}
