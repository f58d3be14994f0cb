//! Runtime secret resolution.
//!
//! # Contract
//! - Config YAML stores only **env var NAMES** (e.g. `"MIR_PROVIDER_API_KEY"`).
//! - Callers invoke [`resolve_secrets`] once at startup and pass the result
//!   into constructors; never scatter `std::env::var` calls across the codebase.
//! - `Debug` output **redacts** values.
//! - Error messages reference the env var **NAME**, never the value.

use anyhow::{bail, Result};
use serde_json::Value;

/// All runtime-resolved secrets for one engine instantiation.
///
/// Built **once** at startup via [`resolve_secrets`]. **Values are redacted
/// in `Debug` output.**
#[derive(Clone)]
pub struct ResolvedSecrets {
    /// Remote provider API key. Required.
    pub api_key: String,
    /// Per-account webhook signing secret. `None` when the deployment does
    /// not receive webhooks.
    pub webhook_secret: Option<String>,
    /// Analytical-query credential; falls back to `api_key` when the
    /// provider uses one key for both surfaces.
    pub analytics_api_key: Option<String>,
}

impl std::fmt::Debug for ResolvedSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolvedSecrets")
            .field("api_key", &"<REDACTED>")
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "<REDACTED>"),
            )
            .field(
                "analytics_api_key",
                &self.analytics_api_key.as_ref().map(|_| "<REDACTED>"),
            )
            .finish()
    }
}

fn env_name<'a>(cfg: &'a Value, ptr: &str, default: &'a str) -> &'a str {
    cfg.pointer(ptr).and_then(Value::as_str).unwrap_or(default)
}

fn read_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

/// Resolve secrets from the env vars named in the config.
pub fn resolve_secrets(cfg: &Value) -> Result<ResolvedSecrets> {
    let api_key_var = env_name(cfg, "/provider/api_key_env", "MIR_PROVIDER_API_KEY");
    let webhook_var = env_name(cfg, "/webhook/secret_env", "MIR_WEBHOOK_SECRET");
    let analytics_var = env_name(cfg, "/provider/analytics_api_key_env", "MIR_ANALYTICS_API_KEY");

    let Some(api_key) = read_env(api_key_var) else {
        bail!("required env var {api_key_var} is missing or empty");
    };

    Ok(ResolvedSecrets {
        api_key,
        webhook_secret: read_env(webhook_var),
        analytics_api_key: read_env(analytics_var),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn debug_never_prints_values() {
        let secrets = ResolvedSecrets {
            api_key: "sk_live_supersecret".to_string(),
            webhook_secret: Some("whsec_alsosecret".to_string()),
            analytics_api_key: None,
        };
        let out = format!("{secrets:?}");
        assert!(!out.contains("supersecret"));
        assert!(!out.contains("alsosecret"));
        assert!(out.contains("<REDACTED>"));
    }

    #[test]
    fn missing_required_key_names_the_env_var() {
        let cfg = json!({"provider": {"api_key_env": "MIR_TEST_DEFINITELY_UNSET"}});
        let err = resolve_secrets(&cfg).unwrap_err();
        assert!(err.to_string().contains("MIR_TEST_DEFINITELY_UNSET"));
    }

    #[test]
    fn optional_secrets_resolve_to_none_when_absent() {
        std::env::set_var("MIR_TEST_API_KEY_PRESENT", "sk_test_1");
        let cfg = json!({
            "provider": {"api_key_env": "MIR_TEST_API_KEY_PRESENT"},
            "webhook": {"secret_env": "MIR_TEST_WEBHOOK_UNSET"}
        });
        let secrets = resolve_secrets(&cfg).unwrap();
        assert_eq!(secrets.api_key, "sk_test_1");
        assert!(secrets.webhook_secret.is_none());
        std::env::remove_var("MIR_TEST_API_KEY_PRESENT");
    }
}
