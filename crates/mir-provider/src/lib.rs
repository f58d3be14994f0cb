//! mir-provider
//!
//! The remote-provider boundary. This crate owns the transport traits the
//! engine is written against, the reqwest adapters that implement them, and
//! webhook signature verification. It does **not** touch the DB; callers
//! fetch pages and hand them to mir-db.

pub mod analytics;
pub mod rest;
pub mod webhook;

pub use analytics::{
    parse_csv_rows, poll_query_run, AnalyticsClient, QueryRunState, QueryRunStatus,
    RestAnalyticsClient,
};
pub use rest::{RestRemoteClient, RetryPolicy};
pub use webhook::{decode_event, verify_signature, SIGNATURE_HEADER};

use mir_schemas::{ListParams, ObjectPage};
use serde_json::Value;
use std::fmt;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors a provider adapter may return.
///
/// The engine routes on the *kind*: transient kinds are retried at this
/// boundary with backoff, `PermissionDenied` can be downgraded to a skip,
/// `Auth` surfaces without touching any state, everything else fails the
/// current object-run.
#[derive(Debug)]
pub enum ProviderError {
    /// Network or transport failure (connect, timeout, 5xx).
    Transport(String),
    /// The provider applied rate limiting; retry after the given delay.
    RateLimited { retry_after_secs: Option<u64> },
    /// The upstream API returned an application-level error.
    Api { status: Option<u16>, message: String },
    /// The caller's credential cannot access this endpoint (403).
    PermissionDenied(String),
    /// Webhook signature mismatch, missing secret, or a rejected credential.
    Auth(String),
    /// A response payload could not be decoded.
    Decode(String),
    /// A required configuration value is missing or invalid.
    Config(String),
}

impl ProviderError {
    /// Transient kinds the transport retries with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::Transport(_) | ProviderError::RateLimited { .. }
        )
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }

    /// The error class `skip_inaccessible` downgrades to a skip.
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, ProviderError::PermissionDenied(_))
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Transport(msg) => write!(f, "transport error: {msg}"),
            ProviderError::RateLimited {
                retry_after_secs: Some(s),
            } => write!(f, "rate limited: retry after {s}s"),
            ProviderError::RateLimited {
                retry_after_secs: None,
            } => write!(f, "rate limited"),
            ProviderError::Api {
                status: Some(code),
                message,
            } => write!(f, "provider api error status={code}: {message}"),
            ProviderError::Api {
                status: None,
                message,
            } => write!(f, "provider api error: {message}"),
            ProviderError::PermissionDenied(msg) => write!(f, "permission denied: {msg}"),
            ProviderError::Auth(msg) => write!(f, "auth error: {msg}"),
            ProviderError::Decode(msg) => write!(f, "decode error: {msg}"),
            ProviderError::Config(msg) => write!(f, "config error: {msg}"),
        }
    }
}

impl std::error::Error for ProviderError {}

// ---------------------------------------------------------------------------
// Remote REST contract
// ---------------------------------------------------------------------------

/// Paginated list / single retrieve against the provider's REST surface.
///
/// `path` is the endpoint path from the resource registry (`/v1/customers`);
/// implementations must be object-safe so the engine can hold an
/// `Arc<dyn RemoteClient>` without knowing the concrete type, and
/// `Send + Sync` so workers share one instance.
#[async_trait::async_trait]
pub trait RemoteClient: Send + Sync {
    /// Human-readable adapter name for logs.
    fn source_name(&self) -> &'static str;

    /// Fetch one page. Returns rows in provider order (newest first).
    async fn list(&self, path: &str, params: &ListParams) -> Result<ObjectPage, ProviderError>;

    /// Fetch a single object by id.
    async fn retrieve(&self, path: &str, id: &str) -> Result<Value, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullClient;

    #[async_trait::async_trait]
    impl RemoteClient for NullClient {
        fn source_name(&self) -> &'static str {
            "null"
        }

        async fn list(
            &self,
            _path: &str,
            _params: &ListParams,
        ) -> Result<ObjectPage, ProviderError> {
            Ok(ObjectPage::default())
        }

        async fn retrieve(&self, _path: &str, _id: &str) -> Result<Value, ProviderError> {
            Err(ProviderError::Api {
                status: Some(404),
                message: "no such object".to_string(),
            })
        }
    }

    #[test]
    fn remote_client_is_object_safe_via_box() {
        // Compile-time proof: trait object can be constructed.
        let _c: Box<dyn RemoteClient> = Box::new(NullClient);
    }

    #[test]
    fn error_kinds_classify() {
        assert!(ProviderError::Transport("reset".into()).is_transient());
        assert!(ProviderError::RateLimited {
            retry_after_secs: Some(2)
        }
        .is_transient());
        assert!(!ProviderError::Auth("bad sig".into()).is_transient());
        assert!(ProviderError::PermissionDenied("restricted key".into()).is_permission_denied());
    }

    #[test]
    fn error_display_is_stable() {
        assert_eq!(
            ProviderError::Api {
                status: Some(400),
                message: "bad cursor".into()
            }
            .to_string(),
            "provider api error status=400: bad cursor"
        );
        assert_eq!(
            ProviderError::RateLimited {
                retry_after_secs: Some(3)
            }
            .to_string(),
            "rate limited: retry after 3s"
        );
    }
}
