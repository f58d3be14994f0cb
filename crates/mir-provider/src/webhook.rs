//! Webhook payload verification and decoding.
//!
//! The provider signs each delivery with a per-account shared secret:
//! the signature header carries the send timestamp and an HMAC-SHA256 over
//! `"{timestamp}.{raw_body}"`. Verification must happen against the raw
//! bytes, before any decoding, and a failure applies nothing.

use hmac::{Hmac, Mac};
use mir_schemas::WebhookEvent;
use sha2::Sha256;

use crate::ProviderError;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `t=<unix>,v1=<hex hmac>`.
pub const SIGNATURE_HEADER: &str = "mir-signature";

/// Default tolerance for the send-timestamp freshness check.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verify a webhook delivery.
///
/// `now_unix` is injected so callers (and tests) control the clock. The
/// timestamp check bounds replay of captured deliveries; the HMAC comparison
/// is constant-time via `Mac::verify_slice`.
pub fn verify_signature(
    secret: &str,
    payload: &str,
    signature_header: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> Result<(), ProviderError> {
    if secret.is_empty() {
        return Err(ProviderError::Auth("missing webhook secret".to_string()));
    }

    let (timestamp, signature_hex) = parse_signature_header(signature_header)?;

    if (now_unix - timestamp).abs() > tolerance_secs {
        return Err(ProviderError::Auth(format!(
            "signature timestamp outside tolerance: t={timestamp} now={now_unix}"
        )));
    }

    let signature = hex::decode(signature_hex)
        .map_err(|_| ProviderError::Auth("signature is not hex".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| ProviderError::Auth("invalid webhook secret".to_string()))?;
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload.as_bytes());
    mac.verify_slice(&signature)
        .map_err(|_| ProviderError::Auth("signature mismatch".to_string()))
}

/// Sign a payload the way the provider does. Test fixture helper; kept next
/// to the verifier so the two cannot drift.
pub fn sign_payload(secret: &str, payload: &str, timestamp: i64) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload.as_bytes());
    let sig = hex::encode(mac.finalize().into_bytes());
    format!("t={timestamp},v1={sig}")
}

fn parse_signature_header(header: &str) -> Result<(i64, &str), ProviderError> {
    let mut timestamp: Option<i64> = None;
    let mut signature: Option<&str> = None;

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", v)) => {
                timestamp = v.parse::<i64>().ok();
            }
            Some(("v1", v)) => {
                signature = Some(v);
            }
            _ => {}
        }
    }

    match (timestamp, signature) {
        (Some(t), Some(s)) if !s.is_empty() => Ok((t, s)),
        _ => Err(ProviderError::Auth(format!(
            "malformed signature header: {header:?}"
        ))),
    }
}

/// Decode a verified payload into the event envelope.
pub fn decode_event(payload: &str) -> Result<WebhookEvent, ProviderError> {
    serde_json::from_str(payload).map_err(|e| ProviderError::Decode(format!("event body: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const BODY: &str = r#"{"id":"evt_1","type":"customer.updated","created":1715000000,"data":{"object":{"id":"cus_1","object":"customer"}}}"#;

    #[test]
    fn valid_signature_verifies() {
        let header = sign_payload(SECRET, BODY, 1_715_000_000);
        verify_signature(SECRET, BODY, &header, DEFAULT_TOLERANCE_SECS, 1_715_000_010)
            .expect("fresh, correctly signed payload verifies");
    }

    #[test]
    fn tampered_body_is_rejected() {
        let header = sign_payload(SECRET, BODY, 1_715_000_000);
        let tampered = BODY.replace("cus_1", "cus_2");
        let err =
            verify_signature(SECRET, &tampered, &header, DEFAULT_TOLERANCE_SECS, 1_715_000_010)
                .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let header = sign_payload(SECRET, BODY, 1_715_000_000);
        let err = verify_signature(
            "whsec_other",
            BODY,
            &header,
            DEFAULT_TOLERANCE_SECS,
            1_715_000_010,
        )
        .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let header = sign_payload(SECRET, BODY, 1_715_000_000);
        let err = verify_signature(
            SECRET,
            BODY,
            &header,
            DEFAULT_TOLERANCE_SECS,
            1_715_000_000 + DEFAULT_TOLERANCE_SECS + 1,
        )
        .unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        for header in ["", "t=,v1=", "v1=abcd", "t=123", "nonsense"] {
            let err = verify_signature(SECRET, BODY, header, DEFAULT_TOLERANCE_SECS, 0)
                .unwrap_err();
            assert!(matches!(err, ProviderError::Auth(_)), "header {header:?}");
        }
    }

    #[test]
    fn missing_secret_is_auth_not_panic() {
        let header = sign_payload(SECRET, BODY, 0);
        let err = verify_signature("", BODY, &header, DEFAULT_TOLERANCE_SECS, 0).unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[test]
    fn decode_event_reads_the_envelope() {
        let ev = decode_event(BODY).unwrap();
        assert_eq!(ev.id, "evt_1");
        assert_eq!(ev.event_type, "customer.updated");
        assert!(!ev.is_delete());
        assert_eq!(ev.data.object["id"], "cus_1");
    }

    #[test]
    fn decode_rejects_malformed_events() {
        assert!(decode_event("{}").is_err());
        assert!(decode_event("not json").is_err());
    }
}
