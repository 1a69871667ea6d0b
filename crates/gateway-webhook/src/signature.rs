use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::WebhookError;

type HmacSha256 = Hmac<Sha256>;

/// Default window within which a signed timestamp is accepted.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

/// Verifies the gateway's `t=<unix>,v1=<hex>` signature header over
/// `"{t}.{payload}"`. Runs before anything else touches the payload;
/// a failure here never reaches business logic.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now_unix: i64,
) -> Result<(), WebhookError> {
    let mut timestamp: Option<i64> = None;
    let mut provided: Option<String> = None;
    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", raw)) => {
                timestamp = raw.parse().ok();
            }
            Some(("v1", raw)) => {
                provided = Some(raw.to_string());
            }
            _ => {}
        }
    }
    let timestamp = timestamp
        .ok_or_else(|| WebhookError::BadSignature("missing timestamp".to_string()))?;
    let provided =
        provided.ok_or_else(|| WebhookError::BadSignature("missing v1 digest".to_string()))?;

    if (now_unix - timestamp).abs() > tolerance_secs {
        return Err(WebhookError::BadSignature(
            "signed timestamp outside tolerance".to_string(),
        ));
    }

    let provided_bytes = decode_hex(&provided)
        .ok_or_else(|| WebhookError::BadSignature("v1 digest is not hex".to_string()))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| WebhookError::BadSignature(e.to_string()))?;
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    // verify_slice compares in constant time.
    mac.verify_slice(&provided_bytes)
        .map_err(|_| WebhookError::BadSignature("digest mismatch".to_string()))?;
    Ok(())
}

/// Produces the signature header a sender would attach; the webhook tests
/// and local tooling sign with this.
pub fn sign_payload(payload: &[u8], secret: &str, now_unix: i64) -> String {
    let digest = compute_digest(payload, now_unix, secret).unwrap_or_default();
    format!("t={now_unix},v1={digest}")
}

fn compute_digest(payload: &[u8], timestamp: i64, secret: &str) -> Result<String, String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| e.to_string())?;
    mac.update(format!("{timestamp}.").as_bytes());
    mac.update(payload);
    let bytes = mac.finalize().into_bytes();
    Ok(bytes.iter().map(|b| format!("{b:02x}")).collect())
}

fn decode_hex(raw: &str) -> Option<Vec<u8>> {
    if raw.len() % 2 != 0 {
        return None;
    }
    (0..raw.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&raw[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signed_payload_verifies() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign_payload(payload, "whsec_test", 1_700_000_000);
        verify_signature(payload, &header, "whsec_test", DEFAULT_TOLERANCE_SECS, 1_700_000_010)
            .expect("valid signature");
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let header = sign_payload(br#"{"amount":1}"#, "whsec_test", 1_700_000_000);
        let err = verify_signature(
            br#"{"amount":2}"#,
            &header,
            "whsec_test",
            DEFAULT_TOLERANCE_SECS,
            1_700_000_000,
        )
        .expect_err("tampered");
        assert!(err.to_string().contains("mismatch"));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign_payload(payload, "whsec_a", 1_700_000_000);
        assert!(verify_signature(
            payload,
            &header,
            "whsec_b",
            DEFAULT_TOLERANCE_SECS,
            1_700_000_000
        )
        .is_err());
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let payload = br#"{}"#;
        let header = sign_payload(payload, "whsec_test", 1_700_000_000);
        let err = verify_signature(
            payload,
            &header,
            "whsec_test",
            DEFAULT_TOLERANCE_SECS,
            1_700_000_000 + 3_600,
        )
        .expect_err("stale");
        assert!(err.to_string().contains("tolerance"));
    }

    #[test]
    fn malformed_headers_are_rejected() {
        for header in ["", "t=abc,v1=00", "v1=00", "t=1700000000"] {
            assert!(
                verify_signature(b"{}", header, "whsec_test", DEFAULT_TOLERANCE_SECS, 1_700_000_000)
                    .is_err(),
                "{header} should fail"
            );
        }
    }
}
