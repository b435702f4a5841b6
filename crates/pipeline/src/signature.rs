//! PayMongo webhook signature verification
//!
//! The gateway signs each delivery with a header of the form
//! `t=<unixSeconds>,te=<hex>,li=<hex>` where `te` carries the test-mode
//! signature and `li` the live-mode one. Either tag is accepted; unknown
//! keys are ignored. The signed payload is `"{t}.{rawBody}"` under
//! HMAC-SHA256 with the shared webhook secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::config::WebhookConfig;

type HmacSha256 = Hmac<Sha256>;

/// Why a signature was rejected. Verification itself is pure; the caller
/// logs the reason.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignatureRejection {
    MissingHeader,
    MissingTimestamp,
    MissingSignature,
    TimestampOutOfTolerance { drift_seconds: i64 },
    Mismatch,
    SecretNotConfigured,
}

impl std::fmt::Display for SignatureRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureRejection::MissingHeader => write!(f, "signature header missing"),
            SignatureRejection::MissingTimestamp => write!(f, "header has no timestamp"),
            SignatureRejection::MissingSignature => write!(f, "header has no te or li signature"),
            SignatureRejection::TimestampOutOfTolerance { drift_seconds } => {
                write!(f, "timestamp drift {}s exceeds tolerance", drift_seconds)
            }
            SignatureRejection::Mismatch => write!(f, "signature mismatch"),
            SignatureRejection::SecretNotConfigured => write!(f, "webhook secret not configured"),
        }
    }
}

/// Parsed `t=..,te=..,li=..` header
#[derive(Debug, Default)]
struct SignatureHeader {
    timestamp: Option<i64>,
    test_signature: Option<String>,
    live_signature: Option<String>,
}

fn parse_header(header: &str) -> SignatureHeader {
    let mut parsed = SignatureHeader::default();
    for part in header.split(',') {
        let kv: Vec<&str> = part.trim().splitn(2, '=').collect();
        if kv.len() != 2 {
            continue;
        }
        match kv[0] {
            "t" => parsed.timestamp = kv[1].parse().ok(),
            "te" => parsed.test_signature = Some(kv[1].to_string()),
            "li" => parsed.live_signature = Some(kv[1].to_string()),
            // Extra keys are tolerated per the header contract
            _ => {}
        }
    }
    parsed
}

/// Verify a raw webhook body against the signature header.
///
/// Returns `Ok(())` when the delivery is authentic, or the specific
/// rejection reason. With no secret configured, verification succeeds only
/// if enforcement is explicitly disabled; otherwise it fails closed.
pub fn verify_signature(
    raw_body: &[u8],
    header: Option<&str>,
    config: &WebhookConfig,
) -> Result<(), SignatureRejection> {
    verify_signature_at(raw_body, header, config, OffsetDateTime::now_utc().unix_timestamp())
}

/// Verification with an injectable clock, for the tolerance checks
pub(crate) fn verify_signature_at(
    raw_body: &[u8],
    header: Option<&str>,
    config: &WebhookConfig,
    now_unix: i64,
) -> Result<(), SignatureRejection> {
    let secret = match &config.secret {
        Some(s) => s,
        None => {
            if config.enforce_signature {
                return Err(SignatureRejection::SecretNotConfigured);
            }
            return Ok(());
        }
    };

    let header = header.ok_or(SignatureRejection::MissingHeader)?;
    let parsed = parse_header(header);

    let timestamp = parsed.timestamp.ok_or(SignatureRejection::MissingTimestamp)?;
    if parsed.test_signature.is_none() && parsed.live_signature.is_none() {
        return Err(SignatureRejection::MissingSignature);
    }

    if config.tolerance_seconds > 0 {
        // Saturating: the header timestamp is attacker-controlled and may
        // sit at the i64 extremes
        let drift = now_unix.saturating_sub(timestamp).saturating_abs();
        if drift > config.tolerance_seconds {
            return Err(SignatureRejection::TimestampOutOfTolerance {
                drift_seconds: drift,
            });
        }
    }

    let expected = compute_signature(secret, timestamp, raw_body);

    for candidate in [parsed.test_signature, parsed.live_signature]
        .into_iter()
        .flatten()
    {
        // Constant-time comparison over the lower-cased hex forms
        let candidate = candidate.to_lowercase();
        if candidate.as_bytes().ct_eq(expected.as_bytes()).into() {
            return Ok(());
        }
    }

    Err(SignatureRejection::Mismatch)
}

/// `hex(HMAC-SHA256(secret, "{t}.{rawBody}"))`, lower-cased
pub fn compute_signature(secret: &str, timestamp: i64, raw_body: &[u8]) -> String {
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        // HMAC accepts keys of any length; unreachable for &[u8] input
        Err(_) => return String::new(),
    };
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(raw_body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_secret(tolerance: i64) -> WebhookConfig {
        WebhookConfig {
            secret: Some("whsk_test_secret".to_string()),
            enforce_signature: true,
            tolerance_seconds: tolerance,
            receipt_liveness_seconds: 120,
        }
    }

    fn signed_header(secret: &str, timestamp: i64, body: &[u8], tag: &str) -> String {
        format!("t={},{}={}", timestamp, tag, compute_signature(secret, timestamp, body))
    }

    #[test]
    fn round_trip_verifies() {
        let config = config_with_secret(0);
        let body = br#"{"data":{"id":"evt_1"}}"#;
        let header = signed_header("whsk_test_secret", 1_700_000_000, body, "te");

        assert_eq!(
            verify_signature_at(body, Some(&header), &config, 1_700_000_000),
            Ok(())
        );
    }

    #[test]
    fn single_byte_change_fails() {
        let config = config_with_secret(0);
        let body = br#"{"data":{"id":"evt_1"}}"#;
        let header = signed_header("whsk_test_secret", 1_700_000_000, body, "te");
        let tampered = br#"{"data":{"id":"evt_2"}}"#;

        assert_eq!(
            verify_signature_at(tampered, Some(&header), &config, 1_700_000_000),
            Err(SignatureRejection::Mismatch)
        );
    }

    #[test]
    fn live_tag_is_accepted() {
        let config = config_with_secret(0);
        let body = b"payload";
        let header = signed_header("whsk_test_secret", 42, body, "li");

        assert_eq!(verify_signature_at(body, Some(&header), &config, 42), Ok(()));
    }

    #[test]
    fn match_on_either_tag_accepted() {
        let config = config_with_secret(0);
        let body = b"payload";
        let good = compute_signature("whsk_test_secret", 42, body);
        // te is wrong, li is right
        let header = format!("t=42,te=deadbeef,li={}", good);

        assert_eq!(verify_signature_at(body, Some(&header), &config, 42), Ok(()));
    }

    #[test]
    fn unknown_keys_are_tolerated() {
        let config = config_with_secret(0);
        let body = b"payload";
        let good = compute_signature("whsk_test_secret", 42, body);
        let header = format!("v0=zzz,t=42,extra=1,te={}", good);

        assert_eq!(verify_signature_at(body, Some(&header), &config, 42), Ok(()));
    }

    #[test]
    fn missing_timestamp_rejected() {
        let config = config_with_secret(0);
        let header = "te=abc123";

        assert_eq!(
            verify_signature_at(b"x", Some(header), &config, 42),
            Err(SignatureRejection::MissingTimestamp)
        );
    }

    #[test]
    fn missing_both_signatures_rejected() {
        let config = config_with_secret(0);
        let header = "t=42,v1=abc123";

        assert_eq!(
            verify_signature_at(b"x", Some(header), &config, 42),
            Err(SignatureRejection::MissingSignature)
        );
    }

    #[test]
    fn stale_timestamp_rejected_within_tolerance_accepted() {
        let config = config_with_secret(300);
        let body = b"payload";
        let header = signed_header("whsk_test_secret", 1_000, body, "te");

        // 200s drift: fine
        assert_eq!(verify_signature_at(body, Some(&header), &config, 1_200), Ok(()));
        // 301s drift: rejected
        assert_eq!(
            verify_signature_at(body, Some(&header), &config, 1_301),
            Err(SignatureRejection::TimestampOutOfTolerance { drift_seconds: 301 })
        );
    }

    #[test]
    fn extreme_timestamps_reject_without_panicking() {
        let config = config_with_secret(300);

        // i64::MIN would overflow a plain subtraction; must degrade to a
        // tolerance rejection, never a panic
        let header = format!("t={},te=abcd", i64::MIN);
        assert!(matches!(
            verify_signature_at(b"{}", Some(&header), &config, 1_700_000_000),
            Err(SignatureRejection::TimestampOutOfTolerance { .. })
        ));

        let header = format!("t={},te=abcd", i64::MAX);
        assert!(matches!(
            verify_signature_at(b"{}", Some(&header), &config, -1),
            Err(SignatureRejection::TimestampOutOfTolerance { .. })
        ));
    }

    #[test]
    fn no_secret_fails_closed_when_enforced() {
        let config = WebhookConfig {
            secret: None,
            enforce_signature: true,
            ..WebhookConfig::default()
        };

        assert_eq!(
            verify_signature_at(b"x", Some("t=1,te=abc"), &config, 1),
            Err(SignatureRejection::SecretNotConfigured)
        );
    }

    #[test]
    fn no_secret_passes_only_when_enforcement_disabled() {
        let config = WebhookConfig {
            secret: None,
            enforce_signature: false,
            ..WebhookConfig::default()
        };

        assert_eq!(verify_signature_at(b"x", None, &config, 1), Ok(()));
    }

    #[test]
    fn uppercase_header_signature_still_matches() {
        let config = config_with_secret(0);
        let body = b"payload";
        let sig = compute_signature("whsk_test_secret", 42, body).to_uppercase();
        let header = format!("t=42,te={}", sig);

        assert_eq!(verify_signature_at(body, Some(&header), &config, 42), Ok(()));
    }
}
