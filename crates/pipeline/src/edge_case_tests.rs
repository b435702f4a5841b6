// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Webhook Pipeline
//!
//! Tests critical boundary conditions in:
//! - Signature verification (PIPE-S01 to PIPE-S06)
//! - Deduplication keys (PIPE-K01 to PIPE-K04)
//! - Retry backoff (PIPE-B01 to PIPE-B04)
//! - Amount reconciliation (PIPE-A01 to PIPE-A04)
//! - Outbox targets (PIPE-T01 to PIPE-T05)

#[cfg(test)]
mod signature_edge_tests {
    use crate::config::WebhookConfig;
    use crate::signature::compute_signature;

    fn config(tolerance: i64) -> WebhookConfig {
        WebhookConfig {
            secret: Some("whsk_edge".to_string()),
            enforce_signature: true,
            tolerance_seconds: tolerance,
            receipt_liveness_seconds: 120,
        }
    }

    fn verify(body: &[u8], header: &str, config: &WebhookConfig, now: i64) -> bool {
        crate::signature::verify_signature_at(body, Some(header), config, now).is_ok()
    }

    // =========================================================================
    // PIPE-S01: Drift exactly at the tolerance bound - must be accepted
    // =========================================================================
    #[test]
    fn test_drift_exactly_at_tolerance_accepted() {
        let cfg = config(300);
        let body = b"{}";
        let header = format!("t=1000,te={}", compute_signature("whsk_edge", 1000, body));

        assert!(verify(body, &header, &cfg, 1300), "300s drift is inside");
        assert!(!verify(body, &header, &cfg, 1301), "301s drift is outside");
    }

    // =========================================================================
    // PIPE-S02: Future-dated timestamp - drift is absolute, both directions
    // =========================================================================
    #[test]
    fn test_future_timestamp_also_bounded() {
        let cfg = config(300);
        let body = b"{}";
        let header = format!("t=2000,te={}", compute_signature("whsk_edge", 2000, body));

        assert!(verify(body, &header, &cfg, 1700));
        assert!(!verify(body, &header, &cfg, 1699));
    }

    // =========================================================================
    // PIPE-S03: Zero tolerance disables the replay-window check entirely
    // =========================================================================
    #[test]
    fn test_zero_tolerance_skips_window_check() {
        let cfg = config(0);
        let body = b"{}";
        let header = format!("t=1,te={}", compute_signature("whsk_edge", 1, body));

        // A decade of drift still verifies when the window is disabled
        assert!(verify(body, &header, &cfg, 315_360_000));
    }

    // =========================================================================
    // PIPE-S04: Signature computed with a different secret never matches
    // =========================================================================
    #[test]
    fn test_wrong_secret_rejected() {
        let cfg = config(0);
        let body = b"{}";
        let header = format!("t=1,te={}", compute_signature("other_secret", 1, body));

        assert!(!verify(body, &header, &cfg, 1));
    }

    // =========================================================================
    // PIPE-S05: Multibyte body bytes are signed as raw bytes, not text
    // =========================================================================
    #[test]
    fn test_multibyte_body_round_trips() {
        let cfg = config(0);
        let body = "{\"note\":\"pambayad ng miyembro — ₱999\"}".as_bytes();
        let header = format!("t=7,li={}", compute_signature("whsk_edge", 7, body));

        assert!(verify(body, &header, &cfg, 7));
    }

    // =========================================================================
    // PIPE-S06: Garbage header segments degrade to the specific rejection
    // =========================================================================
    #[test]
    fn test_garbage_header_segments() {
        use crate::signature::SignatureRejection;

        let cfg = config(0);
        let result = crate::signature::verify_signature_at(b"{}", Some(",,==,t=,te"), &cfg, 1);

        // No parseable timestamp survives that header
        assert_eq!(result, Err(SignatureRejection::MissingTimestamp));
    }
}

#[cfg(test)]
mod dedup_key_tests {
    use crate::paymongo::parse_event;

    // =========================================================================
    // PIPE-K01: Empty-string envelope id falls back to the composite key
    // =========================================================================
    #[test]
    fn test_empty_envelope_id_uses_composite() {
        let body = serde_json::json!({
            "data": {
                "id": "",
                "attributes": {
                    "type": "payment.paid",
                    "data": { "id": "cs_77" }
                }
            }
        })
        .to_string();

        let event = parse_event(body.as_bytes()).unwrap();
        assert_eq!(event.event_key(), "payment.paid:cs_77:-");
    }

    // =========================================================================
    // PIPE-K02: Composite key with no resource and no payment still distinct
    //           per event type
    // =========================================================================
    #[test]
    fn test_bare_composite_keys_differ_by_type() {
        let body_for = |event_type: &str| {
            serde_json::json!({
                "data": { "attributes": { "type": event_type } }
            })
            .to_string()
        };

        let paid = parse_event(body_for("payment.paid").as_bytes()).unwrap();
        let failed = parse_event(body_for("payment.failed").as_bytes()).unwrap();

        assert_ne!(paid.event_key(), failed.event_key());
    }

    // =========================================================================
    // PIPE-K03: Paid and failed events for the same session never collide
    // =========================================================================
    #[test]
    fn test_same_session_different_kind_distinct_keys() {
        let body_for = |event_type: &str| {
            serde_json::json!({
                "data": {
                    "attributes": {
                        "type": event_type,
                        "data": {
                            "id": "cs_shared",
                            "attributes": { "payments": [ { "id": "pay_1" } ] }
                        }
                    }
                }
            })
            .to_string()
        };

        let paid = parse_event(body_for("checkout_session.payment.paid").as_bytes()).unwrap();
        let failed = parse_event(body_for("payment.failed").as_bytes()).unwrap();

        assert_ne!(paid.event_key(), failed.event_key());
    }

    // =========================================================================
    // PIPE-K04: Second payment attempt on the same session gets its own key
    // =========================================================================
    #[test]
    fn test_retried_payment_on_session_gets_new_key() {
        let body_for = |payment_id: &str| {
            serde_json::json!({
                "data": {
                    "attributes": {
                        "type": "payment.failed",
                        "data": {
                            "id": "cs_shared",
                            "attributes": { "payments": [ { "id": payment_id } ] }
                        }
                    }
                }
            })
            .to_string()
        };

        let first = parse_event(body_for("pay_1").as_bytes()).unwrap();
        let second = parse_event(body_for("pay_2").as_bytes()).unwrap();

        assert_ne!(first.event_key(), second.event_key());
    }
}

#[cfg(test)]
mod backoff_tests {
    use crate::dispatcher::retry_delay_seconds;

    // =========================================================================
    // PIPE-B01: Default schedule doubles from the base up to 64x
    // =========================================================================
    #[test]
    fn test_default_schedule() {
        let schedule: Vec<i64> = (1..=8).map(|a| retry_delay_seconds(5, a)).collect();
        assert_eq!(schedule, vec![5, 10, 20, 40, 80, 160, 320, 320]);
    }

    // =========================================================================
    // PIPE-B02: Saturating multiply - absurd base never overflows
    // =========================================================================
    #[test]
    fn test_huge_base_saturates() {
        let delay = retry_delay_seconds(i64::MAX / 2, 100);
        assert_eq!(delay, i64::MAX);
    }

    // =========================================================================
    // PIPE-B03: Attempt counts below one behave like the first attempt
    // =========================================================================
    #[test]
    fn test_underflowing_attempt_count() {
        assert_eq!(retry_delay_seconds(7, 0), 7);
        assert_eq!(retry_delay_seconds(7, -5), 7);
    }

    // =========================================================================
    // PIPE-B04: One-second base still yields a usable schedule
    // =========================================================================
    #[test]
    fn test_minimum_base() {
        assert_eq!(retry_delay_seconds(1, 1), 1);
        assert_eq!(retry_delay_seconds(1, 7), 64);
    }
}

#[cfg(test)]
mod amount_tests {
    use crate::membership::{amount_within_tolerance, extract_plan_token, AMOUNT_TOLERANCE_CENTAVOS};

    // =========================================================================
    // PIPE-A01: Tolerance bound is inclusive on both sides
    // =========================================================================
    #[test]
    fn test_tolerance_bound_inclusive() {
        let expected = 99_900;
        assert!(amount_within_tolerance(expected, expected + AMOUNT_TOLERANCE_CENTAVOS));
        assert!(amount_within_tolerance(expected, expected - AMOUNT_TOLERANCE_CENTAVOS));
        assert!(!amount_within_tolerance(expected, expected + AMOUNT_TOLERANCE_CENTAVOS + 1));
        assert!(!amount_within_tolerance(expected, expected - AMOUNT_TOLERANCE_CENTAVOS - 1));
    }

    // =========================================================================
    // PIPE-A02: Zero-amount invoice only matches near-zero reports
    // =========================================================================
    #[test]
    fn test_zero_expected_amount() {
        assert!(amount_within_tolerance(0, 0));
        assert!(amount_within_tolerance(0, 50));
        assert!(!amount_within_tolerance(0, 51));
    }

    // =========================================================================
    // PIPE-A03: Plan token extraction from free-form invoice notes
    // =========================================================================
    #[test]
    fn test_plan_token_in_sentence() {
        assert_eq!(
            extract_plan_token("renewal for plan:annual-2026, walk-in"),
            Some("annual-2026".to_string())
        );
        assert_eq!(extract_plan_token("no token here"), None);
    }

    // =========================================================================
    // PIPE-A04: Token grammar is lower-case; labels are not sniffed loosely
    // =========================================================================
    #[test]
    fn test_plan_token_grammar() {
        assert_eq!(extract_plan_token("plan:MONTHLY"), None);
        assert_eq!(
            extract_plan_token("plan:monthly extra plan:annual"),
            Some("monthly".to_string()),
            "first token wins"
        );
    }
}

#[cfg(test)]
mod outbox_target_tests {
    use crate::error::PipelineError;
    use crate::outbox::OutboxTarget;
    use uuid::Uuid;

    // =========================================================================
    // PIPE-T01: Targets round-trip through their column encoding
    // =========================================================================
    #[test]
    fn test_targets_round_trip() {
        let user = Uuid::new_v4();
        for target in [
            OutboxTarget::BackOffice,
            OutboxTarget::Role("treasurer".to_string()),
            OutboxTarget::User(user),
        ] {
            let decoded =
                OutboxTarget::from_columns(target.kind(), target.value().as_deref()).unwrap();
            assert_eq!(decoded, target);
        }
    }

    // =========================================================================
    // PIPE-T02: Role target with no value is corrupt, not defaulted
    // =========================================================================
    #[test]
    fn test_role_without_value_rejected() {
        assert!(matches!(
            OutboxTarget::from_columns("role", None),
            Err(PipelineError::Validation(_))
        ));
    }

    // =========================================================================
    // PIPE-T03: User target with a non-UUID value is corrupt
    // =========================================================================
    #[test]
    fn test_user_with_bad_uuid_rejected() {
        assert!(matches!(
            OutboxTarget::from_columns("user", Some("not-a-uuid")),
            Err(PipelineError::Validation(_))
        ));
    }

    // =========================================================================
    // PIPE-T04: Unknown target kind is corrupt
    // =========================================================================
    #[test]
    fn test_unknown_kind_rejected() {
        assert!(matches!(
            OutboxTarget::from_columns("broadcast", None),
            Err(PipelineError::Validation(_))
        ));
    }

    // =========================================================================
    // PIPE-T05: Back-office target carries no value column
    // =========================================================================
    #[test]
    fn test_back_office_has_no_value() {
        assert_eq!(OutboxTarget::BackOffice.value(), None);
        // A stray value on a back_office row is ignored rather than fatal
        let decoded = OutboxTarget::from_columns("back_office", Some("stale")).unwrap();
        assert_eq!(decoded, OutboxTarget::BackOffice);
    }
}
