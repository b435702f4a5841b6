//! Internal event vocabulary
//!
//! Event types and payload builders for everything the pipeline enqueues.
//! Payloads are plain JSON snapshots for downstream display and audit, not
//! a contract the core depends on.

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

pub const PAYMENT_SUCCEEDED: &str = "payment.succeeded";
pub const PAYMENT_FAILED: &str = "payment.failed";
pub const MEMBERSHIP_ACTIVATED: &str = "membership.activated";
pub const RECONCILIATION_WARNING: &str = "payment.reconciliation_warning";

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}

pub fn payment_succeeded_payload(
    payment_id: Uuid,
    invoice_id: Uuid,
    member_id: Uuid,
    amount_centavos: i64,
) -> serde_json::Value {
    serde_json::json!({
        "payment_id": payment_id,
        "invoice_id": invoice_id,
        "member_id": member_id,
        "amount_centavos": amount_centavos,
    })
}

pub fn payment_failed_payload(
    payment_id: Uuid,
    invoice_id: Uuid,
    member_id: Uuid,
    invoice_overdue: bool,
) -> serde_json::Value {
    serde_json::json!({
        "payment_id": payment_id,
        "invoice_id": invoice_id,
        "member_id": member_id,
        "invoice_overdue": invoice_overdue,
    })
}

pub fn membership_activated_payload(
    member_id: Uuid,
    plan_code: &str,
    expires_utc: OffsetDateTime,
) -> serde_json::Value {
    serde_json::json!({
        "member_id": member_id,
        "plan_code": plan_code,
        "expires_utc": rfc3339(expires_utc),
    })
}

pub fn reconciliation_warning_payload(
    payment_id: Uuid,
    member_id: Uuid,
    reason: &str,
) -> serde_json::Value {
    serde_json::json!({
        "payment_id": payment_id,
        "member_id": member_id,
        "reason": reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_payload_carries_rfc3339_expiry() {
        let expires = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let payload = membership_activated_payload(Uuid::new_v4(), "monthly", expires);

        let expiry = payload["expires_utc"].as_str().unwrap();
        assert!(expiry.starts_with("2023-11-14T"));
        assert_eq!(payload["plan_code"], "monthly");
    }
}
