//! Membership reconciliation
//!
//! Payment/invoice/membership state transitions driven by the webhook
//! handler, all executed on the handler's ambient transaction. The paid path
//! is idempotent: reapplying a settled payment with the same gateway
//! reference is a no-op, and a late failure notification never regresses a
//! success.
//!
//! The activation metadata fallback chain and the amount tolerance are
//! PayMongo-integration policy, kept local to this module.

use regex::Regex;
use sqlx::PgConnection;
use std::sync::OnceLock;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::PipelineResult;
use crate::paymongo::ParsedEvent;

/// Accepted drift between the invoiced amount and what the gateway reports
pub const AMOUNT_TOLERANCE_CENTAVOS: i64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(PaymentStatus::Pending),
            "succeeded" => Some(PaymentStatus::Succeeded),
            "failed" => Some(PaymentStatus::Failed),
            "refunded" => Some(PaymentStatus::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PaymentRecord {
    pub id: Uuid,
    pub invoice_id: Uuid,
    pub status: String,
    pub amount_centavos: i64,
    pub checkout_session_id: Option<String>,
    pub gateway_reference: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct InvoiceRecord {
    id: Uuid,
    member_id: Uuid,
    membership_id: Option<Uuid>,
    due_utc: Option<OffsetDateTime>,
    notes: Option<String>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct PlanRecord {
    id: Uuid,
    code: String,
    duration_days: i32,
}

/// Result of applying a paid event
#[derive(Debug, Clone)]
pub enum PaidOutcome {
    /// Payment was already succeeded for this gateway reference; no-op
    AlreadySettled,
    /// Payment settled and the membership was activated/extended
    Activated {
        member_id: Uuid,
        plan_code: String,
        expires_utc: OffsetDateTime,
    },
    /// Payment settled but activation was skipped; a human should verify
    Warning { member_id: Uuid, reason: String },
}

/// Result of applying a failed/expired event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailedOutcome {
    /// Payment had already succeeded; failure notification ignored
    Ignored,
    /// Payment marked failed; invoice left unpaid or flipped overdue
    Marked { member_id: Uuid, invoice_overdue: bool },
}

/// True when the gateway-reported amount is close enough to the invoiced one
pub fn amount_within_tolerance(expected_centavos: i64, reported_centavos: i64) -> bool {
    (expected_centavos - reported_centavos).abs() <= AMOUNT_TOLERANCE_CENTAVOS
}

/// Last-resort plan resolution: a `plan:<code>` token in free-text invoice
/// notes, written there by the back office when metadata was unavailable.
pub fn extract_plan_token(notes: &str) -> Option<String> {
    static PLAN_TOKEN: OnceLock<Regex> = OnceLock::new();
    let re = PLAN_TOKEN.get_or_init(|| {
        #[allow(clippy::unwrap_used)] // pattern is a compile-time constant
        Regex::new(r"plan:([a-z0-9][a-z0-9_-]*)").unwrap()
    });
    re.captures(notes).map(|c| c[1].to_string())
}

/// Locate the local payment aggregate by the gateway's checkout-session id
pub async fn find_payment_by_session(
    conn: &mut PgConnection,
    session_id: &str,
) -> PipelineResult<Option<PaymentRecord>> {
    let payment = sqlx::query_as(
        r#"
        SELECT id, invoice_id, status, amount_centavos, checkout_session_id, gateway_reference
        FROM payments
        WHERE checkout_session_id = $1
        ORDER BY created_utc DESC
        LIMIT 1
        "#,
    )
    .bind(session_id)
    .fetch_optional(conn)
    .await?;

    Ok(payment)
}

/// Lifecycle maintenance before reconciling, so the reconciliation sees
/// current state: unpaid invoices past due flip overdue, active memberships
/// past their end date flip expired.
pub async fn expire_stale(conn: &mut PgConnection) -> PipelineResult<()> {
    sqlx::query(
        r#"
        UPDATE invoices
        SET status = 'overdue', updated_utc = NOW()
        WHERE status = 'unpaid' AND due_utc IS NOT NULL AND due_utc < NOW()
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        UPDATE memberships
        SET status = 'expired', updated_utc = NOW()
        WHERE status = 'active' AND expires_utc IS NOT NULL AND expires_utc < NOW()
        "#,
    )
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn load_invoice(conn: &mut PgConnection, invoice_id: Uuid) -> PipelineResult<InvoiceRecord> {
    let invoice = sqlx::query_as(
        "SELECT id, member_id, membership_id, due_utc, notes FROM invoices WHERE id = $1",
    )
    .bind(invoice_id)
    .fetch_one(conn)
    .await?;

    Ok(invoice)
}

async fn find_plan_by_code(
    conn: &mut PgConnection,
    code: &str,
) -> PipelineResult<Option<PlanRecord>> {
    let plan = sqlx::query_as("SELECT id, code, duration_days FROM plans WHERE code = $1")
        .bind(code)
        .fetch_optional(conn)
        .await?;

    Ok(plan)
}

async fn find_plan_of_membership(
    conn: &mut PgConnection,
    membership_id: Uuid,
) -> PipelineResult<Option<PlanRecord>> {
    let plan = sqlx::query_as(
        r#"
        SELECT p.id, p.code, p.duration_days
        FROM memberships m
        JOIN plans p ON p.id = m.plan_id
        WHERE m.id = $1
        "#,
    )
    .bind(membership_id)
    .fetch_optional(conn)
    .await?;

    Ok(plan)
}

/// Metadata plan code, then the invoice's linked membership, then the
/// `plan:<code>` token in invoice notes.
async fn resolve_plan(
    conn: &mut PgConnection,
    event: &ParsedEvent,
    invoice: &InvoiceRecord,
) -> PipelineResult<Option<PlanRecord>> {
    if let Some(code) = &event.plan_code {
        if let Some(plan) = find_plan_by_code(conn, code).await? {
            return Ok(Some(plan));
        }
        tracing::warn!(plan_code = %code, "Webhook metadata names an unknown plan code");
    }

    if let Some(membership_id) = invoice.membership_id {
        if let Some(plan) = find_plan_of_membership(conn, membership_id).await? {
            return Ok(Some(plan));
        }
    }

    if let Some(notes) = &invoice.notes {
        if let Some(code) = extract_plan_token(notes) {
            if let Some(plan) = find_plan_by_code(conn, &code).await? {
                return Ok(Some(plan));
            }
            tracing::warn!(plan_code = %code, "Invoice notes token names an unknown plan code");
        }
    }

    Ok(None)
}

/// Activate or extend the membership tied to the invoice. Extension starts
/// from the current expiry when it is still in the future, otherwise from
/// now.
async fn activate_membership(
    conn: &mut PgConnection,
    invoice: &InvoiceRecord,
    plan: &PlanRecord,
) -> PipelineResult<OffsetDateTime> {
    if let Some(membership_id) = invoice.membership_id {
        let row: (OffsetDateTime,) = sqlx::query_as(
            r#"
            UPDATE memberships
            SET status = 'active',
                plan_id = $2,
                starts_utc = COALESCE(starts_utc, NOW()),
                expires_utc = GREATEST(COALESCE(expires_utc, NOW()), NOW())
                              + make_interval(days => $3),
                updated_utc = NOW()
            WHERE id = $1
            RETURNING expires_utc
            "#,
        )
        .bind(membership_id)
        .bind(plan.id)
        .bind(plan.duration_days)
        .fetch_one(&mut *conn)
        .await?;

        return Ok(row.0);
    }

    let row: (Uuid, OffsetDateTime) = sqlx::query_as(
        r#"
        INSERT INTO memberships (member_id, plan_id, status, starts_utc, expires_utc)
        VALUES ($1, $2, 'active', NOW(), NOW() + make_interval(days => $3))
        RETURNING id, expires_utc
        "#,
    )
    .bind(invoice.member_id)
    .bind(plan.id)
    .bind(plan.duration_days)
    .fetch_one(&mut *conn)
    .await?;

    sqlx::query("UPDATE invoices SET membership_id = $2, updated_utc = NOW() WHERE id = $1")
        .bind(invoice.id)
        .bind(row.0)
        .execute(conn)
        .await?;

    Ok(row.1)
}

/// Apply a paid event idempotently within the caller's transaction.
pub async fn apply_paid(
    conn: &mut PgConnection,
    payment: &PaymentRecord,
    event: &ParsedEvent,
) -> PipelineResult<PaidOutcome> {
    let already_succeeded = PaymentStatus::parse(&payment.status) == Some(PaymentStatus::Succeeded);
    let same_reference = match (&payment.gateway_reference, &event.payment_id) {
        (Some(existing), Some(incoming)) => existing == incoming,
        // Without a reference on either side there is nothing to distinguish
        // this delivery from the one that settled the payment
        _ => true,
    };
    if already_succeeded && same_reference {
        return Ok(PaidOutcome::AlreadySettled);
    }

    sqlx::query(
        r#"
        UPDATE payments
        SET status = 'succeeded',
            gateway_reference = COALESCE($2, gateway_reference),
            updated_utc = NOW()
        WHERE id = $1
        "#,
    )
    .bind(payment.id)
    .bind(event.payment_id.as_deref())
    .execute(&mut *conn)
    .await?;

    sqlx::query("UPDATE invoices SET status = 'paid', updated_utc = NOW() WHERE id = $1")
        .bind(payment.invoice_id)
        .execute(&mut *conn)
        .await?;

    let invoice = load_invoice(conn, payment.invoice_id).await?;

    if let Some(reported) = event.amount_centavos {
        if !amount_within_tolerance(payment.amount_centavos, reported) {
            return Ok(PaidOutcome::Warning {
                member_id: invoice.member_id,
                reason: format!(
                    "amount mismatch: invoiced {} centavos, gateway reported {}",
                    payment.amount_centavos, reported
                ),
            });
        }
    }

    let plan = match resolve_plan(conn, event, &invoice).await? {
        Some(plan) => plan,
        None => {
            return Ok(PaidOutcome::Warning {
                member_id: invoice.member_id,
                reason: "activation metadata incomplete: no plan resolvable from metadata, \
                         membership link, or invoice notes"
                    .to_string(),
            });
        }
    };

    let expires_utc = activate_membership(conn, &invoice, &plan).await?;

    Ok(PaidOutcome::Activated {
        member_id: invoice.member_id,
        plan_code: plan.code,
        expires_utc,
    })
}

/// Apply a failed/expired event within the caller's transaction.
pub async fn apply_failed(
    conn: &mut PgConnection,
    payment: &PaymentRecord,
) -> PipelineResult<FailedOutcome> {
    // A failure notification arriving after a success must never regress state
    if PaymentStatus::parse(&payment.status) == Some(PaymentStatus::Succeeded) {
        return Ok(FailedOutcome::Ignored);
    }

    sqlx::query("UPDATE payments SET status = 'failed', updated_utc = NOW() WHERE id = $1")
        .bind(payment.id)
        .execute(&mut *conn)
        .await?;

    let invoice = load_invoice(conn, payment.invoice_id).await?;
    let overdue = invoice
        .due_utc
        .map(|due| due < OffsetDateTime::now_utc())
        .unwrap_or(false);

    sqlx::query(
        r#"
        UPDATE invoices
        SET status = CASE WHEN $2 THEN 'overdue' ELSE 'unpaid' END,
            updated_utc = NOW()
        WHERE id = $1 AND status != 'paid'
        "#,
    )
    .bind(payment.invoice_id)
    .bind(overdue)
    .execute(conn)
    .await?;

    Ok(FailedOutcome::Marked {
        member_id: invoice.member_id,
        invoice_overdue: overdue,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amounts_within_half_peso_match() {
        assert!(amount_within_tolerance(99900, 99900));
        assert!(amount_within_tolerance(99900, 99850));
        assert!(amount_within_tolerance(99900, 99950));
    }

    #[test]
    fn amounts_past_tolerance_mismatch() {
        assert!(!amount_within_tolerance(99900, 99849));
        assert!(!amount_within_tolerance(99900, 99951));
        assert!(!amount_within_tolerance(99900, 0));
    }

    #[test]
    fn tolerance_boundary_is_inclusive() {
        assert!(amount_within_tolerance(1000, 1000 + AMOUNT_TOLERANCE_CENTAVOS));
        assert!(amount_within_tolerance(1000, 1000 - AMOUNT_TOLERANCE_CENTAVOS));
        assert!(!amount_within_tolerance(1000, 1000 + AMOUNT_TOLERANCE_CENTAVOS + 1));
    }

    #[test]
    fn plan_token_extracted_from_notes() {
        assert_eq!(
            extract_plan_token("renewal, see plan:annual-2026 for details"),
            Some("annual-2026".to_string())
        );
        assert_eq!(extract_plan_token("plan:monthly"), Some("monthly".to_string()));
    }

    #[test]
    fn notes_without_token_yield_none() {
        assert_eq!(extract_plan_token("paid in cash at front desk"), None);
        assert_eq!(extract_plan_token(""), None);
        // Token must start with an alphanumeric
        assert_eq!(extract_plan_token("plan:-broken"), None);
    }

    #[test]
    fn payment_status_round_trips() {
        for status in [
            PaymentStatus::Pending,
            PaymentStatus::Succeeded,
            PaymentStatus::Failed,
            PaymentStatus::Refunded,
        ] {
            assert_eq!(PaymentStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(PaymentStatus::parse("charged_back"), None);
    }
}
