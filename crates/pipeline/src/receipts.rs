//! Webhook receipt ledger
//!
//! Durable idempotency table keyed by `(provider, event_key)`. Every inbound
//! webhook delivery is claimed here before any domain effect runs, so the
//! at-least-once gateway can redeliver freely: settled events short-circuit,
//! failed or stuck ones become the retry path.
//!
//! Claiming uses a single `INSERT .. ON CONFLICT .. DO UPDATE .. WHERE ..
//! RETURNING` statement so two concurrent deliveries of the same event can
//! never both win.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::PipelineResult;

/// Bound on operator-visible notes / error text
pub const NOTES_MAX_LEN: usize = 500;

/// Lifecycle states of a webhook receipt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptStatus {
    Pending,
    Processing,
    Processed,
    Failed,
    Ignored,
}

impl ReceiptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReceiptStatus::Pending => "pending",
            ReceiptStatus::Processing => "processing",
            ReceiptStatus::Processed => "processed",
            ReceiptStatus::Failed => "failed",
            ReceiptStatus::Ignored => "ignored",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ReceiptStatus::Pending),
            "processing" => Some(ReceiptStatus::Processing),
            "processed" => Some(ReceiptStatus::Processed),
            "failed" => Some(ReceiptStatus::Failed),
            "ignored" => Some(ReceiptStatus::Ignored),
            _ => None,
        }
    }

    /// Terminal unless an operator explicitly replays
    pub fn is_settled(&self) -> bool {
        matches!(self, ReceiptStatus::Processed | ReceiptStatus::Ignored)
    }
}

/// One row per distinct inbound webhook event
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WebhookReceipt {
    pub id: Uuid,
    pub provider: String,
    pub event_key: String,
    pub event_type: Option<String>,
    pub external_reference: Option<String>,
    pub status: String,
    pub attempt_count: i32,
    pub notes: Option<String>,
    pub first_received_utc: OffsetDateTime,
    pub last_attempt_utc: OffsetDateTime,
    pub processed_utc: Option<OffsetDateTime>,
}

/// Truncate operator notes to the bounded column length
pub(crate) fn truncate_notes(notes: &str) -> String {
    if notes.len() <= NOTES_MAX_LEN {
        return notes.to_string();
    }
    // Cut on a char boundary
    let mut end = NOTES_MAX_LEN;
    while !notes.is_char_boundary(end) {
        end -= 1;
    }
    notes[..end].to_string()
}

/// Settle a receipt on an explicit connection, so the webhook handler can
/// fold completion into the same transaction as the domain mutation and the
/// outbox inserts.
pub async fn complete_on(
    conn: &mut sqlx::PgConnection,
    receipt_id: Uuid,
    status: ReceiptStatus,
    notes: Option<&str>,
) -> PipelineResult<()> {
    sqlx::query(
        r#"
        UPDATE webhook_receipts
        SET status = $2,
            notes = $3,
            last_attempt_utc = NOW(),
            processed_utc = CASE WHEN $2 IN ('processed', 'ignored')
                                 THEN NOW() ELSE processed_utc END
        WHERE id = $1
        "#,
    )
    .bind(receipt_id)
    .bind(status.as_str())
    .bind(notes.map(truncate_notes))
    .execute(conn)
    .await?;

    Ok(())
}

/// Service over the `webhook_receipts` table
#[derive(Clone)]
pub struct ReceiptLedger {
    pool: PgPool,
    liveness_seconds: i64,
}

impl ReceiptLedger {
    pub fn new(pool: PgPool, liveness_seconds: i64) -> Self {
        Self {
            pool,
            liveness_seconds,
        }
    }

    /// Claim exclusive processing rights for an inbound event.
    ///
    /// Returns `Some(receipt)` when this delivery should be handled:
    /// either a first sighting (fresh `processing` row, attempt 1) or the
    /// retry path (`failed`, or `processing` gone stale past the liveness
    /// window — attempt count incremented, notes cleared).
    ///
    /// Returns `None` for duplicates: the event is already settled
    /// (`processed`/`ignored`) or another delivery is live-`processing` it.
    pub async fn begin_processing(
        &self,
        provider: &str,
        event_key: &str,
        event_type: Option<&str>,
        external_reference: Option<&str>,
    ) -> PipelineResult<Option<WebhookReceipt>> {
        let claimed: Option<WebhookReceipt> = sqlx::query_as(
            r#"
            INSERT INTO webhook_receipts
                (provider, event_key, event_type, external_reference,
                 status, attempt_count, first_received_utc, last_attempt_utc)
            VALUES ($1, $2, $3, $4, 'processing', 1, NOW(), NOW())
            ON CONFLICT (provider, event_key) DO UPDATE SET
                status = 'processing',
                attempt_count = webhook_receipts.attempt_count + 1,
                event_type = COALESCE(EXCLUDED.event_type, webhook_receipts.event_type),
                external_reference = COALESCE(EXCLUDED.external_reference,
                                              webhook_receipts.external_reference),
                last_attempt_utc = NOW(),
                notes = NULL
            WHERE webhook_receipts.status = 'failed'
               OR (webhook_receipts.status = 'processing'
                   AND webhook_receipts.last_attempt_utc
                       < NOW() - make_interval(secs => $5))
            RETURNING *
            "#,
        )
        .bind(provider)
        .bind(event_key)
        .bind(event_type)
        .bind(external_reference)
        .bind(self.liveness_seconds as f64)
        .fetch_optional(&self.pool)
        .await?;

        if claimed.is_none() {
            tracing::info!(
                provider = provider,
                event_key = event_key,
                "Duplicate or in-flight webhook delivery, skipping"
            );
        }

        Ok(claimed)
    }

    /// Settle a claimed receipt. `processed`/`ignored` also stamp
    /// `processed_utc`; `failed` leaves the row eligible for re-claim.
    pub async fn complete_processing(
        &self,
        receipt_id: Uuid,
        status: ReceiptStatus,
        notes: Option<&str>,
    ) -> PipelineResult<()> {
        let mut conn = self.pool.acquire().await?;
        complete_on(&mut conn, receipt_id, status, notes).await
    }

    /// Failure path after a rolled-back handler transaction. Writes to the
    /// row by key in its own statement rather than reusing an entity loaded
    /// inside the aborted transaction.
    pub async fn mark_failed_fresh(
        &self,
        provider: &str,
        event_key: &str,
        error: &str,
    ) -> PipelineResult<()> {
        sqlx::query(
            r#"
            UPDATE webhook_receipts
            SET status = 'failed', notes = $3, last_attempt_utc = NOW()
            WHERE provider = $1 AND event_key = $2
            "#,
        )
        .bind(provider)
        .bind(event_key)
        .bind(truncate_notes(error))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn find_by_event_key(
        &self,
        provider: &str,
        event_key: &str,
    ) -> PipelineResult<Option<WebhookReceipt>> {
        let receipt = sqlx::query_as(
            "SELECT * FROM webhook_receipts WHERE provider = $1 AND event_key = $2",
        )
        .bind(provider)
        .bind(event_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(receipt)
    }

    /// Latest receipt for an external reference (e.g. a checkout-session id)
    pub async fn find_by_reference(
        &self,
        provider: &str,
        reference: &str,
    ) -> PipelineResult<Option<WebhookReceipt>> {
        let receipt = sqlx::query_as(
            r#"
            SELECT * FROM webhook_receipts
            WHERE provider = $1 AND external_reference = $2
            ORDER BY first_received_utc DESC
            LIMIT 1
            "#,
        )
        .bind(provider)
        .bind(reference)
        .fetch_optional(&self.pool)
        .await?;

        Ok(receipt)
    }

    /// Ops listing, newest first
    pub async fn list(
        &self,
        status: Option<ReceiptStatus>,
        reference: Option<&str>,
        limit: i64,
    ) -> PipelineResult<Vec<WebhookReceipt>> {
        let receipts = sqlx::query_as(
            r#"
            SELECT * FROM webhook_receipts
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::TEXT IS NULL OR external_reference = $2)
            ORDER BY first_received_utc DESC
            LIMIT $3
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(reference)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;

        Ok(receipts)
    }

    /// Create a receipt for a reference that never produced one, so manual
    /// replay can run through the normal completion path.
    pub async fn synthesize(
        &self,
        provider: &str,
        event_key: &str,
        event_type: Option<&str>,
        external_reference: Option<&str>,
    ) -> PipelineResult<WebhookReceipt> {
        let receipt = sqlx::query_as(
            r#"
            INSERT INTO webhook_receipts
                (provider, event_key, event_type, external_reference,
                 status, attempt_count, first_received_utc, last_attempt_utc)
            VALUES ($1, $2, $3, $4, 'processing', 1, NOW(), NOW())
            ON CONFLICT (provider, event_key) DO UPDATE SET
                status = 'processing',
                attempt_count = webhook_receipts.attempt_count + 1,
                last_attempt_utc = NOW(),
                notes = NULL
            RETURNING *
            "#,
        )
        .bind(provider)
        .bind(event_key)
        .bind(event_type)
        .bind(external_reference)
        .fetch_one(&self.pool)
        .await?;

        Ok(receipt)
    }
}
