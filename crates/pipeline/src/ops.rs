//! Replay and operations surface
//!
//! Administrative operations over the outbox and the receipt ledger:
//! listing, manual retry, dead-lettering, and replaying webhook events by
//! key or external reference. Replay re-derives the paid/failed
//! classification from the matched payment's current state rather than
//! trusting the original event type.

use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::events;
use crate::membership::{self, PaymentStatus};
use crate::outbox::{self, OutboxMessage, OutboxStatus, OutboxStore};
use crate::paymongo::PROVIDER_PAYMONGO;
use crate::receipts::{self, ReceiptLedger, ReceiptStatus, WebhookReceipt};

/// Bound on a single bulk-retry sweep
const BULK_RETRY_LIMIT: i64 = 100;

/// What a replay resolved to
#[derive(Debug, Clone)]
pub struct ReplayOutcome {
    pub receipt_id: Uuid,
    pub event_key: String,
    /// `paid`, `failed`, or `unmatched`, derived from current payment state
    pub classification: &'static str,
    pub events_enqueued: usize,
}

/// Admin-facing service; reuses the same ledger and outbox primitives as
/// the live pipeline.
#[derive(Clone)]
pub struct OpsService {
    pool: PgPool,
    ledger: ReceiptLedger,
    outbox: OutboxStore,
    receipt_liveness_seconds: i64,
}

impl OpsService {
    pub fn new(pool: PgPool, receipt_liveness_seconds: i64) -> Self {
        let ledger = ReceiptLedger::new(pool.clone(), receipt_liveness_seconds);
        let outbox = OutboxStore::new(pool.clone());
        Self {
            pool,
            ledger,
            outbox,
            receipt_liveness_seconds,
        }
    }

    // ---- outbox -----------------------------------------------------------

    pub async fn list_outbox(
        &self,
        status: Option<OutboxStatus>,
        limit: i64,
    ) -> PipelineResult<Vec<OutboxMessage>> {
        self.outbox.list(status, limit).await
    }

    pub async fn retry_outbox(&self, id: Uuid) -> PipelineResult<OutboxMessage> {
        let message = self.outbox.retry(id).await?;
        tracing::info!(outbox_id = %id, "Outbox message reset for retry");
        Ok(message)
    }

    pub async fn retry_failed_outbox(&self) -> PipelineResult<u64> {
        let reset = self.outbox.retry_failed(BULK_RETRY_LIMIT).await?;
        tracing::info!(reset = reset, "Bulk-retried failed outbox messages");
        Ok(reset)
    }

    pub async fn dead_letter_outbox(
        &self,
        id: Uuid,
        reason: &str,
    ) -> PipelineResult<OutboxMessage> {
        if reason.trim().is_empty() {
            return Err(PipelineError::Validation(
                "dead-letter reason must not be blank".to_string(),
            ));
        }
        let message = self.outbox.dead_letter(id, reason).await?;
        tracing::warn!(outbox_id = %id, reason = reason, "Outbox message dead-lettered by operator");
        Ok(message)
    }

    // ---- receipts ---------------------------------------------------------

    pub async fn list_receipts(
        &self,
        status: Option<ReceiptStatus>,
        reference: Option<&str>,
        limit: i64,
    ) -> PipelineResult<Vec<WebhookReceipt>> {
        self.ledger.list(status, reference, limit).await
    }

    /// Replay a webhook event by its key or by external reference.
    ///
    /// Settled receipts and receipts still live-`processing` are refused
    /// unless `force` is set. A reference with no receipt gets one
    /// synthesized so the replay flows through the normal completion path.
    pub async fn replay(
        &self,
        event_key: Option<&str>,
        reference: Option<&str>,
        force: bool,
    ) -> PipelineResult<ReplayOutcome> {
        let existing = match (event_key, reference) {
            (Some(key), _) => {
                let receipt = self
                    .ledger
                    .find_by_event_key(PROVIDER_PAYMONGO, key)
                    .await?
                    .ok_or_else(|| {
                        PipelineError::NotFound(format!("webhook receipt for event key {}", key))
                    })?;
                Some(receipt)
            }
            (None, Some(reference)) => {
                self.ledger
                    .find_by_reference(PROVIDER_PAYMONGO, reference)
                    .await?
            }
            (None, None) => {
                return Err(PipelineError::Validation(
                    "replay requires an event_key or a reference".to_string(),
                ));
            }
        };

        if let Some(receipt) = &existing {
            self.guard_replayable(receipt, force)?;
        }

        // Claim (or synthesize) the receipt: bumps attempt_count and puts
        // the row back into `processing` for this replay.
        let (key, event_type, reference) = match &existing {
            Some(receipt) => (
                receipt.event_key.clone(),
                receipt.event_type.clone(),
                receipt
                    .external_reference
                    .clone()
                    .or_else(|| reference.map(str::to_string)),
            ),
            None => {
                // Only reachable via reference lookup; key derived from it
                let reference = reference.unwrap_or_default().to_string();
                (
                    format!("replay:{}", reference),
                    None,
                    Some(reference),
                )
            }
        };
        let receipt = self
            .ledger
            .synthesize(
                PROVIDER_PAYMONGO,
                &key,
                event_type.as_deref(),
                reference.as_deref(),
            )
            .await?;

        tracing::info!(
            event_key = %receipt.event_key,
            attempt = receipt.attempt_count,
            force = force,
            "Replaying webhook event"
        );

        self.replay_claimed(&receipt).await
    }

    fn guard_replayable(&self, receipt: &WebhookReceipt, force: bool) -> PipelineResult<()> {
        if force {
            return Ok(());
        }

        if let Some(status) = ReceiptStatus::parse(&receipt.status) {
            if status.is_settled() {
                return Err(PipelineError::Conflict(format!(
                    "receipt {} is already {}; pass force to replay",
                    receipt.event_key, receipt.status
                )));
            }
            if status == ReceiptStatus::Processing {
                let age = OffsetDateTime::now_utc() - receipt.last_attempt_utc;
                if age.whole_seconds() < self.receipt_liveness_seconds {
                    return Err(PipelineError::Conflict(format!(
                        "receipt {} is being processed; pass force to replay",
                        receipt.event_key
                    )));
                }
            }
        }

        Ok(())
    }

    /// One transaction: classify from the payment's current state,
    /// re-enqueue the matching events, settle the receipt.
    async fn replay_claimed(&self, receipt: &WebhookReceipt) -> PipelineResult<ReplayOutcome> {
        let mut tx = self.pool.begin().await?;

        let payment = match receipt.external_reference.as_deref() {
            Some(reference) => membership::find_payment_by_session(&mut tx, reference).await?,
            None => None,
        };

        let Some(payment) = payment else {
            receipts::complete_on(
                &mut tx,
                receipt.id,
                ReceiptStatus::Ignored,
                Some("replay: no local payment matches the reference"),
            )
            .await?;
            tx.commit().await?;
            return Ok(ReplayOutcome {
                receipt_id: receipt.id,
                event_key: receipt.event_key.clone(),
                classification: "unmatched",
                events_enqueued: 0,
            });
        };

        let member_id: (Uuid,) =
            sqlx::query_as("SELECT member_id FROM invoices WHERE id = $1")
                .bind(payment.invoice_id)
                .fetch_one(&mut *tx)
                .await?;
        let member_id = member_id.0;

        let (classification, events_enqueued) =
            if PaymentStatus::parse(&payment.status) == Some(PaymentStatus::Succeeded) {
                let payload = events::payment_succeeded_payload(
                    payment.id,
                    payment.invoice_id,
                    member_id,
                    payment.amount_centavos,
                );
                outbox::enqueue_back_office(
                    &mut tx,
                    events::PAYMENT_SUCCEEDED,
                    "Payment received (replayed)",
                    Some(payload.clone()),
                )
                .await?;
                outbox::enqueue_user(
                    &mut tx,
                    member_id,
                    events::PAYMENT_SUCCEEDED,
                    "Your payment was received",
                    Some(payload),
                )
                .await?;
                ("paid", 2)
            } else {
                let payload = events::payment_failed_payload(
                    payment.id,
                    payment.invoice_id,
                    member_id,
                    false,
                );
                outbox::enqueue_back_office(
                    &mut tx,
                    events::PAYMENT_FAILED,
                    "Payment failed (replayed)",
                    Some(payload.clone()),
                )
                .await?;
                outbox::enqueue_user(
                    &mut tx,
                    member_id,
                    events::PAYMENT_FAILED,
                    "Your payment did not go through",
                    Some(payload),
                )
                .await?;
                ("failed", 2)
            };

        receipts::complete_on(&mut tx, receipt.id, ReceiptStatus::Processed, None).await?;
        tx.commit().await?;

        Ok(ReplayOutcome {
            receipt_id: receipt.id,
            event_key: receipt.event_key.clone(),
            classification,
            events_enqueued,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_retry_is_bounded() {
        assert!(BULK_RETRY_LIMIT <= 500);
        assert!(BULK_RETRY_LIMIT > 0);
    }
}
