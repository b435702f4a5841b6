//! Webhook handler
//!
//! Orchestrates one inbound gateway call end to end:
//! verify signature → claim a receipt → apply the domain effect and enqueue
//! outbox events in one transaction → settle the receipt → commit.
//!
//! Failure boundaries, in order:
//! - empty/malformed body and bad signatures are caller errors, never
//!   persisted;
//! - unrecognized event types and unmatched references are acknowledged
//!   (the gateway retrying them would change nothing);
//! - anything that breaks between claim and commit rolls the transaction
//!   back, marks the receipt `failed` in a separate statement, and surfaces
//!   a retryable error so the gateway's own retry cadence re-delivers.

use sqlx::PgPool;

use crate::config::WebhookConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::events;
use crate::membership::{self, FailedOutcome, PaidOutcome, PaymentRecord};
use crate::outbox;
use crate::paymongo::{self, EventKind, ParsedEvent, PROVIDER_PAYMONGO};
use crate::receipts::{self, ReceiptLedger, ReceiptStatus, WebhookReceipt};
use crate::signature::verify_signature;

/// How an acknowledged (HTTP 200) webhook call was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookAck {
    /// Domain effect applied (or settled as a recorded no-op)
    Handled,
    /// Duplicate or concurrent delivery, short-circuited by the ledger
    Duplicate,
    /// Well-formed but unroutable: no local payment matches the reference
    Ignored,
    /// Event type outside the recognized set; acknowledged without action
    Unrecognized,
}

/// Orchestrator for inbound PayMongo webhook calls
#[derive(Clone)]
pub struct WebhookHandler {
    pool: PgPool,
    ledger: ReceiptLedger,
    config: WebhookConfig,
}

impl WebhookHandler {
    pub fn new(pool: PgPool, config: WebhookConfig) -> Self {
        let ledger = ReceiptLedger::new(pool.clone(), config.receipt_liveness_seconds);
        Self {
            pool,
            ledger,
            config,
        }
    }

    pub fn ledger(&self) -> &ReceiptLedger {
        &self.ledger
    }

    /// Handle one inbound call. `Ok` variants all acknowledge with 200;
    /// errors map to 400 (body), 401 (signature), or 500 (retryable).
    pub async fn handle(
        &self,
        raw_body: &[u8],
        signature_header: Option<&str>,
    ) -> PipelineResult<WebhookAck> {
        if raw_body.is_empty() {
            return Err(PipelineError::EmptyBody);
        }

        if let Err(rejection) = verify_signature(raw_body, signature_header, &self.config) {
            tracing::warn!(reason = %rejection, "Rejected webhook with invalid signature");
            return Err(PipelineError::SignatureInvalid(rejection.to_string()));
        }

        let event = paymongo::parse_event(raw_body)?;
        let Some(kind) = event.kind else {
            tracing::info!(
                event_type = %event.event_type,
                "Received unhandled PayMongo event type - acknowledged without action"
            );
            return Ok(WebhookAck::Unrecognized);
        };

        let event_key = event.event_key();
        let receipt = match self
            .ledger
            .begin_processing(
                PROVIDER_PAYMONGO,
                &event_key,
                Some(&event.event_type),
                event.resource_id.as_deref(),
            )
            .await?
        {
            Some(receipt) => receipt,
            None => return Ok(WebhookAck::Duplicate),
        };

        tracing::info!(
            event_type = %event.event_type,
            event_key = %event_key,
            attempt = receipt.attempt_count,
            "Processing PayMongo webhook event (claimed exclusive processing rights)"
        );

        match self.process_claimed(&receipt, &event, kind).await {
            Ok(ack) => Ok(ack),
            Err(e) => {
                // The transaction is already rolled back; record the failure
                // on a freshly addressed row so the next delivery retries.
                if let Err(mark_err) = self
                    .ledger
                    .mark_failed_fresh(PROVIDER_PAYMONGO, &event_key, &e.to_string())
                    .await
                {
                    tracing::error!(
                        event_key = %event_key,
                        error = %mark_err,
                        "Failed to record webhook failure on the receipt"
                    );
                }
                tracing::error!(
                    event_type = %event.event_type,
                    event_key = %event_key,
                    error = %e,
                    "Webhook processing failed, gateway will retry"
                );
                Err(PipelineError::Processing(e.to_string()))
            }
        }
    }

    /// Steps 6-9 of the state machine: one transaction covering lifecycle
    /// maintenance, the domain effect, outbox inserts, and receipt
    /// completion.
    async fn process_claimed(
        &self,
        receipt: &WebhookReceipt,
        event: &ParsedEvent,
        kind: EventKind,
    ) -> PipelineResult<WebhookAck> {
        let mut tx = self.pool.begin().await?;

        membership::expire_stale(&mut tx).await?;

        let payment = match event.resource_id.as_deref() {
            Some(session_id) => membership::find_payment_by_session(&mut tx, session_id).await?,
            None => None,
        };

        let Some(payment) = payment else {
            // Unmatched webhook is not a caller error: settle as ignored
            receipts::complete_on(
                &mut tx,
                receipt.id,
                ReceiptStatus::Ignored,
                Some("no local payment matches the referenced checkout session"),
            )
            .await?;
            tx.commit().await?;
            tracing::info!(
                event_key = %receipt.event_key,
                reference = event.resource_id.as_deref().unwrap_or("-"),
                "Webhook references no local payment, recorded as ignored"
            );
            return Ok(WebhookAck::Ignored);
        };

        match kind {
            EventKind::Paid => {
                self.reconcile_paid(&mut tx, &payment, event).await?;
            }
            EventKind::Failed => {
                self.reconcile_failed(&mut tx, &payment).await?;
            }
        }

        receipts::complete_on(&mut tx, receipt.id, ReceiptStatus::Processed, None).await?;
        tx.commit().await?;

        Ok(WebhookAck::Handled)
    }

    async fn reconcile_paid(
        &self,
        tx: &mut sqlx::PgConnection,
        payment: &PaymentRecord,
        event: &ParsedEvent,
    ) -> PipelineResult<()> {
        match membership::apply_paid(tx, payment, event).await? {
            PaidOutcome::AlreadySettled => {
                // Duplicate by business content: no state change, no events
                tracing::info!(
                    payment_id = %payment.id,
                    "Payment already succeeded for this gateway reference, no-op"
                );
            }
            PaidOutcome::Activated {
                member_id,
                plan_code,
                expires_utc,
            } => {
                let succeeded = events::payment_succeeded_payload(
                    payment.id,
                    payment.invoice_id,
                    member_id,
                    payment.amount_centavos,
                );
                outbox::enqueue_back_office(
                    tx,
                    events::PAYMENT_SUCCEEDED,
                    "Payment received",
                    Some(succeeded.clone()),
                )
                .await?;
                outbox::enqueue_user(
                    tx,
                    member_id,
                    events::PAYMENT_SUCCEEDED,
                    "Your payment was received",
                    Some(succeeded),
                )
                .await?;
                outbox::enqueue_user(
                    tx,
                    member_id,
                    events::MEMBERSHIP_ACTIVATED,
                    &format!("Your {} membership is active", plan_code),
                    Some(events::membership_activated_payload(
                        member_id, &plan_code, expires_utc,
                    )),
                )
                .await?;

                tracing::info!(
                    payment_id = %payment.id,
                    member_id = %member_id,
                    plan_code = %plan_code,
                    "Payment succeeded and membership activated"
                );
            }
            PaidOutcome::Warning { member_id, reason } => {
                let succeeded = events::payment_succeeded_payload(
                    payment.id,
                    payment.invoice_id,
                    member_id,
                    payment.amount_centavos,
                );
                outbox::enqueue_back_office(
                    tx,
                    events::PAYMENT_SUCCEEDED,
                    "Payment received",
                    Some(succeeded.clone()),
                )
                .await?;
                outbox::enqueue_user(
                    tx,
                    member_id,
                    events::PAYMENT_SUCCEEDED,
                    "Your payment was received",
                    Some(succeeded),
                )
                .await?;
                outbox::enqueue_back_office(
                    tx,
                    events::RECONCILIATION_WARNING,
                    "Payment settled but activation needs manual review",
                    Some(events::reconciliation_warning_payload(
                        payment.id, member_id, &reason,
                    )),
                )
                .await?;

                tracing::warn!(
                    payment_id = %payment.id,
                    member_id = %member_id,
                    reason = %reason,
                    "Payment settled with a reconciliation warning, activation skipped"
                );
            }
        }

        Ok(())
    }

    async fn reconcile_failed(
        &self,
        tx: &mut sqlx::PgConnection,
        payment: &PaymentRecord,
    ) -> PipelineResult<()> {
        match membership::apply_failed(tx, payment).await? {
            FailedOutcome::Ignored => {
                tracing::info!(
                    payment_id = %payment.id,
                    "Failure notification for an already-succeeded payment, ignored"
                );
            }
            FailedOutcome::Marked {
                member_id,
                invoice_overdue,
            } => {
                let payload = events::payment_failed_payload(
                    payment.id,
                    payment.invoice_id,
                    member_id,
                    invoice_overdue,
                );
                outbox::enqueue_back_office(
                    tx,
                    events::PAYMENT_FAILED,
                    "Payment failed",
                    Some(payload.clone()),
                )
                .await?;
                outbox::enqueue_user(
                    tx,
                    member_id,
                    events::PAYMENT_FAILED,
                    "Your payment did not go through",
                    Some(payload),
                )
                .await?;

                tracing::info!(
                    payment_id = %payment.id,
                    member_id = %member_id,
                    invoice_overdue = invoice_overdue,
                    "Payment marked failed"
                );
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ack_variants_all_mean_http_200() {
        // The API layer relies on every Ok variant acknowledging the call
        for ack in [
            WebhookAck::Handled,
            WebhookAck::Duplicate,
            WebhookAck::Ignored,
            WebhookAck::Unrecognized,
        ] {
            // An ack is never an error by construction; this pins the enum
            // so a new variant forces a review of the response mapping.
            match ack {
                WebhookAck::Handled
                | WebhookAck::Duplicate
                | WebhookAck::Ignored
                | WebhookAck::Unrecognized => {}
            }
        }
    }
}
