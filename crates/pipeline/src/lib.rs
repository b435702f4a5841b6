#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Payment webhook pipeline for membership billing.
//!
//! Receives PayMongo webhooks, verifies their signatures, deduplicates
//! deliveries through a durable receipt ledger, applies the paid/failed
//! effect to payments, invoices, and memberships exactly once, and fans
//! out notifications through a transactional outbox that a background
//! dispatcher drains with bounded retries.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handler;
pub mod membership;
pub mod ops;
pub mod outbox;
pub mod paymongo;
pub mod receipts;
pub mod signature;

#[cfg(test)]
mod edge_case_tests;

pub use config::{DispatcherConfig, WebhookConfig};
pub use dispatcher::{OutboxDispatcher, Publisher, TickSummary};
pub use error::{PipelineError, PipelineResult};
pub use handler::{WebhookAck, WebhookHandler};
pub use ops::{OpsService, ReplayOutcome};
pub use outbox::{OutboxMessage, OutboxStatus, OutboxStore, OutboxTarget};
pub use receipts::{ReceiptLedger, ReceiptStatus, WebhookReceipt};

use sqlx::PgPool;

/// Bundle of the pipeline's services over one connection pool.
///
/// The api binary holds this in its shared state; the worker builds the
/// dispatcher separately because the publisher is its own concern.
#[derive(Clone)]
pub struct PipelineService {
    handler: WebhookHandler,
    ops: OpsService,
    outbox: OutboxStore,
}

impl PipelineService {
    pub fn new(pool: PgPool, config: WebhookConfig) -> Self {
        let ops = OpsService::new(pool.clone(), config.receipt_liveness_seconds);
        let handler = WebhookHandler::new(pool.clone(), config);
        let outbox = OutboxStore::new(pool);
        Self {
            handler,
            ops,
            outbox,
        }
    }

    pub fn from_env(pool: PgPool) -> PipelineResult<Self> {
        Ok(Self::new(pool, WebhookConfig::from_env()?))
    }

    pub fn handler(&self) -> &WebhookHandler {
        &self.handler
    }

    pub fn ledger(&self) -> &ReceiptLedger {
        self.handler.ledger()
    }

    pub fn ops(&self) -> &OpsService {
        &self.ops
    }

    pub fn outbox(&self) -> &OutboxStore {
        &self.outbox
    }
}
