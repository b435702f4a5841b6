//! Outbox dispatcher
//!
//! Background poll loop that drains due outbox rows and hands them to a
//! pluggable [`Publisher`]. Delivery is best-effort: publish failures and
//! timeouts are converted into the persisted backoff schedule, never into a
//! crashed loop. Multiple dispatcher instances may run concurrently; a row
//! claimed by one instance leaves the due window via its own status update,
//! and the rare double-dispatch is an accepted cost.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::DispatcherConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::outbox::{OutboxMessage, OutboxStatus, OutboxStore, OutboxTarget};

/// Backoff exponent cap: delay tops out at 64x the base
const BACKOFF_EXP_CAP: u32 = 6;

/// Downstream delivery channels. Implementations live outside the core
/// (real-time broadcast, HTTP fan-out); all calls are fire-and-forget from
/// the dispatcher's perspective.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_back_office(
        &self,
        event_type: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> PipelineResult<()>;

    async fn publish_role(
        &self,
        role: &str,
        event_type: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> PipelineResult<()>;

    async fn publish_user(
        &self,
        user_id: Uuid,
        event_type: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> PipelineResult<()>;
}

/// `base * 2^min(attempt-1, 6)` — exponential backoff capped at 64x base
pub fn retry_delay_seconds(base_delay_seconds: i64, attempt_count: i32) -> i64 {
    let exponent = (attempt_count.max(1) as u32 - 1).min(BACKOFF_EXP_CAP);
    base_delay_seconds.saturating_mul(1_i64 << exponent)
}

/// Route one message to the matching publisher channel. The target match is
/// exhaustive; a row with an unrecognized target kind is surfaced as a
/// validation error and takes the normal retry path.
pub async fn publish_message(
    publisher: &dyn Publisher,
    message: &OutboxMessage,
) -> PipelineResult<()> {
    let target = OutboxTarget::from_columns(&message.target, message.target_value.as_deref())?;
    match target {
        OutboxTarget::BackOffice => {
            publisher
                .publish_back_office(&message.event_type, &message.message, message.payload.as_ref())
                .await
        }
        OutboxTarget::Role(role) => {
            publisher
                .publish_role(&role, &message.event_type, &message.message, message.payload.as_ref())
                .await
        }
        OutboxTarget::User(user_id) => {
            publisher
                .publish_user(user_id, &message.event_type, &message.message, message.payload.as_ref())
                .await
        }
    }
}

/// Counts for one dispatcher tick
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub claimed: usize,
    pub delivered: usize,
    pub retried: usize,
    pub dead_lettered: usize,
}

/// Background loop draining the outbox
pub struct OutboxDispatcher {
    store: OutboxStore,
    publisher: Arc<dyn Publisher>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(pool: PgPool, publisher: Arc<dyn Publisher>, config: DispatcherConfig) -> Self {
        Self {
            store: OutboxStore::new(pool),
            publisher,
            config,
        }
    }

    /// Poll until the shutdown signal flips. Stops claiming new rows
    /// immediately on shutdown; the in-flight tick finishes first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = Duration::from_secs(self.config.poll_interval_seconds);
        tracing::info!(
            poll_interval_seconds = self.config.poll_interval_seconds,
            batch_size = self.config.batch_size,
            max_attempts = self.config.max_attempts,
            "Outbox dispatcher started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(summary) if summary.claimed > 0 => {
                    tracing::info!(
                        claimed = summary.claimed,
                        delivered = summary.delivered,
                        retried = summary.retried,
                        dead_lettered = summary.dead_lettered,
                        "Outbox tick complete"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(error = %e, "Outbox tick failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Outbox dispatcher stopped");
    }

    /// One poll cycle: claim the due batch FIFO, process each row serially.
    pub async fn tick(&self) -> PipelineResult<TickSummary> {
        let due = self.store.claim_due(self.config.batch_size).await?;
        let mut summary = TickSummary {
            claimed: due.len(),
            ..TickSummary::default()
        };

        for message in due {
            match self.dispatch_one(&message).await {
                Ok(()) => summary.delivered += 1,
                Err(OutboxStatus::Failed) => summary.dead_lettered += 1,
                Err(_) => summary.retried += 1,
            }
        }

        Ok(summary)
    }

    /// Process a single row: durable attempt increment, bounded publish,
    /// terminal update. Returns the resulting status on failure.
    async fn dispatch_one(&self, message: &OutboxMessage) -> Result<(), OutboxStatus> {
        let attempt = match self.store.mark_attempt_started(message.id).await {
            Ok(attempt) => attempt,
            Err(e) => {
                tracing::error!(outbox_id = %message.id, error = %e, "Failed to claim outbox row");
                return Err(OutboxStatus::Pending);
            }
        };

        let timeout = Duration::from_secs(self.config.publish_timeout_seconds);
        let outcome = match tokio::time::timeout(
            timeout,
            publish_message(self.publisher.as_ref(), message),
        )
        .await
        {
            Ok(result) => result,
            // Cancellation counts as a transient failure, same backoff path
            Err(_) => Err(PipelineError::Publish(format!(
                "publish timed out after {}s",
                self.config.publish_timeout_seconds
            ))),
        };

        match outcome {
            Ok(()) => {
                if let Err(e) = self.store.mark_processed(message.id).await {
                    tracing::error!(outbox_id = %message.id, error = %e, "Failed to mark outbox row processed");
                    return Err(OutboxStatus::Processing);
                }
                tracing::debug!(
                    outbox_id = %message.id,
                    event_type = %message.event_type,
                    target = %message.target,
                    "Outbox message delivered"
                );
                Ok(())
            }
            Err(publish_err) => {
                let delay = retry_delay_seconds(self.config.base_delay_seconds, attempt);
                let status = self
                    .store
                    .mark_attempt_failed(
                        message.id,
                        &publish_err.to_string(),
                        delay,
                        self.config.max_attempts,
                    )
                    .await
                    .unwrap_or(OutboxStatus::Pending);

                if status == OutboxStatus::Failed {
                    tracing::error!(
                        outbox_id = %message.id,
                        event_type = %message.event_type,
                        attempt = attempt,
                        error = %publish_err,
                        "Outbox message dead-lettered after exhausting retries"
                    );
                } else {
                    tracing::warn!(
                        outbox_id = %message.id,
                        event_type = %message.event_type,
                        attempt = attempt,
                        retry_in_seconds = delay,
                        error = %publish_err,
                        "Outbox publish failed, scheduled for retry"
                    );
                }
                Err(status)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use time::OffsetDateTime;

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        assert_eq!(retry_delay_seconds(5, 1), 5);
        assert_eq!(retry_delay_seconds(5, 2), 10);
        assert_eq!(retry_delay_seconds(5, 3), 20);
        assert_eq!(retry_delay_seconds(5, 7), 320);
        // Capped at 64x base from attempt 7 on
        assert_eq!(retry_delay_seconds(5, 8), 320);
        assert_eq!(retry_delay_seconds(5, 100), 320);
    }

    #[test]
    fn backoff_is_monotonic_before_the_cap() {
        let mut previous = 0;
        for attempt in 1..=7 {
            let delay = retry_delay_seconds(3, attempt);
            assert!(delay > previous, "delay must strictly increase");
            previous = delay;
        }
    }

    #[test]
    fn backoff_tolerates_zero_attempt_count() {
        assert_eq!(retry_delay_seconds(5, 0), 5);
    }

    struct RecordingPublisher {
        back_office: AtomicU32,
        role: AtomicU32,
        user: AtomicU32,
        fail: bool,
    }

    impl RecordingPublisher {
        fn new(fail: bool) -> Self {
            Self {
                back_office: AtomicU32::new(0),
                role: AtomicU32::new(0),
                user: AtomicU32::new(0),
                fail,
            }
        }

        fn result(&self) -> PipelineResult<()> {
            if self.fail {
                Err(PipelineError::Publish("channel unavailable".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl Publisher for RecordingPublisher {
        async fn publish_back_office(
            &self,
            _event_type: &str,
            _message: &str,
            _payload: Option<&serde_json::Value>,
        ) -> PipelineResult<()> {
            self.back_office.fetch_add(1, Ordering::SeqCst);
            self.result()
        }

        async fn publish_role(
            &self,
            _role: &str,
            _event_type: &str,
            _message: &str,
            _payload: Option<&serde_json::Value>,
        ) -> PipelineResult<()> {
            self.role.fetch_add(1, Ordering::SeqCst);
            self.result()
        }

        async fn publish_user(
            &self,
            _user_id: Uuid,
            _event_type: &str,
            _message: &str,
            _payload: Option<&serde_json::Value>,
        ) -> PipelineResult<()> {
            self.user.fetch_add(1, Ordering::SeqCst);
            self.result()
        }
    }

    fn message_for(target: &str, target_value: Option<String>) -> OutboxMessage {
        let now = OffsetDateTime::now_utc();
        OutboxMessage {
            id: Uuid::new_v4(),
            target: target.to_string(),
            target_value,
            event_type: "payment.succeeded".to_string(),
            message: "Payment received".to_string(),
            payload: None,
            status: "pending".to_string(),
            attempt_count: 0,
            last_error: None,
            next_attempt_utc: now,
            last_attempt_utc: None,
            processed_utc: None,
            created_utc: now,
            updated_utc: now,
        }
    }

    #[tokio::test]
    async fn publish_routes_back_office_messages() {
        let publisher = RecordingPublisher::new(false);
        let message = message_for("back_office", None);

        publish_message(&publisher, &message).await.unwrap();

        assert_eq!(publisher.back_office.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.role.load(Ordering::SeqCst), 0);
        assert_eq!(publisher.user.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publish_routes_role_and_user_messages() {
        let publisher = RecordingPublisher::new(false);

        let role_msg = message_for("role", Some("treasurer".to_string()));
        publish_message(&publisher, &role_msg).await.unwrap();

        let user_msg = message_for("user", Some(Uuid::new_v4().to_string()));
        publish_message(&publisher, &user_msg).await.unwrap();

        assert_eq!(publisher.role.load(Ordering::SeqCst), 1);
        assert_eq!(publisher.user.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn publish_fails_loudly_on_corrupt_target() {
        let publisher = RecordingPublisher::new(false);
        let message = message_for("carrier_pigeon", None);

        let result = publish_message(&publisher, &message).await;

        assert!(matches!(result, Err(PipelineError::Validation(_))));
        assert_eq!(publisher.back_office.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn publisher_errors_propagate_for_the_backoff_path() {
        let publisher = RecordingPublisher::new(true);
        let message = message_for("back_office", None);

        let result = publish_message(&publisher, &message).await;

        assert!(matches!(result, Err(PipelineError::Publish(_))));
    }
}
