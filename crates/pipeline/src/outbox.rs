//! Transactional outbox
//!
//! Internal events are inserted in the same database transaction as the
//! domain mutation that produced them, then delivered asynchronously by the
//! dispatcher. If the transaction rolls back, neither the mutation nor the
//! events exist; if it commits, both do.
//!
//! The enqueue operations therefore take `&mut PgConnection` and never
//! commit — the caller's transaction boundary decides atomicity.

use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::receipts::truncate_notes;

/// Delivery channel for an internal event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxTarget {
    /// Broadcast to the back-office dashboard
    BackOffice,
    /// Broadcast to everyone holding a role
    Role(String),
    /// Delivery to a single user
    User(Uuid),
}

impl OutboxTarget {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboxTarget::BackOffice => "back_office",
            OutboxTarget::Role(_) => "role",
            OutboxTarget::User(_) => "user",
        }
    }

    pub fn value(&self) -> Option<String> {
        match self {
            OutboxTarget::BackOffice => None,
            OutboxTarget::Role(role) => Some(role.clone()),
            OutboxTarget::User(user_id) => Some(user_id.to_string()),
        }
    }

    /// Rebuild the variant from its stored columns. An unrecognized target
    /// kind is a data corruption, not a routing decision, so it fails loudly.
    pub fn from_columns(kind: &str, value: Option<&str>) -> PipelineResult<Self> {
        match kind {
            "back_office" => Ok(OutboxTarget::BackOffice),
            "role" => {
                let role = value.filter(|v| !v.trim().is_empty()).ok_or_else(|| {
                    PipelineError::Validation("role target without a role name".to_string())
                })?;
                Ok(OutboxTarget::Role(role.to_string()))
            }
            "user" => {
                let raw = value.ok_or_else(|| {
                    PipelineError::Validation("user target without a user id".to_string())
                })?;
                let user_id = Uuid::parse_str(raw).map_err(|_| {
                    PipelineError::Validation(format!("user target has invalid uuid: {}", raw))
                })?;
                Ok(OutboxTarget::User(user_id))
            }
            other => Err(PipelineError::Validation(format!(
                "unrecognized outbox target kind: {}",
                other
            ))),
        }
    }
}

/// Lifecycle states of an outbox message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Processing => "processing",
            OutboxStatus::Processed => "processed",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(OutboxStatus::Pending),
            "processing" => Some(OutboxStatus::Processing),
            "processed" => Some(OutboxStatus::Processed),
            "failed" => Some(OutboxStatus::Failed),
            _ => None,
        }
    }
}

/// One row per internal event to deliver
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxMessage {
    pub id: Uuid,
    pub target: String,
    pub target_value: Option<String>,
    pub event_type: String,
    pub message: String,
    pub payload: Option<serde_json::Value>,
    pub status: String,
    pub attempt_count: i32,
    pub last_error: Option<String>,
    pub next_attempt_utc: OffsetDateTime,
    pub last_attempt_utc: Option<OffsetDateTime>,
    pub processed_utc: Option<OffsetDateTime>,
    pub created_utc: OffsetDateTime,
    pub updated_utc: OffsetDateTime,
}

fn validate_event_fields(event_type: &str, message: &str) -> PipelineResult<()> {
    if event_type.trim().is_empty() {
        return Err(PipelineError::Validation(
            "outbox event_type must not be blank".to_string(),
        ));
    }
    if message.trim().is_empty() {
        return Err(PipelineError::Validation(
            "outbox message must not be blank".to_string(),
        ));
    }
    Ok(())
}

/// Enqueue one event inside the caller's ambient transaction.
///
/// Inserts a `pending` row due immediately. Does not commit.
pub async fn enqueue(
    conn: &mut PgConnection,
    target: OutboxTarget,
    event_type: &str,
    message: &str,
    payload: Option<serde_json::Value>,
) -> PipelineResult<Uuid> {
    validate_event_fields(event_type, message)?;
    if let OutboxTarget::Role(role) = &target {
        if role.trim().is_empty() {
            return Err(PipelineError::Validation(
                "role target requires a role name".to_string(),
            ));
        }
    }

    let id: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO outbox_messages
            (target, target_value, event_type, message, payload,
             status, attempt_count, next_attempt_utc, created_utc, updated_utc)
        VALUES ($1, $2, $3, $4, $5, 'pending', 0, NOW(), NOW(), NOW())
        RETURNING id
        "#,
    )
    .bind(target.kind())
    .bind(target.value())
    .bind(event_type)
    .bind(message)
    .bind(payload)
    .fetch_one(conn)
    .await?;

    Ok(id.0)
}

pub async fn enqueue_back_office(
    conn: &mut PgConnection,
    event_type: &str,
    message: &str,
    payload: Option<serde_json::Value>,
) -> PipelineResult<Uuid> {
    enqueue(conn, OutboxTarget::BackOffice, event_type, message, payload).await
}

pub async fn enqueue_role(
    conn: &mut PgConnection,
    role: &str,
    event_type: &str,
    message: &str,
    payload: Option<serde_json::Value>,
) -> PipelineResult<Uuid> {
    enqueue(
        conn,
        OutboxTarget::Role(role.to_string()),
        event_type,
        message,
        payload,
    )
    .await
}

pub async fn enqueue_user(
    conn: &mut PgConnection,
    user_id: Uuid,
    event_type: &str,
    message: &str,
    payload: Option<serde_json::Value>,
) -> PipelineResult<Uuid> {
    enqueue(conn, OutboxTarget::User(user_id), event_type, message, payload).await
}

/// Pool-side queries used by the dispatcher and the ops surface
#[derive(Clone)]
pub struct OutboxStore {
    pool: PgPool,
}

impl OutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Due rows, oldest first. Includes `processing` rows so a crashed
    /// dispatcher's claims come back once their backoff window lapses.
    pub async fn claim_due(&self, batch_size: i64) -> PipelineResult<Vec<OutboxMessage>> {
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM outbox_messages
            WHERE status IN ('pending', 'processing')
              AND next_attempt_utc <= NOW()
            ORDER BY created_utc, id
            LIMIT $1
            "#,
        )
        .bind(batch_size)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Record an attempt start. The increment is durable even if the
    /// publish then fails, so backoff compounds correctly.
    pub async fn mark_attempt_started(&self, id: Uuid) -> PipelineResult<i32> {
        let row: (i32,) = sqlx::query_as(
            r#"
            UPDATE outbox_messages
            SET status = 'processing',
                attempt_count = attempt_count + 1,
                last_attempt_utc = NOW(),
                updated_utc = NOW()
            WHERE id = $1
            RETURNING attempt_count
            "#,
        )
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.0)
    }

    pub async fn mark_processed(&self, id: Uuid) -> PipelineResult<()> {
        sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'processed',
                last_error = NULL,
                processed_utc = NOW(),
                updated_utc = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a failed publish: schedule the next attempt, or dead-letter
    /// once the attempt ceiling is reached. Returns the resulting status.
    pub async fn mark_attempt_failed(
        &self,
        id: Uuid,
        error: &str,
        delay_seconds: i64,
        max_attempts: i32,
    ) -> PipelineResult<OutboxStatus> {
        let row: (String,) = sqlx::query_as(
            r#"
            UPDATE outbox_messages
            SET status = CASE WHEN attempt_count >= $4 THEN 'failed' ELSE 'pending' END,
                last_error = $2,
                next_attempt_utc = NOW() + make_interval(secs => $3),
                updated_utc = NOW()
            WHERE id = $1
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(truncate_notes(error))
        .bind(delay_seconds as f64)
        .bind(max_attempts)
        .fetch_one(&self.pool)
        .await?;

        Ok(OutboxStatus::parse(&row.0).unwrap_or(OutboxStatus::Failed))
    }

    /// Ops listing, newest first
    pub async fn list(
        &self,
        status: Option<OutboxStatus>,
        limit: i64,
    ) -> PipelineResult<Vec<OutboxMessage>> {
        let rows = sqlx::query_as(
            r#"
            SELECT * FROM outbox_messages
            WHERE ($1::TEXT IS NULL OR status = $1)
            ORDER BY created_utc DESC
            LIMIT $2
            "#,
        )
        .bind(status.map(|s| s.as_str()))
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Manual retry: failed or pending rows go back to `pending`, due now,
    /// with the error cleared. Processed rows are refused.
    pub async fn retry(&self, id: Uuid) -> PipelineResult<OutboxMessage> {
        let updated: Option<OutboxMessage> = sqlx::query_as(
            r#"
            UPDATE outbox_messages
            SET status = 'pending',
                last_error = NULL,
                next_attempt_utc = NOW(),
                updated_utc = NOW()
            WHERE id = $1 AND status IN ('failed', 'pending')
            RETURNING *
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(message) => Ok(message),
            None => {
                let exists: Option<(String,)> =
                    sqlx::query_as("SELECT status FROM outbox_messages WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?;
                match exists {
                    Some((status,)) => Err(PipelineError::Conflict(format!(
                        "outbox message {} is {} and cannot be retried",
                        id, status
                    ))),
                    None => Err(PipelineError::NotFound(format!("outbox message {}", id))),
                }
            }
        }
    }

    /// Bulk-retry dead-lettered rows, bounded batch. Returns rows reset.
    pub async fn retry_failed(&self, limit: i64) -> PipelineResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_messages
            SET status = 'pending',
                last_error = NULL,
                next_attempt_utc = NOW(),
                updated_utc = NOW()
            WHERE id IN (
                SELECT id FROM outbox_messages
                WHERE status = 'failed'
                ORDER BY created_utc
                LIMIT $1
            )
            "#,
        )
        .bind(limit.clamp(1, 500))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// Force a message to `failed` with an operator-supplied reason.
    /// Refused when the message already went out.
    pub async fn dead_letter(&self, id: Uuid, reason: &str) -> PipelineResult<OutboxMessage> {
        let updated: Option<OutboxMessage> = sqlx::query_as(
            r#"
            UPDATE outbox_messages
            SET status = 'failed',
                last_error = $2,
                updated_utc = NOW()
            WHERE id = $1 AND status != 'processed'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(truncate_notes(reason))
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(message) => Ok(message),
            None => {
                let exists: Option<(String,)> =
                    sqlx::query_as("SELECT status FROM outbox_messages WHERE id = $1")
                        .bind(id)
                        .fetch_optional(&self.pool)
                        .await?;
                match exists {
                    Some(_) => Err(PipelineError::Conflict(format!(
                        "outbox message {} was already processed",
                        id
                    ))),
                    None => Err(PipelineError::NotFound(format!("outbox message {}", id))),
                }
            }
        }
    }
}
