//! Operator endpoints over the outbox and the receipt ledger
//!
//! Everything here sits behind the `X-Admin-Token` guard. Responses are
//! built explicitly so timestamps always render as RFC 3339 regardless of
//! how the rows are stored.

use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::Response;
use axum::Json;
use memberpay_pipeline::{OutboxMessage, OutboxStatus, ReceiptStatus, WebhookReceipt};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
const DEFAULT_LIST_LIMIT: i64 = 50;

/// Gate for every `/admin` route. Compares in constant time; a deployment
/// without a configured token refuses all operator calls.
pub async fn require_admin_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = &state.config.admin_api_token else {
        return Err(ApiError::unauthorized("operator endpoints are disabled"));
    };

    let presented = request
        .headers()
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if !bool::from(presented.as_bytes().ct_eq(expected.as_bytes())) {
        tracing::warn!("Rejected operator call with missing or invalid admin token");
        return Err(ApiError::unauthorized("invalid admin token"));
    }

    Ok(next.run(request).await)
}

fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_else(|_| ts.to_string())
}

fn outbox_json(message: &OutboxMessage) -> serde_json::Value {
    serde_json::json!({
        "id": message.id,
        "target": message.target,
        "target_value": message.target_value,
        "event_type": message.event_type,
        "message": message.message,
        "payload": message.payload,
        "status": message.status,
        "attempt_count": message.attempt_count,
        "last_error": message.last_error,
        "next_attempt_utc": rfc3339(message.next_attempt_utc),
        "processed_utc": message.processed_utc.map(rfc3339),
        "created_utc": rfc3339(message.created_utc),
    })
}

fn receipt_json(receipt: &WebhookReceipt) -> serde_json::Value {
    serde_json::json!({
        "id": receipt.id,
        "provider": receipt.provider,
        "event_key": receipt.event_key,
        "event_type": receipt.event_type,
        "external_reference": receipt.external_reference,
        "status": receipt.status,
        "attempt_count": receipt.attempt_count,
        "notes": receipt.notes,
        "first_received_utc": rfc3339(receipt.first_received_utc),
        "last_attempt_utc": rfc3339(receipt.last_attempt_utc),
        "processed_utc": receipt.processed_utc.map(rfc3339),
    })
}

#[derive(Debug, Deserialize)]
pub struct OutboxListParams {
    status: Option<String>,
    limit: Option<i64>,
}

pub async fn list_outbox(
    State(state): State<AppState>,
    Query(params): Query<OutboxListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(
            OutboxStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request("unknown outbox status filter"))?,
        ),
        None => None,
    };

    let messages = state
        .pipeline
        .ops()
        .list_outbox(status, params.limit.unwrap_or(DEFAULT_LIST_LIMIT))
        .await?;

    Ok(Json(serde_json::json!({
        "count": messages.len(),
        "messages": messages.iter().map(outbox_json).collect::<Vec<_>>(),
    })))
}

pub async fn retry_outbox(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let message = state.pipeline.ops().retry_outbox(id).await?;
    Ok(Json(outbox_json(&message)))
}

pub async fn retry_failed_outbox(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let reset = state.pipeline.ops().retry_failed_outbox().await?;
    Ok(Json(serde_json::json!({ "reset": reset })))
}

#[derive(Debug, Deserialize)]
pub struct DeadLetterBody {
    reason: String,
}

pub async fn dead_letter_outbox(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DeadLetterBody>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let message = state
        .pipeline
        .ops()
        .dead_letter_outbox(id, &body.reason)
        .await?;
    Ok(Json(outbox_json(&message)))
}

#[derive(Debug, Deserialize)]
pub struct ReceiptListParams {
    status: Option<String>,
    reference: Option<String>,
    limit: Option<i64>,
}

pub async fn list_receipts(
    State(state): State<AppState>,
    Query(params): Query<ReceiptListParams>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let status = match params.status.as_deref() {
        Some(raw) => Some(
            ReceiptStatus::parse(raw)
                .ok_or_else(|| ApiError::bad_request("unknown receipt status filter"))?,
        ),
        None => None,
    };

    let receipts = state
        .pipeline
        .ops()
        .list_receipts(
            status,
            params.reference.as_deref(),
            params.limit.unwrap_or(DEFAULT_LIST_LIMIT),
        )
        .await?;

    Ok(Json(serde_json::json!({
        "count": receipts.len(),
        "receipts": receipts.iter().map(receipt_json).collect::<Vec<_>>(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ReplayBody {
    event_key: Option<String>,
    reference: Option<String>,
    #[serde(default)]
    force: bool,
}

pub async fn replay_webhook(
    State(state): State<AppState>,
    Json(body): Json<ReplayBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let outcome = state
        .pipeline
        .ops()
        .replay(body.event_key.as_deref(), body.reference.as_deref(), body.force)
        .await?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "receipt_id": outcome.receipt_id,
            "event_key": outcome.event_key,
            "classification": outcome.classification,
            "events_enqueued": outcome.events_enqueued,
        })),
    ))
}
