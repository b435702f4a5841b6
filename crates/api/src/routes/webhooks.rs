//! Inbound PayMongo webhook endpoint
//!
//! The body must stay raw bytes all the way into signature verification;
//! any re-serialization would change the signed payload.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use memberpay_pipeline::paymongo::SIGNATURE_HEADERS;
use memberpay_pipeline::WebhookAck;

use crate::error::ApiError;
use crate::state::AppState;

/// First signature header present, trying the historical casing variant too
fn signature_header(headers: &HeaderMap) -> Option<&str> {
    SIGNATURE_HEADERS
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|value| value.to_str().ok())
}

pub async fn paymongo_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let ack = state
        .pipeline
        .handler()
        .handle(&body, signature_header(&headers))
        .await?;

    let result = match ack {
        WebhookAck::Handled => "handled",
        WebhookAck::Duplicate => "duplicate",
        WebhookAck::Ignored => "ignored",
        WebhookAck::Unrecognized => "unrecognized",
    };

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({ "received": true, "result": result })),
    ))
}
