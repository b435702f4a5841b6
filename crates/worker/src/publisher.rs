//! Publisher implementations for the outbox dispatcher
//!
//! The HTTP publisher posts each event to the realtime broadcast endpoint;
//! the tracing publisher is the minimal-mode fallback that just logs, so
//! the outbox keeps draining even without a broadcast backend.

use async_trait::async_trait;
use memberpay_pipeline::{PipelineError, PipelineResult, Publisher};
use uuid::Uuid;

/// Posts outbox events as JSON to the broadcast endpoint
pub struct HttpPublisher {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpPublisher {
    pub fn new(endpoint: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
        }
    }

    async fn post(&self, body: serde_json::Value) -> PipelineResult<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::Publish(format!("broadcast request failed: {}", e)))?;

        response
            .error_for_status()
            .map_err(|e| PipelineError::Publish(format!("broadcast endpoint rejected: {}", e)))?;

        Ok(())
    }

    fn envelope(
        channel: serde_json::Value,
        event_type: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> serde_json::Value {
        serde_json::json!({
            "channel": channel,
            "event_type": event_type,
            "message": message,
            "payload": payload,
        })
    }
}

#[async_trait]
impl Publisher for HttpPublisher {
    async fn publish_back_office(
        &self,
        event_type: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> PipelineResult<()> {
        let channel = serde_json::json!({ "kind": "back_office" });
        self.post(Self::envelope(channel, event_type, message, payload))
            .await
    }

    async fn publish_role(
        &self,
        role: &str,
        event_type: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> PipelineResult<()> {
        let channel = serde_json::json!({ "kind": "role", "role": role });
        self.post(Self::envelope(channel, event_type, message, payload))
            .await
    }

    async fn publish_user(
        &self,
        user_id: Uuid,
        event_type: &str,
        message: &str,
        payload: Option<&serde_json::Value>,
    ) -> PipelineResult<()> {
        let channel = serde_json::json!({ "kind": "user", "user_id": user_id });
        self.post(Self::envelope(channel, event_type, message, payload))
            .await
    }
}

/// Minimal-mode publisher: delivery is a structured log line
pub struct TracingPublisher;

#[async_trait]
impl Publisher for TracingPublisher {
    async fn publish_back_office(
        &self,
        event_type: &str,
        message: &str,
        _payload: Option<&serde_json::Value>,
    ) -> PipelineResult<()> {
        tracing::info!(channel = "back_office", event_type = event_type, message = message, "Outbox event");
        Ok(())
    }

    async fn publish_role(
        &self,
        role: &str,
        event_type: &str,
        message: &str,
        _payload: Option<&serde_json::Value>,
    ) -> PipelineResult<()> {
        tracing::info!(channel = "role", role = role, event_type = event_type, message = message, "Outbox event");
        Ok(())
    }

    async fn publish_user(
        &self,
        user_id: Uuid,
        event_type: &str,
        message: &str,
        _payload: Option<&serde_json::Value>,
    ) -> PipelineResult<()> {
        tracing::info!(channel = "user", user_id = %user_id, event_type = event_type, message = message, "Outbox event");
        Ok(())
    }
}
