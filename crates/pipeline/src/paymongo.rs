//! PayMongo webhook payload extraction
//!
//! The gateway posts an event envelope wrapping the affected resource:
//!
//! ```json
//! { "data": { "id": "evt_...", "attributes": {
//!     "type": "checkout_session.payment.paid",
//!     "data": { "id": "cs_...", "attributes": {
//!         "metadata": { "member_id": "...", "plan_code": "..." },
//!         "payments": [ { "id": "pay_...", "attributes": { "amount": 99900 } } ]
//! } } } } }
//! ```
//!
//! Extraction is a narrow set of typed structs; only the fields the handler
//! needs survive parsing. No general-purpose dynamic JSON tree is carried
//! through the core.

use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};

pub const PROVIDER_PAYMONGO: &str = "paymongo";

/// Header name plus the historical casing variant still seen in the wild
pub const SIGNATURE_HEADERS: [&str; 2] = ["paymongo-signature", "pay-mongo-signature"];

/// Business classification of a recognized event type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Paid,
    Failed,
}

/// Map a gateway event type onto its classification. `None` means the type
/// is not part of the recognized set and must be acknowledged without action.
pub fn classify_event_type(event_type: &str) -> Option<EventKind> {
    match event_type {
        "checkout_session.payment.paid" | "payment.paid" => Some(EventKind::Paid),
        "payment.failed" | "checkout_session.expired" => Some(EventKind::Failed),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    data: EnvelopeData,
}

#[derive(Debug, Deserialize)]
struct EnvelopeData {
    id: Option<String>,
    attributes: EnvelopeAttributes,
}

#[derive(Debug, Deserialize)]
struct EnvelopeAttributes {
    #[serde(rename = "type")]
    event_type: String,
    data: Option<Resource>,
}

#[derive(Debug, Deserialize)]
struct Resource {
    id: Option<String>,
    attributes: Option<ResourceAttributes>,
}

#[derive(Debug, Deserialize, Default)]
struct ResourceAttributes {
    metadata: Option<ResourceMetadata>,
    payments: Option<Vec<PaymentEntry>>,
    amount: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct ResourceMetadata {
    member_id: Option<String>,
    plan_code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PaymentEntry {
    id: Option<String>,
    attributes: Option<PaymentAttributes>,
}

#[derive(Debug, Deserialize)]
struct PaymentAttributes {
    amount: Option<i64>,
}

/// The fields the handler needs from one inbound event
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    /// `None` when the event type is outside the recognized set
    pub kind: Option<EventKind>,
    pub event_type: String,
    /// The gateway's durable event-envelope id, when present
    pub envelope_id: Option<String>,
    /// Resource id, e.g. the checkout-session id used to locate the payment
    pub resource_id: Option<String>,
    /// First attached gateway payment id
    pub payment_id: Option<String>,
    /// Amount in centavos as reported by the gateway
    pub amount_centavos: Option<i64>,
    pub member_id: Option<String>,
    pub plan_code: Option<String>,
}

impl ParsedEvent {
    /// Deduplication key: prefer the gateway's own event id; providers
    /// without durable event ids still dedup by business content via the
    /// deterministic composite.
    pub fn event_key(&self) -> String {
        if let Some(id) = &self.envelope_id {
            if !id.is_empty() {
                return id.clone();
            }
        }
        format!(
            "{}:{}:{}",
            self.event_type,
            self.resource_id.as_deref().unwrap_or("-"),
            self.payment_id.as_deref().unwrap_or("-"),
        )
    }
}

/// Parse a raw webhook body into the handler's view of the event.
pub fn parse_event(raw_body: &[u8]) -> PipelineResult<ParsedEvent> {
    let envelope: Envelope = serde_json::from_slice(raw_body)
        .map_err(|e| PipelineError::MalformedPayload(e.to_string()))?;

    let event_type = envelope.data.attributes.event_type;
    let resource = envelope.data.attributes.data;

    let resource_id = resource.as_ref().and_then(|r| r.id.clone());
    let attributes = resource.and_then(|r| r.attributes).unwrap_or_default();

    let first_payment = attributes.payments.as_ref().and_then(|p| p.first());
    let payment_id = first_payment.and_then(|p| p.id.clone());
    let amount_centavos = first_payment
        .and_then(|p| p.attributes.as_ref())
        .and_then(|a| a.amount)
        .or(attributes.amount);

    let metadata = attributes.metadata.unwrap_or_default();

    Ok(ParsedEvent {
        kind: classify_event_type(&event_type),
        event_type,
        envelope_id: envelope.data.id,
        resource_id,
        payment_id,
        amount_centavos,
        member_id: metadata.member_id,
        plan_code: metadata.plan_code,
    })
}
