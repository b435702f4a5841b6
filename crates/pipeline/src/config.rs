//! Pipeline configuration
//!
//! All knobs come from environment variables with sensible defaults, so the
//! api and worker binaries can share one loading path.

use crate::error::{PipelineError, PipelineResult};

/// Inbound webhook verification and receipt-ledger settings
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Shared secret for the PayMongo signature header. `None` is only
    /// acceptable when `enforce_signature` is false.
    pub secret: Option<String>,
    /// When false, unsigned webhooks are accepted (local development only)
    pub enforce_signature: bool,
    /// Reject events whose header timestamp drifts more than this from now.
    /// Zero disables the replay-window check.
    pub tolerance_seconds: i64,
    /// How long a `processing` receipt is considered live before another
    /// delivery may re-claim it.
    pub receipt_liveness_seconds: i64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            enforce_signature: true,
            tolerance_seconds: 300,
            receipt_liveness_seconds: 120,
        }
    }
}

impl WebhookConfig {
    pub fn from_env() -> PipelineResult<Self> {
        let secret = std::env::var("PAYMONGO_WEBHOOK_SECRET")
            .ok()
            .filter(|s| !s.is_empty());
        let enforce_signature = env_bool("WEBHOOK_SIGNATURE_ENFORCED", true);

        if secret.is_none() && enforce_signature {
            return Err(PipelineError::Config(
                "PAYMONGO_WEBHOOK_SECRET is required unless WEBHOOK_SIGNATURE_ENFORCED=false"
                    .to_string(),
            ));
        }

        Ok(Self {
            secret,
            enforce_signature,
            tolerance_seconds: env_i64("WEBHOOK_TOLERANCE_SECONDS", 300),
            receipt_liveness_seconds: env_i64("RECEIPT_LIVENESS_SECONDS", 120),
        })
    }
}

/// Outbox dispatcher settings
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Seconds between poll ticks, clamped to 1..=300
    pub poll_interval_seconds: u64,
    /// Maximum due rows claimed per tick
    pub batch_size: i64,
    /// Attempts before a message is dead-lettered
    pub max_attempts: i32,
    /// Base for the exponential backoff schedule
    pub base_delay_seconds: i64,
    /// Upper bound on a single publish call
    pub publish_timeout_seconds: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 5,
            batch_size: 25,
            max_attempts: 8,
            base_delay_seconds: 5,
            publish_timeout_seconds: 10,
        }
    }
}

impl DispatcherConfig {
    pub fn from_env() -> Self {
        Self {
            poll_interval_seconds: env_i64("OUTBOX_POLL_INTERVAL_SECONDS", 5).clamp(1, 300) as u64,
            batch_size: env_i64("OUTBOX_BATCH_SIZE", 25).max(1),
            max_attempts: env_i64("OUTBOX_MAX_ATTEMPTS", 8).max(1) as i32,
            base_delay_seconds: env_i64("OUTBOX_BASE_DELAY_SECONDS", 5).max(1),
            publish_timeout_seconds: env_i64("OUTBOX_PUBLISH_TIMEOUT_SECONDS", 10).clamp(1, 120)
                as u64,
        }
    }
}

fn env_i64(key: &str, default: i64) -> i64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
