//! Route table

mod ops;
mod webhooks;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{middleware, Json, Router};

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    let admin = Router::new()
        .route("/admin/outbox", get(ops::list_outbox))
        .route("/admin/outbox/{id}/retry", post(ops::retry_outbox))
        .route("/admin/outbox/retry-failed", post(ops::retry_failed_outbox))
        .route("/admin/outbox/{id}/dead-letter", post(ops::dead_letter_outbox))
        .route("/admin/webhooks", get(ops::list_receipts))
        .route("/admin/webhooks/replay", post(ops::replay_webhook))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            ops::require_admin_token,
        ));

    Router::new()
        .route("/health", get(health))
        .route("/webhooks/paymongo", post(webhooks::paymongo_webhook))
        .merge(admin)
        .with_state(state)
}

/// Liveness probe; degrades to 503 when the database is unreachable
async fn health(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let db_ok = sqlx::query("SELECT 1").execute(&state.pool).await.is_ok();
    let (status, body) = health_body(db_ok);
    (status, Json(body))
}

fn health_body(db_ok: bool) -> (StatusCode, serde_json::Value) {
    if db_ok {
        (StatusCode::OK, serde_json::json!({ "status": "ok" }))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({ "status": "degraded", "database": "unreachable" }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_reflects_database_reachability() {
        let (status, body) = health_body(true);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = health_body(false);
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
    }
}
