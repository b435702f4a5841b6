//! Application state

use std::sync::Arc;

use memberpay_pipeline::PipelineService;
use sqlx::PgPool;

use crate::config::ApiConfig;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub config: ApiConfig,
    pub pipeline: Arc<PipelineService>,
}

impl AppState {
    pub fn new(pool: PgPool, config: ApiConfig) -> anyhow::Result<Self> {
        let pipeline = Arc::new(PipelineService::from_env(pool.clone())?);

        if config.admin_api_token.is_none() {
            tracing::warn!("ADMIN_API_TOKEN not set - operator endpoints are disabled");
        }

        Ok(Self {
            pool,
            config,
            pipeline,
        })
    }
}
