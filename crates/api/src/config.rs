//! API server configuration

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub database_url: String,
    pub bind_address: String,
    pub max_connections: u32,
    /// Bearer token for the operator endpoints. When unset, the ops surface
    /// is disabled rather than left open.
    pub admin_api_token: Option<String>,
}

impl ApiConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let max_connections = std::env::var("DATABASE_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10);

        let admin_api_token = std::env::var("ADMIN_API_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        Ok(Self {
            database_url,
            bind_address,
            max_connections,
            admin_api_token,
        })
    }
}
