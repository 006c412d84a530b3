use anyhow::{bail, Context};
use uuid::Uuid;

/// Connection and tenant settings resolved from flags or the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub tenant_id: Option<Uuid>,
    pub max_connections: u32,
}

impl AppConfig {
    pub fn new(database_url: Option<String>, tenant_id: Option<Uuid>, max_connections: u32) -> anyhow::Result<Self> {
        let database_url = database_url
            .filter(|url| !url.trim().is_empty())
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        if !(database_url.starts_with("postgres://") || database_url.starts_with("postgresql://")) {
            bail!("DATABASE_URL must use the postgres:// or postgresql:// scheme");
        }
        if max_connections == 0 {
            bail!("max connections must be at least 1");
        }

        Ok(Self {
            database_url,
            tenant_id,
            max_connections,
        })
    }

    pub fn tenant(&self) -> anyhow::Result<Uuid> {
        self.tenant_id
            .context("ACADEMY_TENANT_ID (or --tenant) is required for this command")
    }
}
