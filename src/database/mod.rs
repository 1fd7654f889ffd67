//! Database connection and migration handling

use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::error::{Error, Result};

/// Database connection and operations
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection (lazy — no connection attempted yet)
    pub fn new(postgres_url: &str, max_connections: u32) -> Result<Self> {
        tracing::info!("database pool max connections: {}", max_connections);

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(postgres_url)?;

        Ok(Self { pool })
    }

    /// Create from an existing pool (used by tests against a testcontainer)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Initialize database: verify connectivity and run migrations
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to connect: {e}")))?;

        self.run_migrations().await?;

        Ok(())
    }

    /// Run database migrations from the `migrations/` directory
    async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| Error::Database(format!("failed to run migrations: {e}")))?;

        Ok(())
    }

    /// Health check
    pub async fn health_check(&self) -> Result<HealthStatus> {
        match sqlx::query("SELECT 1").fetch_one(&self.pool).await {
            Ok(_) => Ok(HealthStatus {
                is_healthy: true,
                message: "connected".to_string(),
            }),
            Err(e) => Ok(HealthStatus {
                is_healthy: false,
                message: format!("connection failed: {e}"),
            }),
        }
    }
}

/// Health status for database
#[derive(Debug)]
pub struct HealthStatus {
    pub is_healthy: bool,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_database_creation_is_lazy() {
        let result = Database::new("postgresql://localhost/test", 5);
        assert!(result.is_ok());
    }
}
