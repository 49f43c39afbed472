pub mod cache;
pub mod memory;
pub mod sync;
pub mod webhook;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tally_common::error::{TallyError, TallyResult};

/// Create a Postgres connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> TallyResult<PgPool> {
    tracing::info!("connecting to database");
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .map_err(|e| TallyError::Database(e.to_string()))
}

/// Apply the embedded schema migrations.
pub async fn run_migrations(pool: &PgPool) -> TallyResult<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| TallyError::Database(format!("migration failed: {e}")))?;
    tracing::info!("database migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_pool_fails_with_invalid_url() {
        let result = create_pool("postgres://invalid:5432/nonexistent").await;
        assert!(result.is_err());
    }
}
