use std::sync::Arc;

use tally_config::init_tracing;
use tally_db::cache::pg_repository::PgCacheRepository;
use tally_db::sync::pg_repository::PgSyncRepository;
use tally_db::webhook::pg_repository::PgWebhookRepository;
use tally_ingest::accounting::client::{AccountingClient, AccountingClientConfig};
use tally_ingest::breaker::{BreakerConfig, Breakers};
use tally_ingest::clock::SystemClock;
use tally_ingest::engine::{DependencyPolicy, SyncEngine, SyncPass};

/// Run one sync pass and exit. The api service hosts the recurring schedule.
#[tokio::main]
async fn main() {
    init_tracing("info");
    let _ = dotenvy::dotenv();

    tracing::info!(service = "tally-ingest", "starting");

    let client_config = match AccountingClientConfig::from_env() {
        Ok(Some(config)) => config,
        Ok(None) => {
            tracing::info!("no accounting credentials found, nothing to sync");
            return;
        }
        Err(e) => panic!("accounting configuration error (fail-fast): {e}"),
    };

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = tally_db::create_pool(&database_url)
        .await
        .expect("failed to connect to database");
    tally_db::run_migrations(&pool)
        .await
        .expect("failed to apply migrations");

    let clock = Arc::new(SystemClock);
    let breaker_config = BreakerConfig::from_env().expect("invalid breaker configuration");
    let policy = DependencyPolicy::from_env().expect("invalid SYNC_DEPENDENCY_POLICY");
    let breakers = Arc::new(Breakers::new(breaker_config, clock.clone()));
    let client =
        AccountingClient::new(client_config, breakers).expect("failed to create accounting client");

    let engine = SyncEngine::new(
        client,
        Arc::new(PgCacheRepository::new(pool.clone())),
        Arc::new(PgSyncRepository::new(pool.clone())),
        Arc::new(PgWebhookRepository::new(pool)),
        clock,
    )
    .with_policy(policy);

    let report = engine.run_pass().await;
    for outcome in &report.outcomes {
        tracing::info!(
            resource = %outcome.resource,
            status = outcome.status.as_str(),
            fetched = outcome.fetched,
            upserted = outcome.upserted,
            rejected = outcome.rejected,
            error = outcome.error.as_deref().unwrap_or(""),
            "resource sync finished"
        );
    }

    if report.all_succeeded() {
        tracing::info!("sync pass completed");
    } else {
        tracing::warn!("sync pass completed with failures");
    }
}
