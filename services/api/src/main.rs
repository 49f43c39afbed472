mod cache;
mod error;
mod extractors;
mod ops;
mod webhook;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::{header, HeaderValue, Method},
    routing::get,
    Json, Router,
};
use tally_common::types::ServiceInfo;
use tally_config::{init_tracing, parse_var_or, AppConfig};
use tally_db::cache::pg_repository::PgCacheRepository;
use tally_db::cache::repositories::CacheRepository;
use tally_db::sync::pg_repository::PgSyncRepository;
use tally_db::sync::repositories::WatermarkRepository;
use tally_db::webhook::pg_repository::PgWebhookRepository;
use tally_db::webhook::repositories::WebhookEventRepository;
use tally_ingest::accounting::client::{AccountingClient, AccountingClientConfig};
use tally_ingest::breaker::{BreakerConfig, Breakers};
use tally_ingest::clock::{Clock, SystemClock};
use tally_ingest::engine::{DependencyPolicy, SyncEngine};
use tally_ingest::scheduler::{Schedule, Scheduler};
use tally_ingest::webhook::WebhookReceiver;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub cache_repo: Arc<dyn CacheRepository>,
    pub watermark_repo: Arc<dyn WatermarkRepository>,
    pub breakers: Arc<Breakers>,
    /// `None` when no accounting credentials are configured.
    pub scheduler: Option<Arc<Scheduler>>,
    pub webhooks: Option<Arc<WebhookReceiver>>,
    pub clock: Arc<dyn Clock>,
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn info() -> Json<ServiceInfo> {
    Json(ServiceInfo::new("tally-api"))
}

fn build_router(state: AppState, cors_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = cors_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/health", get(health))
        .route("/info", get(info))
        .merge(webhook::router())
        .merge(ops::router())
        .merge(cache::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Retry unprocessed webhook events on a fixed interval until shutdown.
async fn run_sweeper(
    receiver: Arc<WebhookReceiver>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = receiver.sweep_unprocessed(100).await {
                    tracing::error!(error = %e, "webhook sweep failed");
                }
            }
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
    }
    tracing::info!("webhook sweeper stopped");
}

#[tokio::main]
async fn main() {
    init_tracing("info");

    let config = AppConfig::from_env().expect("failed to load config");
    tracing::info!(service = "tally-api", "starting");

    let pool = tally_db::create_pool(&config.database_url)
        .await
        .expect("failed to create database pool");
    tally_db::run_migrations(&pool)
        .await
        .expect("failed to apply migrations");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let cache_repo: Arc<dyn CacheRepository> = Arc::new(PgCacheRepository::new(pool.clone()));
    let watermark_repo: Arc<dyn WatermarkRepository> =
        Arc::new(PgSyncRepository::new(pool.clone()));
    let event_repo: Arc<dyn WebhookEventRepository> = Arc::new(PgWebhookRepository::new(pool));

    let breaker_config = BreakerConfig::from_env().expect("invalid breaker configuration");
    let breakers = Arc::new(Breakers::new(breaker_config, clock.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler = None;
    let mut webhooks = None;

    match AccountingClientConfig::from_env() {
        Ok(Some(client_config)) => {
            let client = AccountingClient::new(client_config, breakers.clone())
                .expect("failed to create accounting client");
            let policy = DependencyPolicy::from_env().expect("invalid SYNC_DEPENDENCY_POLICY");
            let schedule = Schedule::from_env().expect("invalid sync schedule");
            tracing::info!(
                timezone = %schedule.timezone(),
                ?policy,
                "accounting sync configured"
            );

            let engine = SyncEngine::new(
                client.clone(),
                cache_repo.clone(),
                watermark_repo.clone(),
                event_repo.clone(),
                clock.clone(),
            )
            .with_policy(policy);
            let sched = Arc::new(Scheduler::new(Arc::new(engine), schedule, clock.clone()));
            tokio::spawn(sched.clone().run(shutdown_rx.clone()));
            scheduler = Some(sched);

            match std::env::var("WEBHOOK_SECRET").ok().filter(|s| !s.is_empty()) {
                Some(secret) => {
                    let receiver = Arc::new(WebhookReceiver::new(
                        secret.into_bytes(),
                        client,
                        cache_repo.clone(),
                        event_repo.clone(),
                        clock.clone(),
                    ));
                    let interval: u64 = parse_var_or("WEBHOOK_SWEEP_INTERVAL_SECS", 300)
                        .expect("invalid WEBHOOK_SWEEP_INTERVAL_SECS");
                    tokio::spawn(run_sweeper(
                        receiver.clone(),
                        Duration::from_secs(interval.max(1)),
                        shutdown_rx.clone(),
                    ));
                    webhooks = Some(receiver);
                }
                None => tracing::warn!("WEBHOOK_SECRET not set, /webhook is disabled"),
            }
        }
        Ok(None) => {
            tracing::info!("no accounting credentials found, serving cache reads only");
        }
        Err(e) => panic!("accounting configuration error (fail-fast): {e}"),
    }

    let state = AppState {
        cache_repo,
        watermark_repo,
        breakers,
        scheduler,
        webhooks,
        clock,
    };

    let app = build_router(state, &config.cors_origins);
    let addr: SocketAddr = config.bind_addr().parse().expect("invalid bind address");

    tracing::info!(%addr, "listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
            let _ = shutdown_tx.send(true);
        })
        .await
        .expect("server error");
}
