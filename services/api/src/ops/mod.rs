pub mod handlers;
pub mod responses;

use axum::routing::{get, post};
use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ops/scheduler", get(handlers::get_scheduler))
        .route("/ops/scheduler/trigger", post(handlers::trigger_pass))
        .route("/ops/scheduler/pause", post(handlers::pause_scheduler))
        .route("/ops/scheduler/resume", post(handlers::resume_scheduler))
        .route("/ops/breakers", get(handlers::list_breakers))
        .route("/ops/breakers/{resource}/reset", post(handlers::reset_breaker))
        .route("/ops/sync-status", get(handlers::sync_status))
        .route("/ops/webhooks/sweep", post(handlers::sweep_webhooks))
}
