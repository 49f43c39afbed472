pub mod handlers;

use axum::routing::post;
use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/webhook", post(handlers::receive_webhook))
}
