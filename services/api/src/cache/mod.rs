pub mod handlers;
pub mod requests;
pub mod responses;

use axum::routing::{get, put};
use axum::Router;

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/cache/{resource}", get(handlers::list_cached))
        .route("/cache/{resource}/{external_id}", get(handlers::get_cached))
        .route(
            "/cache/{resource}/{external_id}/link",
            put(handlers::set_local_link),
        )
}
