use axum::extract::{Path, Query, State};
use axum::Json;
use tally_common::error::TallyError;
use tally_common::types::ResourceType;
use tally_db::cache::models::CacheFilter;
use tally_db::cache::repositories::CacheRepository;

use crate::cache::requests::SetLinkRequest;
use crate::cache::responses::{CachedEntryResponse, CachedListResponse};
use crate::error::ApiError;
use crate::extractors::Resource;
use crate::AppState;

const MAX_LIMIT: i64 = 500;

fn not_found(resource: ResourceType, external_id: &str) -> ApiError {
    ApiError(TallyError::NotFound(format!(
        "{resource} {external_id} is not cached"
    )))
}

pub async fn list_cached(
    State(state): State<AppState>,
    Resource(resource): Resource,
    Query(filter): Query<CacheFilter>,
) -> Result<Json<CachedListResponse>, ApiError> {
    if let Some(limit) = filter.limit {
        if !(1..=MAX_LIMIT).contains(&limit) {
            return Err(ApiError(TallyError::Validation(format!(
                "limit must be between 1 and {MAX_LIMIT}"
            ))));
        }
    }
    if filter.offset.is_some_and(|offset| offset < 0) {
        return Err(ApiError(TallyError::Validation(
            "offset must not be negative".to_string(),
        )));
    }

    let data = state.cache_repo.list(resource, filter).await?;
    let count = data.len();
    Ok(Json(CachedListResponse { data, count }))
}

pub async fn get_cached(
    State(state): State<AppState>,
    Resource(resource): Resource,
    Path((_, external_id)): Path<(String, String)>,
) -> Result<Json<CachedEntryResponse>, ApiError> {
    let data = state
        .cache_repo
        .get(resource, &external_id)
        .await?
        .ok_or_else(|| not_found(resource, &external_id))?;

    Ok(Json(CachedEntryResponse { data }))
}

/// Link a cached record to a downstream local id. Sync never overwrites it.
pub async fn set_local_link(
    State(state): State<AppState>,
    Resource(resource): Resource,
    Path((_, external_id)): Path<(String, String)>,
    Json(body): Json<SetLinkRequest>,
) -> Result<Json<CachedEntryResponse>, ApiError> {
    state
        .cache_repo
        .set_local_link(resource, &external_id, body.local_id)
        .await?;
    tracing::info!(%resource, %external_id, local_id = ?body.local_id, "local link updated");

    let data = state
        .cache_repo
        .get(resource, &external_id)
        .await?
        .ok_or_else(|| not_found(resource, &external_id))?;

    Ok(Json(CachedEntryResponse { data }))
}
