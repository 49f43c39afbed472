use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;
use tally_common::error::TallyError;
use tally_common::types::ResourceType;
use tally_db::sync::repositories::WatermarkRepository;
use tally_ingest::breaker::{BreakerStatus, Gate};
use tally_ingest::clock::Clock;
use tally_ingest::scheduler::{Scheduler, SchedulerStatus, TriggerOutcome};
use tally_ingest::webhook::{SweepReport, WebhookError, WebhookReceiver};

use crate::error::ApiError;
use crate::extractors::Resource;
use crate::ops::responses::{
    BreakersResponse, SchedulerStateResponse, SyncStatusItem, SyncStatusResponse,
};
use crate::AppState;

const DEFAULT_SWEEP_LIMIT: i64 = 100;

fn scheduler(state: &AppState) -> Result<&Arc<Scheduler>, ApiError> {
    state.scheduler.as_ref().ok_or_else(|| {
        ApiError(TallyError::Unavailable(
            "sync is not configured".to_string(),
        ))
    })
}

fn webhooks(state: &AppState) -> Result<&Arc<WebhookReceiver>, ApiError> {
    state.webhooks.as_ref().ok_or_else(|| {
        ApiError(TallyError::Unavailable(
            "webhook receiver is not configured".to_string(),
        ))
    })
}

pub async fn get_scheduler(
    State(state): State<AppState>,
) -> Result<Json<SchedulerStatus>, ApiError> {
    Ok(Json(scheduler(&state)?.status()))
}

/// Start a pass now. Answers 409 when one is already in flight.
pub async fn trigger_pass(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<TriggerOutcome>), ApiError> {
    let outcome = scheduler(&state)?.trigger();
    let status = match outcome {
        TriggerOutcome::Started { .. } => StatusCode::ACCEPTED,
        TriggerOutcome::InFlight { .. } => StatusCode::CONFLICT,
    };
    Ok((status, Json(outcome)))
}

pub async fn pause_scheduler(
    State(state): State<AppState>,
) -> Result<Json<SchedulerStateResponse>, ApiError> {
    let current = scheduler(&state)?.pause();
    Ok(Json(SchedulerStateResponse { state: current }))
}

pub async fn resume_scheduler(
    State(state): State<AppState>,
) -> Result<Json<SchedulerStateResponse>, ApiError> {
    let current = scheduler(&state)?.resume();
    Ok(Json(SchedulerStateResponse { state: current }))
}

pub async fn list_breakers(State(state): State<AppState>) -> Json<BreakersResponse> {
    let data = state.breakers.statuses();
    let count = data.len();
    Json(BreakersResponse { data, count })
}

pub async fn reset_breaker(
    State(state): State<AppState>,
    Resource(resource): Resource,
) -> Json<BreakerStatus> {
    let gate = state.breakers.gate(resource);
    gate.reset();
    tracing::info!(%resource, "circuit breaker reset by operator");
    Json(gate.status())
}

pub async fn sync_status(
    State(state): State<AppState>,
) -> Result<Json<SyncStatusResponse>, ApiError> {
    let stored = state.watermark_repo.list().await?;
    let now = state.clock.now();

    let data: Vec<SyncStatusItem> = ResourceType::SYNC_ORDER
        .iter()
        .map(|resource| {
            let wm = stored.iter().find(|wm| wm.resource_type == *resource);
            let last_synced_at = wm.and_then(|wm| wm.last_synced_at);
            SyncStatusItem {
                resource: *resource,
                last_synced_at,
                last_run_status: wm.map(|wm| wm.last_run_status),
                last_run_error: wm.and_then(|wm| wm.last_run_error.clone()),
                last_run_at: wm.map(|wm| wm.last_run_at),
                staleness_secs: last_synced_at.map(|at| (now - at).num_seconds().max(0)),
            }
        })
        .collect();

    let count = data.len();
    Ok(Json(SyncStatusResponse { data, count }))
}

#[derive(Debug, Default, Deserialize)]
pub struct SweepParams {
    pub limit: Option<i64>,
}

pub async fn sweep_webhooks(
    State(state): State<AppState>,
    Query(params): Query<SweepParams>,
) -> Result<Json<SweepReport>, ApiError> {
    let limit = params.limit.unwrap_or(DEFAULT_SWEEP_LIMIT);
    if limit <= 0 {
        return Err(ApiError(TallyError::Validation(
            "limit must be positive".to_string(),
        )));
    }

    match webhooks(&state)?.sweep_unprocessed(limit).await {
        Ok(report) => Ok(Json(report)),
        Err(WebhookError::Store(e)) => Err(ApiError(e)),
        Err(e) => Err(ApiError(TallyError::Internal(e.to_string()))),
    }
}
