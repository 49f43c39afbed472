use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tally_common::error::TallyError;
use tally_ingest::webhook::WebhookError;

use crate::error::ApiError;
use crate::extractors::Signature;
use crate::AppState;

/// Acknowledge a delivery. A verified delivery is always 200 once its events
/// are recorded, even if applying one of them failed; those stay pending.
pub async fn receive_webhook(
    State(state): State<AppState>,
    Signature(signature): Signature,
    body: Bytes,
) -> Response {
    let Some(receiver) = state.webhooks.as_ref() else {
        return ApiError(TallyError::Unavailable(
            "webhook receiver is not configured".to_string(),
        ))
        .into_response();
    };

    match receiver.receive(&body, signature.as_deref()).await {
        Ok(_) => StatusCode::OK.into_response(),
        Err(WebhookError::Signature(_)) => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "invalid signature" })),
        )
            .into_response(),
        Err(WebhookError::Malformed(msg)) => ApiError(TallyError::Validation(msg)).into_response(),
        Err(WebhookError::Store(e)) => ApiError(e).into_response(),
    }
}
