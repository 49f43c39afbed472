use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tally_common::error::TallyError;

pub struct ApiError(pub TallyError);

impl From<TallyError> for ApiError {
    fn from(err: TallyError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            TallyError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            TallyError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            TallyError::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            other => {
                tracing::error!(error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
            }
        };

        let body = serde_json::json!({ "error": message });
        (status, Json(body)).into_response()
    }
}
