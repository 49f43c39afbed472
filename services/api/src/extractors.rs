use axum::extract::{FromRequestParts, Path};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tally_common::types::ResourceType;
use tally_ingest::webhook::SIGNATURE_HEADER;

/// The raw `X-Signature` header, if any. Verification happens against the
/// body in the receiver, so a missing header is not rejected here.
pub struct Signature(pub Option<String>);

#[derive(Debug)]
pub struct SignatureRejection(String);

impl IntoResponse for SignatureRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.0 });
        (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Signature {
    type Rejection = SignatureRejection;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let Some(header) = parts.headers.get(SIGNATURE_HEADER) else {
            return Ok(Signature(None));
        };

        let value = header
            .to_str()
            .map_err(|_| SignatureRejection("invalid X-Signature header value".to_string()))?;

        Ok(Signature(Some(value.to_string())))
    }
}

/// First path segment named `resource`, parsed as a resource type.
pub struct Resource(pub ResourceType);

#[derive(Debug)]
pub struct ResourceRejection(String);

impl IntoResponse for ResourceRejection {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.0 });
        (StatusCode::BAD_REQUEST, axum::Json(body)).into_response()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for Resource {
    type Rejection = ResourceRejection;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(params) = Path::<Vec<(String, String)>>::from_request_parts(parts, state)
            .await
            .map_err(|e| ResourceRejection(e.body_text()))?;

        let raw = params
            .iter()
            .find(|(name, _)| name == "resource")
            .map(|(_, value)| value.as_str())
            .ok_or_else(|| ResourceRejection("missing resource in path".to_string()))?;

        raw.parse().map(Resource).map_err(ResourceRejection)
    }
}
