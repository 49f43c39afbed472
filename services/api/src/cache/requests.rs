use serde::Deserialize;
use uuid::Uuid;

/// `null` clears the link.
#[derive(Debug, Deserialize)]
pub struct SetLinkRequest {
    pub local_id: Option<Uuid>,
}
