use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_common::types::ResourceType;

/// An inbound change notification. `event_id` is the accounting platform's
/// own id and is unique, which makes redelivery a no-op.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebhookEvent {
    pub event_id: String,
    pub resource_type: ResourceType,
    pub resource_id: String,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub raw_payload: serde_json::Value,
}

impl WebhookEvent {
    pub fn received(
        event_id: impl Into<String>,
        resource_type: ResourceType,
        resource_id: impl Into<String>,
        raw_payload: serde_json::Value,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id: event_id.into(),
            resource_type,
            resource_id: resource_id.into(),
            received_at,
            processed_at: None,
            attempts: 0,
            last_error: None,
            raw_payload,
        }
    }

    pub fn is_processed(&self) -> bool {
        self.processed_at.is_some()
    }
}
