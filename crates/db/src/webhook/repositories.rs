use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_common::error::TallyResult;
use tally_common::types::ResourceType;

use crate::webhook::models::WebhookEvent;

#[async_trait]
pub trait WebhookEventRepository: Send + Sync {
    async fn find(&self, event_id: &str) -> TallyResult<Option<WebhookEvent>>;

    /// Insert the event unless its id is already known.
    /// Returns `true` if a new row was written.
    async fn record_received(&self, event: &WebhookEvent) -> TallyResult<bool>;

    /// Mark processed at `at`. An already-processed event keeps its first timestamp.
    async fn mark_processed(
        &self,
        event_id: &str,
        at: DateTime<Utc>,
        note: Option<&str>,
    ) -> TallyResult<()>;

    /// Count a failed apply attempt; the event stays unprocessed.
    async fn mark_failed(&self, event_id: &str, error: &str) -> TallyResult<()>;

    /// Oldest unprocessed events first.
    async fn list_unprocessed(&self, limit: i64) -> TallyResult<Vec<WebhookEvent>>;

    /// Mark unprocessed events for these records as processed, used when a
    /// sync pass has persisted the records through the delta path. Only events
    /// received at or before `fetched_at` are covered by the fetched version;
    /// later ones stay pending.
    async fn mark_processed_for(
        &self,
        resource: ResourceType,
        resource_ids: &[String],
        fetched_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> TallyResult<u64>;
}
