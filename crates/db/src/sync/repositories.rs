use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_common::error::TallyResult;
use tally_common::types::ResourceType;

use crate::sync::models::{initial_watermark, RunStatus, SyncWatermark};

#[async_trait]
pub trait WatermarkRepository: Send + Sync {
    async fn get(&self, resource: ResourceType) -> TallyResult<Option<SyncWatermark>>;

    /// The "changed since" lower bound for the next pass.
    async fn get_watermark(&self, resource: ResourceType) -> TallyResult<DateTime<Utc>> {
        Ok(self
            .get(resource)
            .await?
            .and_then(|wm| wm.last_synced_at)
            .unwrap_or_else(initial_watermark))
    }

    /// Record the outcome of a pass. The stored timestamp only ever moves
    /// forward: it becomes `max(stored, synced_through)`, and `None` leaves it
    /// untouched. Status and error always reflect this run.
    async fn advance(
        &self,
        resource: ResourceType,
        synced_through: Option<DateTime<Utc>>,
        status: RunStatus,
        error: Option<&str>,
    ) -> TallyResult<SyncWatermark>;

    async fn list(&self) -> TallyResult<Vec<SyncWatermark>>;
}
