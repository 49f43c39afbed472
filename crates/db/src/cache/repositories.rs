use std::collections::HashMap;

use async_trait::async_trait;
use tally_common::error::TallyResult;
use tally_common::types::ResourceType;
use uuid::Uuid;

use crate::cache::models::{CacheBatch, CacheFilter, CachedEntry};

#[async_trait]
pub trait CacheRepository: Send + Sync {
    /// Insert or merge every record of the batch inside one transaction, one
    /// atomic insert-or-update statement per row.
    ///
    /// External-owned columns take the incoming values; a stored `local_id`
    /// always wins and an incoming one only fills a missing link. A row is only touched
    /// when the incoming `last_modified` is newer, or equal with a different
    /// payload or a newly resolved link. Returns the number of rows changed.
    async fn upsert_batch(&self, batch: &CacheBatch) -> TallyResult<usize>;

    /// Local links of the given cached records, for rows that have one.
    async fn local_links(
        &self,
        resource: ResourceType,
        external_ids: &[String],
    ) -> TallyResult<HashMap<String, Uuid>>;

    /// Set or clear the local link of a cached row. Touches nothing else.
    async fn set_local_link(
        &self,
        resource: ResourceType,
        external_id: &str,
        local_id: Option<Uuid>,
    ) -> TallyResult<()>;

    async fn get(
        &self,
        resource: ResourceType,
        external_id: &str,
    ) -> TallyResult<Option<CachedEntry>>;

    async fn list(
        &self,
        resource: ResourceType,
        filter: CacheFilter,
    ) -> TallyResult<Vec<CachedEntry>>;
}
