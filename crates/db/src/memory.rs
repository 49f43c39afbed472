//! In-process implementation of the cache, watermark and webhook-event
//! repositories.
//!
//! Mirrors the Postgres semantics (merge guard, monotonic watermark,
//! insert-or-ignore events) behind one mutex, so each call is atomic. Used as
//! the deterministic store in tests and for running the service without a
//! database.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tally_common::error::{TallyError, TallyResult};
use tally_common::types::ResourceType;
use uuid::Uuid;

use crate::cache::models::{
    CacheBatch, CacheFilter, CachedCustomer, CachedEntry, CachedInvoice, CachedPayment,
    CachedRecord,
};
use crate::cache::repositories::CacheRepository;
use crate::sync::models::{RunStatus, SyncWatermark};
use crate::sync::repositories::WatermarkRepository;
use crate::webhook::models::WebhookEvent;
use crate::webhook::repositories::WebhookEventRepository;

#[derive(Default)]
struct State {
    customers: BTreeMap<String, CachedCustomer>,
    invoices: BTreeMap<String, CachedInvoice>,
    payments: BTreeMap<String, CachedPayment>,
    watermarks: BTreeMap<ResourceType, SyncWatermark>,
    events: BTreeMap<String, WebhookEvent>,
    upsert_log: Vec<(ResourceType, usize)>,
    fail_upserts: Vec<ResourceType>,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> TallyResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| TallyError::Internal("memory store lock poisoned".to_string()))
    }

    /// Resource type and batch size of every non-empty `upsert_batch` call, in order.
    pub fn upsert_history(&self) -> Vec<(ResourceType, usize)> {
        self.lock().map(|s| s.upsert_log.clone()).unwrap_or_default()
    }

    /// Make the next `upsert_batch` for `resource` fail with a database error
    /// before anything is written.
    pub fn fail_next_upsert(&self, resource: ResourceType) {
        if let Ok(mut state) = self.lock() {
            state.fail_upserts.push(resource);
        }
    }

    pub fn count(&self, resource: ResourceType) -> usize {
        self.lock()
            .map(|s| match resource {
                ResourceType::Customer => s.customers.len(),
                ResourceType::Invoice => s.invoices.len(),
                ResourceType::Payment => s.payments.len(),
            })
            .unwrap_or(0)
    }
}

/// Apply one incoming row with the same guard as the SQL upsert.
fn merge_row<T: Clone + PartialEq>(
    table: &mut BTreeMap<String, CachedRecord<T>>,
    incoming: &CachedRecord<T>,
) -> bool {
    let Some(existing) = table.get_mut(&incoming.external_id) else {
        table.insert(incoming.external_id.clone(), incoming.clone());
        return true;
    };

    let newer = incoming.last_modified > existing.last_modified;
    let same_version = incoming.last_modified == existing.last_modified;
    let adds_link = existing.local_id.is_none() && incoming.local_id.is_some();
    if !(newer || (same_version && (incoming.payload != existing.payload || adds_link))) {
        return false;
    }

    // A stored link wins; sync only fills a missing one.
    let local_id = existing.local_id.or(incoming.local_id);
    *existing = CachedRecord {
        local_id,
        ..incoming.clone()
    };
    true
}

fn link_of<T>(
    table: &BTreeMap<String, CachedRecord<T>>,
    external_ids: &[String],
) -> HashMap<String, Uuid> {
    external_ids
        .iter()
        .filter_map(|id| {
            table
                .get(id)
                .and_then(|r| r.local_id)
                .map(|local| (id.clone(), local))
        })
        .collect()
}

fn set_link<T>(
    table: &mut BTreeMap<String, CachedRecord<T>>,
    external_id: &str,
    local_id: Option<Uuid>,
) -> bool {
    match table.get_mut(external_id) {
        Some(row) => {
            row.local_id = local_id;
            true
        }
        None => false,
    }
}

#[async_trait]
impl CacheRepository for MemoryStore {
    async fn upsert_batch(&self, batch: &CacheBatch) -> TallyResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut state = self.lock()?;
        let resource = batch.resource();
        if let Some(pos) = state.fail_upserts.iter().position(|r| *r == resource) {
            state.fail_upserts.remove(pos);
            return Err(TallyError::Database(format!(
                "injected failure writing {resource} batch"
            )));
        }

        let changed = match batch {
            CacheBatch::Customers(rows) => rows
                .iter()
                .filter(|&r| merge_row(&mut state.customers, r))
                .count(),
            CacheBatch::Invoices(rows) => rows
                .iter()
                .filter(|&r| merge_row(&mut state.invoices, r))
                .count(),
            CacheBatch::Payments(rows) => rows
                .iter()
                .filter(|&r| merge_row(&mut state.payments, r))
                .count(),
        };
        state.upsert_log.push((resource, batch.len()));
        Ok(changed)
    }

    async fn local_links(
        &self,
        resource: ResourceType,
        external_ids: &[String],
    ) -> TallyResult<HashMap<String, Uuid>> {
        let state = self.lock()?;
        Ok(match resource {
            ResourceType::Customer => link_of(&state.customers, external_ids),
            ResourceType::Invoice => link_of(&state.invoices, external_ids),
            ResourceType::Payment => link_of(&state.payments, external_ids),
        })
    }

    async fn set_local_link(
        &self,
        resource: ResourceType,
        external_id: &str,
        local_id: Option<Uuid>,
    ) -> TallyResult<()> {
        let mut state = self.lock()?;
        let found = match resource {
            ResourceType::Customer => set_link(&mut state.customers, external_id, local_id),
            ResourceType::Invoice => set_link(&mut state.invoices, external_id, local_id),
            ResourceType::Payment => set_link(&mut state.payments, external_id, local_id),
        };
        if !found {
            return Err(TallyError::NotFound(format!(
                "cached {resource} not found: {external_id}"
            )));
        }
        Ok(())
    }

    async fn get(
        &self,
        resource: ResourceType,
        external_id: &str,
    ) -> TallyResult<Option<CachedEntry>> {
        let state = self.lock()?;
        Ok(match resource {
            ResourceType::Customer => state
                .customers
                .get(external_id)
                .cloned()
                .map(CachedEntry::Customer),
            ResourceType::Invoice => state
                .invoices
                .get(external_id)
                .cloned()
                .map(CachedEntry::Invoice),
            ResourceType::Payment => state
                .payments
                .get(external_id)
                .cloned()
                .map(CachedEntry::Payment),
        })
    }

    async fn list(
        &self,
        resource: ResourceType,
        filter: CacheFilter,
    ) -> TallyResult<Vec<CachedEntry>> {
        let state = self.lock()?;
        let mut entries: Vec<CachedEntry> = match resource {
            ResourceType::Customer => state
                .customers
                .values()
                .cloned()
                .map(CachedEntry::Customer)
                .collect(),
            ResourceType::Invoice => state
                .invoices
                .values()
                .cloned()
                .map(CachedEntry::Invoice)
                .collect(),
            ResourceType::Payment => state
                .payments
                .values()
                .cloned()
                .map(CachedEntry::Payment)
                .collect(),
        };
        entries.retain(|e| filter.matches(e));
        entries.sort_by(|a, b| {
            b.last_modified()
                .cmp(&a.last_modified())
                .then_with(|| a.external_id().cmp(b.external_id()))
        });

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.unwrap_or(50).max(0) as usize;
        Ok(entries.into_iter().skip(offset).take(limit).collect())
    }
}

#[async_trait]
impl WatermarkRepository for MemoryStore {
    async fn get(&self, resource: ResourceType) -> TallyResult<Option<SyncWatermark>> {
        Ok(self.lock()?.watermarks.get(&resource).cloned())
    }

    async fn advance(
        &self,
        resource: ResourceType,
        synced_through: Option<DateTime<Utc>>,
        status: RunStatus,
        error: Option<&str>,
    ) -> TallyResult<SyncWatermark> {
        let mut state = self.lock()?;
        let now = Utc::now();
        let previous = state
            .watermarks
            .get(&resource)
            .and_then(|wm| wm.last_synced_at);
        let last_synced_at = match (previous, synced_through) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };

        let wm = SyncWatermark {
            resource_type: resource,
            last_synced_at,
            last_run_status: status,
            last_run_error: error.map(str::to_string),
            last_run_at: now,
            updated_at: now,
        };
        state.watermarks.insert(resource, wm.clone());
        Ok(wm)
    }

    async fn list(&self) -> TallyResult<Vec<SyncWatermark>> {
        Ok(self.lock()?.watermarks.values().cloned().collect())
    }
}

#[async_trait]
impl WebhookEventRepository for MemoryStore {
    async fn find(&self, event_id: &str) -> TallyResult<Option<WebhookEvent>> {
        Ok(self.lock()?.events.get(event_id).cloned())
    }

    async fn record_received(&self, event: &WebhookEvent) -> TallyResult<bool> {
        let mut state = self.lock()?;
        if state.events.contains_key(&event.event_id) {
            return Ok(false);
        }
        state.events.insert(event.event_id.clone(), event.clone());
        Ok(true)
    }

    async fn mark_processed(
        &self,
        event_id: &str,
        at: DateTime<Utc>,
        note: Option<&str>,
    ) -> TallyResult<()> {
        let mut state = self.lock()?;
        if let Some(event) = state.events.get_mut(event_id) {
            event.processed_at.get_or_insert(at);
            event.last_error = note.map(str::to_string);
        }
        Ok(())
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> TallyResult<()> {
        let mut state = self.lock()?;
        if let Some(event) = state.events.get_mut(event_id) {
            if event.processed_at.is_none() {
                event.attempts += 1;
                event.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn list_unprocessed(&self, limit: i64) -> TallyResult<Vec<WebhookEvent>> {
        let state = self.lock()?;
        let mut pending: Vec<WebhookEvent> = state
            .events
            .values()
            .filter(|e| !e.is_processed())
            .cloned()
            .collect();
        pending.sort_by(|a, b| {
            a.received_at
                .cmp(&b.received_at)
                .then_with(|| a.event_id.cmp(&b.event_id))
        });
        pending.truncate(limit.max(0) as usize);
        Ok(pending)
    }

    async fn mark_processed_for(
        &self,
        resource: ResourceType,
        resource_ids: &[String],
        fetched_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> TallyResult<u64> {
        let mut state = self.lock()?;
        let mut marked = 0;
        for event in state.events.values_mut() {
            if event.processed_at.is_none()
                && event.resource_type == resource
                && event.received_at <= fetched_at
                && resource_ids.contains(&event.resource_id)
            {
                event.processed_at = Some(at);
                event.last_error = None;
                marked += 1;
            }
        }
        Ok(marked)
    }
}
