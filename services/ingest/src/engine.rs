//! One delta-sync pass over every resource type, in dependency order.
//!
//! Per type: read the watermark, page through everything changed at or after
//! it, transform, resolve local links, upsert each page in its own
//! transaction, and only then advance the watermark to the highest
//! `last_modified` that was persisted. A type that fails or is skipped keeps
//! its watermark, so the next pass re-reads the same window.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tally_common::error::{TallyError, TallyResult};
use tally_common::types::ResourceType;
use tally_config::get_var_or;
use tally_db::cache::models::CacheBatch;
use tally_db::cache::repositories::CacheRepository;
use tally_db::sync::models::RunStatus;
use tally_db::sync::repositories::WatermarkRepository;
use tally_db::webhook::repositories::WebhookEventRepository;

use crate::accounting::client::{AccountingClient, ClientError};
use crate::accounting::query::ChangedSince;
use crate::clock::Clock;
use crate::transform::transform_page;

/// What happens to a resource whose parent type did not sync in this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyPolicy {
    /// Skip it; its links would resolve against a stale parent.
    #[default]
    SkipDependents,
    /// Sync every type regardless of the others.
    Independent,
}

impl FromStr for DependencyPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "skip_dependents" | "skip" => Ok(Self::SkipDependents),
            "independent" => Ok(Self::Independent),
            other => Err(format!("unknown dependency policy: {other}")),
        }
    }
}

impl DependencyPolicy {
    pub fn from_env() -> TallyResult<Self> {
        get_var_or("SYNC_DEPENDENCY_POLICY", "skip_dependents")
            .parse()
            .map_err(TallyError::Config)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResourceOutcome {
    pub resource: ResourceType,
    pub status: RunStatus,
    pub fetched: usize,
    pub upserted: usize,
    pub rejected: usize,
    /// Stored watermark after this pass.
    pub watermark: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ResourceOutcome {
    fn new(resource: ResourceType) -> Self {
        Self {
            resource,
            status: RunStatus::Success,
            fetched: 0,
            upserted: 0,
            rejected: 0,
            watermark: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PassReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub outcomes: Vec<ResourceOutcome>,
}

impl PassReport {
    pub fn outcome(&self, resource: ResourceType) -> Option<&ResourceOutcome> {
        self.outcomes.iter().find(|o| o.resource == resource)
    }

    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.status == RunStatus::Success)
    }
}

/// Anything that can run a full pass; the scheduler depends on this only.
#[async_trait]
pub trait SyncPass: Send + Sync {
    async fn run_pass(&self) -> PassReport;
}

/// How a resource's sync ended before its watermark was written.
enum Stop {
    Skipped(String),
    Failed(String),
}

pub struct SyncEngine {
    client: AccountingClient,
    cache: Arc<dyn CacheRepository>,
    watermarks: Arc<dyn WatermarkRepository>,
    events: Arc<dyn WebhookEventRepository>,
    clock: Arc<dyn Clock>,
    policy: DependencyPolicy,
}

impl SyncEngine {
    pub fn new(
        client: AccountingClient,
        cache: Arc<dyn CacheRepository>,
        watermarks: Arc<dyn WatermarkRepository>,
        events: Arc<dyn WebhookEventRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            client,
            cache,
            watermarks,
            events,
            clock,
            policy: DependencyPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: DependencyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> DependencyPolicy {
        self.policy
    }

    /// The parent type that blocks `resource` under the current policy.
    fn blocked_by(&self, resource: ResourceType, done: &[ResourceOutcome]) -> Option<ResourceType> {
        if self.policy == DependencyPolicy::Independent {
            return None;
        }
        resource.depends_on().filter(|parent| {
            done.iter()
                .any(|o| o.resource == *parent && o.status != RunStatus::Success)
        })
    }

    async fn sync_resource(&self, resource: ResourceType) -> ResourceOutcome {
        let mut outcome = ResourceOutcome::new(resource);

        let result = self.fetch_and_persist(resource, &mut outcome).await;
        let (status, through, error) = match result {
            Ok(max_seen) => (RunStatus::Success, max_seen, None),
            Err(Stop::Skipped(msg)) => {
                tracing::warn!(%resource, reason = %msg, "skipping resource for this pass");
                (RunStatus::Skipped, None, Some(msg))
            }
            Err(Stop::Failed(msg)) => {
                tracing::error!(%resource, error = %msg, "resource sync failed, watermark unchanged");
                (RunStatus::Error, None, Some(msg))
            }
        };

        outcome.status = status;
        outcome.error = error;
        match self
            .watermarks
            .advance(resource, through, status, outcome.error.as_deref())
            .await
        {
            Ok(wm) => outcome.watermark = wm.last_synced_at,
            Err(e) => {
                tracing::error!(%resource, error = %e, "failed to record watermark");
                outcome.status = RunStatus::Error;
                outcome.error = Some(e.to_string());
            }
        }
        outcome
    }

    /// Returns the highest `last_modified` persisted in this pass.
    async fn fetch_and_persist(
        &self,
        resource: ResourceType,
        outcome: &mut ResourceOutcome,
    ) -> Result<Option<DateTime<Utc>>, Stop> {
        let since = self
            .watermarks
            .get_watermark(resource)
            .await
            .map_err(|e| Stop::Failed(e.to_string()))?;
        tracing::info!(%resource, %since, "syncing changes");

        let mut cursor = self
            .client
            .changed_since(ChangedSince::new(resource, since, self.client.page_size()));
        let mut max_seen: Option<DateTime<Utc>> = None;

        loop {
            let fetched_at = self.clock.now();
            let page = match cursor.next_page().await {
                Ok(Some(page)) => page,
                Ok(None) => break,
                Err(e @ ClientError::CircuitOpen { .. }) => return Err(Stop::Skipped(e.to_string())),
                Err(e) => return Err(Stop::Failed(e.to_string())),
            };
            outcome.fetched += page.len();

            let now = self.clock.now();
            let mut transformed = transform_page(resource, page, now);
            outcome.rejected += transformed.rejected;
            if transformed.batch.is_empty() {
                continue;
            }

            resolve_parent_links(self.cache.as_ref(), &mut transformed.batch)
                .await
                .map_err(|e| Stop::Failed(e.to_string()))?;
            let changed = self
                .cache
                .upsert_batch(&transformed.batch)
                .await
                .map_err(|e| Stop::Failed(e.to_string()))?;
            outcome.upserted += changed;
            max_seen = max_seen.max(transformed.batch.max_last_modified());

            let ids = transformed.batch.external_ids();
            match self
                .events
                .mark_processed_for(resource, &ids, fetched_at, now)
                .await
            {
                Ok(0) => {}
                Ok(marked) => tracing::debug!(%resource, marked, "webhook events settled by sync"),
                Err(e) => tracing::warn!(%resource, error = %e, "failed to settle webhook events"),
            }
        }

        tracing::info!(
            %resource,
            fetched = outcome.fetched,
            upserted = outcome.upserted,
            rejected = outcome.rejected,
            "resource synced"
        );
        Ok(max_seen)
    }
}

#[async_trait]
impl SyncPass for SyncEngine {
    async fn run_pass(&self) -> PassReport {
        let started_at = self.clock.now();
        let mut outcomes: Vec<ResourceOutcome> = Vec::with_capacity(3);

        for resource in ResourceType::SYNC_ORDER {
            let outcome = match self.blocked_by(resource, &outcomes) {
                Some(parent) => self.skip_dependent(resource, parent).await,
                None => self.sync_resource(resource).await,
            };
            outcomes.push(outcome);
        }

        let report = PassReport {
            started_at,
            finished_at: self.clock.now(),
            outcomes,
        };
        if report.all_succeeded() {
            tracing::info!("sync pass completed");
        } else {
            let statuses: Vec<(ResourceType, RunStatus)> =
                report.outcomes.iter().map(|o| (o.resource, o.status)).collect();
            tracing::warn!(outcomes = ?statuses, "sync pass completed with failures");
        }
        report
    }
}

impl SyncEngine {
    async fn skip_dependent(&self, resource: ResourceType, parent: ResourceType) -> ResourceOutcome {
        let reason = format!("{parent} did not sync in this pass");
        tracing::warn!(%resource, %parent, "dependency not ready, skipping");

        let mut outcome = ResourceOutcome::new(resource);
        outcome.status = RunStatus::Skipped;
        match self
            .watermarks
            .advance(resource, None, RunStatus::Skipped, Some(&reason))
            .await
        {
            Ok(wm) => outcome.watermark = wm.last_synced_at,
            Err(e) => tracing::error!(%resource, error = %e, "failed to record watermark"),
        }
        outcome.error = Some(reason);
        outcome
    }
}

/// Fill missing `local_id`s from the parent rows already in the cache:
/// invoices through their customer, payments through their invoice.
pub async fn resolve_parent_links(
    cache: &dyn CacheRepository,
    batch: &mut CacheBatch,
) -> TallyResult<()> {
    let Some(parent) = batch.resource().depends_on() else {
        return Ok(());
    };
    let refs = batch.parent_refs();
    if refs.is_empty() {
        return Ok(());
    }
    let links = cache.local_links(parent, &refs).await?;
    if !links.is_empty() {
        batch.apply_parent_links(&links);
    }
    Ok(())
}
