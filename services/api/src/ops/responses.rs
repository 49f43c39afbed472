use chrono::{DateTime, Utc};
use serde::Serialize;
use tally_common::types::ResourceType;
use tally_db::sync::models::RunStatus;
use tally_ingest::breaker::BreakerStatus;
use tally_ingest::scheduler::SchedulerState;

#[derive(Debug, Serialize)]
pub struct SchedulerStateResponse {
    pub state: SchedulerState,
}

#[derive(Debug, Serialize)]
pub struct BreakersResponse {
    pub data: Vec<BreakerStatus>,
    pub count: usize,
}

/// One resource's watermark as seen by an operator.
#[derive(Debug, Serialize)]
pub struct SyncStatusItem {
    pub resource: ResourceType,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_run_status: Option<RunStatus>,
    pub last_run_error: Option<String>,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Seconds since the watermark, `None` before the first successful pass.
    pub staleness_secs: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct SyncStatusResponse {
    pub data: Vec<SyncStatusItem>,
    pub count: usize,
}
