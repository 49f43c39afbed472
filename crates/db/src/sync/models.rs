use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tally_common::types::ResourceType;

/// Outcome of the most recent sync pass for one resource type.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Success,
    Error,
    Skipped,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Skipped => "skipped",
        }
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "success" => Ok(Self::Success),
            "error" => Ok(Self::Error),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("unknown run status: {value}")),
        }
    }
}

/// High-water mark for one resource type. `last_synced_at` is the largest
/// `last_modified` persisted by a successful pass; `None` until the first one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncWatermark {
    pub resource_type: ResourceType,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_run_status: RunStatus,
    pub last_run_error: Option<String>,
    pub last_run_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lower bound used when no watermark exists: the first pass is a full sync.
pub fn initial_watermark() -> DateTime<Utc> {
    // 1970-01-01T00:00:00Z
    DateTime::<Utc>::default()
}
