use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tally_common::error::{TallyError, TallyResult};
use tally_common::types::ResourceType;

use crate::sync::models::{RunStatus, SyncWatermark};
use crate::sync::repositories::WatermarkRepository;

#[derive(Clone)]
pub struct PgSyncRepository {
    pool: PgPool,
}

impl PgSyncRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: sqlx::postgres::PgRow) -> TallyResult<SyncWatermark> {
        let resource_raw: String = row.get("resource_type");
        let status_raw: String = row.get("last_run_status");
        Ok(SyncWatermark {
            resource_type: ResourceType::from_str(&resource_raw).map_err(TallyError::Internal)?,
            last_synced_at: row.get("last_synced_at"),
            last_run_status: RunStatus::from_str(&status_raw).map_err(TallyError::Internal)?,
            last_run_error: row.get("last_run_error"),
            last_run_at: row.get("last_run_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl WatermarkRepository for PgSyncRepository {
    async fn get(&self, resource: ResourceType) -> TallyResult<Option<SyncWatermark>> {
        let row = sqlx::query(
            "select resource_type, last_synced_at, last_run_status, last_run_error, last_run_at, updated_at
             from sync_watermarks where resource_type = $1",
        )
        .bind(resource.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| TallyError::Database(e.to_string()))?;

        row.map(Self::map_row).transpose()
    }

    async fn advance(
        &self,
        resource: ResourceType,
        synced_through: Option<DateTime<Utc>>,
        status: RunStatus,
        error: Option<&str>,
    ) -> TallyResult<SyncWatermark> {
        // greatest() ignores nulls, so a run that persisted nothing keeps the old mark.
        let row = sqlx::query(
            "insert into sync_watermarks
               (resource_type, last_synced_at, last_run_status, last_run_error, last_run_at, updated_at)
             values ($1, $2, $3, $4, $5, $5)
             on conflict (resource_type) do update set
               last_synced_at = greatest(sync_watermarks.last_synced_at, excluded.last_synced_at),
               last_run_status = excluded.last_run_status,
               last_run_error = excluded.last_run_error,
               last_run_at = excluded.last_run_at,
               updated_at = excluded.updated_at
             returning resource_type, last_synced_at, last_run_status, last_run_error, last_run_at, updated_at",
        )
        .bind(resource.as_str())
        .bind(synced_through)
        .bind(status.as_str())
        .bind(error)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| TallyError::Database(e.to_string()))?;

        Self::map_row(row)
    }

    async fn list(&self) -> TallyResult<Vec<SyncWatermark>> {
        let rows = sqlx::query(
            "select resource_type, last_synced_at, last_run_status, last_run_error, last_run_at, updated_at
             from sync_watermarks order by resource_type",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| TallyError::Database(e.to_string()))?;

        rows.into_iter().map(Self::map_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use chrono::{Duration, TimeZone};

    // Watermark rows are global per resource type, so these tests share one
    // resource and only assert relative movement.
    async fn test_repo() -> Option<PgSyncRepository> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = create_pool(&url).await.expect("db should connect");
        run_migrations(&pool).await.ok()?;
        Some(PgSyncRepository::new(pool))
    }

    #[tokio::test]
    async fn advance_never_moves_backwards() {
        let repo = match test_repo().await {
            Some(r) => r,
            None => return,
        };
        let high = Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap();
        repo.advance(ResourceType::Payment, Some(high), RunStatus::Success, None)
            .await
            .expect("advance high");

        let wm = repo
            .advance(
                ResourceType::Payment,
                Some(high - Duration::days(30)),
                RunStatus::Success,
                None,
            )
            .await
            .expect("advance low");

        assert_eq!(wm.last_synced_at, Some(high));
    }

    #[tokio::test]
    async fn failed_run_keeps_mark_and_records_error() {
        let repo = match test_repo().await {
            Some(r) => r,
            None => return,
        };
        let before = repo.get_watermark(ResourceType::Invoice).await.expect("get");
        let wm = repo
            .advance(ResourceType::Invoice, None, RunStatus::Error, Some("bad record"))
            .await
            .expect("advance");

        assert_eq!(wm.last_run_status, RunStatus::Error);
        assert_eq!(wm.last_run_error.as_deref(), Some("bad record"));
        assert_eq!(wm.last_synced_at.unwrap_or_default(), before);
    }
}
