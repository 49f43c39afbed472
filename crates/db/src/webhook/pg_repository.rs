use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgPool, Row};
use tally_common::error::{TallyError, TallyResult};
use tally_common::types::ResourceType;

use crate::webhook::models::WebhookEvent;
use crate::webhook::repositories::WebhookEventRepository;

const EVENT_COLUMNS: &str =
    "event_id, resource_type, resource_id, received_at, processed_at, attempts, last_error, raw_payload";

#[derive(Clone)]
pub struct PgWebhookRepository {
    pool: PgPool,
}

impl PgWebhookRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_row(row: PgRow) -> TallyResult<WebhookEvent> {
        let resource_raw: String = row.get("resource_type");
        Ok(WebhookEvent {
            event_id: row.get("event_id"),
            resource_type: ResourceType::from_str(&resource_raw).map_err(TallyError::Internal)?,
            resource_id: row.get("resource_id"),
            received_at: row.get("received_at"),
            processed_at: row.get("processed_at"),
            attempts: row.get("attempts"),
            last_error: row.get("last_error"),
            raw_payload: row.get("raw_payload"),
        })
    }
}

#[async_trait]
impl WebhookEventRepository for PgWebhookRepository {
    async fn find(&self, event_id: &str) -> TallyResult<Option<WebhookEvent>> {
        let sql = format!("select {EVENT_COLUMNS} from webhook_events where event_id = $1");
        let row = sqlx::query(&sql)
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| TallyError::Database(e.to_string()))?;

        row.map(Self::map_row).transpose()
    }

    async fn record_received(&self, event: &WebhookEvent) -> TallyResult<bool> {
        let result = sqlx::query(
            "insert into webhook_events
               (event_id, resource_type, resource_id, received_at, attempts, raw_payload)
             values ($1, $2, $3, $4, 0, $5)
             on conflict (event_id) do nothing",
        )
        .bind(&event.event_id)
        .bind(event.resource_type.as_str())
        .bind(&event.resource_id)
        .bind(event.received_at)
        .bind(&event.raw_payload)
        .execute(&self.pool)
        .await
        .map_err(|e| TallyError::Database(e.to_string()))?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_processed(
        &self,
        event_id: &str,
        at: DateTime<Utc>,
        note: Option<&str>,
    ) -> TallyResult<()> {
        sqlx::query(
            "update webhook_events
             set processed_at = coalesce(processed_at, $2), last_error = $3
             where event_id = $1",
        )
        .bind(event_id)
        .bind(at)
        .bind(note)
        .execute(&self.pool)
        .await
        .map_err(|e| TallyError::Database(e.to_string()))?;
        Ok(())
    }

    async fn mark_failed(&self, event_id: &str, error: &str) -> TallyResult<()> {
        sqlx::query(
            "update webhook_events
             set attempts = attempts + 1, last_error = $2
             where event_id = $1 and processed_at is null",
        )
        .bind(event_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| TallyError::Database(e.to_string()))?;
        Ok(())
    }

    async fn list_unprocessed(&self, limit: i64) -> TallyResult<Vec<WebhookEvent>> {
        let sql = format!(
            "select {EVENT_COLUMNS} from webhook_events
             where processed_at is null
             order by received_at, event_id
             limit $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| TallyError::Database(e.to_string()))?;

        rows.into_iter().map(Self::map_row).collect()
    }

    async fn mark_processed_for(
        &self,
        resource: ResourceType,
        resource_ids: &[String],
        fetched_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> TallyResult<u64> {
        if resource_ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query(
            "update webhook_events
             set processed_at = $3, last_error = null
             where processed_at is null and resource_type = $1 and resource_id = any($2)
               and received_at <= $4",
        )
        .bind(resource.as_str())
        .bind(resource_ids)
        .bind(at)
        .bind(fetched_at)
        .execute(&self.pool)
        .await
        .map_err(|e| TallyError::Database(e.to_string()))?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use uuid::Uuid;

    async fn test_repo() -> Option<PgWebhookRepository> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = create_pool(&url).await.expect("db should connect");
        run_migrations(&pool).await.ok()?;
        Some(PgWebhookRepository::new(pool))
    }

    fn event(id: &str) -> WebhookEvent {
        WebhookEvent::received(
            id,
            ResourceType::Invoice,
            "inv-1",
            serde_json::json!({ "id": id }),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn duplicate_event_id_is_ignored() {
        let repo = match test_repo().await {
            Some(r) => r,
            None => return,
        };
        let id = format!("evt-{}", Uuid::new_v4());
        assert!(repo.record_received(&event(&id)).await.expect("first"));
        assert!(!repo.record_received(&event(&id)).await.expect("second"));
    }

    #[tokio::test]
    async fn failed_then_processed() {
        let repo = match test_repo().await {
            Some(r) => r,
            None => return,
        };
        let id = format!("evt-{}", Uuid::new_v4());
        repo.record_received(&event(&id)).await.expect("insert");
        repo.mark_failed(&id, "circuit open").await.expect("fail");

        let stored = repo.find(&id).await.expect("find").expect("exists");
        assert_eq!(stored.attempts, 1);
        assert!(!stored.is_processed());

        repo.mark_processed(&id, Utc::now(), None)
            .await
            .expect("processed");
        let stored = repo.find(&id).await.expect("find").expect("exists");
        assert!(stored.is_processed());
    }

    #[tokio::test]
    async fn sync_settles_only_events_received_before_the_fetch() {
        let repo = match test_repo().await {
            Some(r) => r,
            None => return,
        };
        let resource_id = format!("inv-{}", Uuid::new_v4());
        let fetched_at = Utc::now();
        let early = WebhookEvent::received(
            format!("evt-{}", Uuid::new_v4()),
            ResourceType::Invoice,
            resource_id.clone(),
            serde_json::json!({}),
            fetched_at - chrono::Duration::minutes(5),
        );
        let late = WebhookEvent::received(
            format!("evt-{}", Uuid::new_v4()),
            ResourceType::Invoice,
            resource_id.clone(),
            serde_json::json!({}),
            fetched_at + chrono::Duration::minutes(5),
        );
        repo.record_received(&early).await.expect("early");
        repo.record_received(&late).await.expect("late");

        let marked = repo
            .mark_processed_for(ResourceType::Invoice, &[resource_id], fetched_at, Utc::now())
            .await
            .expect("settle");

        assert_eq!(marked, 1);
        let late = repo.find(&late.event_id).await.expect("find").expect("exists");
        assert!(!late.is_processed());
    }
}
