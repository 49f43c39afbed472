//! Signed change notifications from the accounting platform.
//!
//! The signature is checked over the raw body before anything is parsed or
//! stored. Each event is recorded once by its platform id; the affected record
//! is then fetched and upserted. A failed apply leaves the event unprocessed
//! for the sweep or for the next sync pass.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::Sha256;
use tally_common::error::TallyError;
use tally_common::types::ResourceType;
use tally_db::cache::repositories::CacheRepository;
use tally_db::webhook::models::WebhookEvent;
use tally_db::webhook::repositories::WebhookEventRepository;

use crate::accounting::client::AccountingClient;
use crate::clock::Clock;
use crate::engine::resolve_parent_links;
use crate::transform::transform_record;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "x-signature";

#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    #[error("signature rejected: {0}")]
    Signature(String),

    #[error("malformed webhook body: {0}")]
    Malformed(String),

    #[error(transparent)]
    Store(#[from] TallyError),
}

/// Verify `header` (`sha256=<hex>` or bare hex) as HMAC-SHA256 of `body`.
/// The comparison is constant-time.
pub fn verify_signature(secret: &[u8], body: &[u8], header: Option<&str>) -> Result<(), WebhookError> {
    let header = header
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| WebhookError::Signature("missing signature header".to_string()))?;
    let hex_sig = header.strip_prefix("sha256=").unwrap_or(header);
    let expected = hex::decode(hex_sig)
        .map_err(|_| WebhookError::Signature("signature is not valid hex".to_string()))?;

    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| WebhookError::Signature(format!("unusable secret: {e}")))?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::Signature("signature mismatch".to_string()))
}

/// `sha256=<hex>` signature for `body`; what the platform sends.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

#[derive(Debug, Clone, Deserialize)]
struct InboundEvent {
    #[serde(alias = "event_id", alias = "eventId")]
    id: String,
    #[serde(alias = "resource_type", alias = "entity")]
    resource: String,
    #[serde(alias = "resourceId", alias = "entity_id")]
    resource_id: String,
}

/// A validated event with its own slice of the raw body.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub event_id: String,
    pub resource: ResourceType,
    pub resource_id: String,
    pub raw: Value,
}

/// Accepts `{ "events": [ .. ] }` or one bare event object.
pub fn parse_events(body: &[u8]) -> Result<Vec<ChangeEvent>, WebhookError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| WebhookError::Malformed(e.to_string()))?;

    let raw_events = match value {
        Value::Object(mut map) if map.contains_key("events") => match map.remove("events") {
            Some(Value::Array(events)) => events,
            _ => return Err(WebhookError::Malformed("\"events\" must be an array".to_string())),
        },
        single @ Value::Object(_) => vec![single],
        _ => return Err(WebhookError::Malformed("expected a JSON object".to_string())),
    };
    if raw_events.is_empty() {
        return Err(WebhookError::Malformed("no events in body".to_string()));
    }

    raw_events
        .into_iter()
        .map(|raw| {
            let event = InboundEvent::deserialize(&raw)
                .map_err(|e| WebhookError::Malformed(e.to_string()))?;
            let resource: ResourceType = event.resource.parse().map_err(WebhookError::Malformed)?;
            if event.id.trim().is_empty() || event.resource_id.trim().is_empty() {
                return Err(WebhookError::Malformed(
                    "event id and resource id must not be empty".to_string(),
                ));
            }
            Ok(ChangeEvent {
                event_id: event.id,
                resource,
                resource_id: event.resource_id,
                raw,
            })
        })
        .collect()
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReceiptReport {
    pub received: usize,
    pub replayed: usize,
    pub applied: usize,
    pub pending: usize,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct SweepReport {
    pub attempted: usize,
    pub applied: usize,
    pub failed: usize,
}

enum Applied {
    Upserted(usize),
    NotFound,
    Malformed(String),
}

pub struct WebhookReceiver {
    secret: Vec<u8>,
    client: AccountingClient,
    cache: Arc<dyn CacheRepository>,
    events: Arc<dyn WebhookEventRepository>,
    clock: Arc<dyn Clock>,
}

impl WebhookReceiver {
    pub fn new(
        secret: impl Into<Vec<u8>>,
        client: AccountingClient,
        cache: Arc<dyn CacheRepository>,
        events: Arc<dyn WebhookEventRepository>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            secret: secret.into(),
            client,
            cache,
            events,
            clock,
        }
    }

    /// Verify, record and apply one delivery.
    pub async fn receive(
        &self,
        body: &[u8],
        signature: Option<&str>,
    ) -> Result<ReceiptReport, WebhookError> {
        if let Err(e) = verify_signature(&self.secret, body, signature) {
            tracing::warn!(error = %e, body_len = body.len(), "rejected webhook delivery");
            return Err(e);
        }
        let events = parse_events(body)?;

        let mut report = ReceiptReport::default();
        for event in events {
            if let Some(existing) = self.events.find(&event.event_id).await? {
                if existing.is_processed() {
                    tracing::debug!(event_id = %event.event_id, "duplicate delivery, already processed");
                    report.replayed += 1;
                    continue;
                }
            } else {
                let row = WebhookEvent::received(
                    event.event_id.clone(),
                    event.resource,
                    event.resource_id.clone(),
                    event.raw.clone(),
                    self.clock.now(),
                );
                if !self.events.record_received(&row).await? {
                    // A concurrent delivery of the same event owns it.
                    report.replayed += 1;
                    continue;
                }
                report.received += 1;
            }

            if self
                .settle(&event.event_id, event.resource, &event.resource_id)
                .await?
            {
                report.applied += 1;
            } else {
                report.pending += 1;
            }
        }

        tracing::info!(
            received = report.received,
            replayed = report.replayed,
            applied = report.applied,
            pending = report.pending,
            "webhook delivery handled"
        );
        Ok(report)
    }

    /// Retry unprocessed events, oldest first.
    pub async fn sweep_unprocessed(&self, limit: i64) -> Result<SweepReport, WebhookError> {
        let pending = self.events.list_unprocessed(limit).await?;
        let mut report = SweepReport::default();

        for event in pending {
            report.attempted += 1;
            if self
                .settle(&event.event_id, event.resource_type, &event.resource_id)
                .await?
            {
                report.applied += 1;
            } else {
                report.failed += 1;
            }
        }

        if report.attempted > 0 {
            tracing::info!(
                attempted = report.attempted,
                applied = report.applied,
                failed = report.failed,
                "webhook sweep finished"
            );
        }
        Ok(report)
    }

    /// Apply one event and record the result. `Ok(true)` once it is processed.
    async fn settle(
        &self,
        event_id: &str,
        resource: ResourceType,
        resource_id: &str,
    ) -> Result<bool, WebhookError> {
        match self.apply(resource, resource_id).await {
            Ok(applied) => {
                let note = match &applied {
                    Applied::Upserted(_) => None,
                    Applied::NotFound => Some("record not found upstream".to_string()),
                    Applied::Malformed(e) => Some(format!("record not applied: {e}")),
                };
                if let Applied::Upserted(changed) = applied {
                    tracing::debug!(%event_id, %resource, %resource_id, changed, "webhook record applied");
                }
                self.events
                    .mark_processed(event_id, self.clock.now(), note.as_deref())
                    .await?;
                Ok(true)
            }
            Err(e) => {
                tracing::warn!(%event_id, %resource, %resource_id, error = %e, "webhook apply failed, left unprocessed");
                self.events.mark_failed(event_id, &e).await?;
                Ok(false)
            }
        }
    }

    /// Fetch and upsert one record. `Err` carries a retryable failure.
    async fn apply(&self, resource: ResourceType, resource_id: &str) -> Result<Applied, String> {
        let raw = match self.client.get_record(resource, resource_id).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return Ok(Applied::NotFound),
            Err(e) => return Err(e.to_string()),
        };

        let mut batch = match transform_record(resource, raw, self.clock.now()) {
            Ok(batch) => batch,
            Err(e) => return Ok(Applied::Malformed(e.to_string())),
        };
        resolve_parent_links(self.cache.as_ref(), &mut batch)
            .await
            .map_err(|e| e.to_string())?;
        let changed = self
            .cache
            .upsert_batch(&batch)
            .await
            .map_err(|e| e.to_string())?;
        Ok(Applied::Upserted(changed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accounting::client::AccountingClientConfig;
    use crate::breaker::{Admission, BreakerConfig, Breakers, Gate};
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use serde_json::json;
    use tally_db::memory::MemoryStore;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &[u8] = b"whsec_test";

    fn receiver(server: &MockServer, store: &MemoryStore) -> (WebhookReceiver, Arc<Breakers>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let breakers = Arc::new(Breakers::new(BreakerConfig::default(), clock.clone()));
        let client = AccountingClient::new(
            AccountingClientConfig {
                base_url: server.uri(),
                api_token: "t".to_string(),
                page_size: 50,
                timeout_secs: 5,
            },
            breakers.clone(),
        )
        .unwrap();
        let receiver = WebhookReceiver::new(
            SECRET,
            client,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            clock,
        );
        (receiver, breakers)
    }

    fn body(event_id: &str, resource: &str, id: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "events": [{ "id": event_id, "resource": resource, "resource_id": id }]
        }))
        .unwrap()
    }

    async fn serve_customer(server: &MockServer, id: &str) {
        Mock::given(method("GET"))
            .and(path(format!("/v1/customers/{id}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Id": id,
                "DisplayName": "Harbor Builders",
                "MetaData": { "LastUpdatedTime": "2026-03-01T11:00:00Z" }
            })))
            .mount(server)
            .await;
    }

    #[test]
    fn signature_accepts_prefixed_and_bare_hex() {
        let payload = b"{\"events\":[]}";
        let signed = sign(SECRET, payload);
        assert!(verify_signature(SECRET, payload, Some(&signed)).is_ok());

        let bare = signed.trim_start_matches("sha256=");
        assert!(verify_signature(SECRET, payload, Some(bare)).is_ok());
    }

    #[test]
    fn signature_rejects_tampering_and_garbage() {
        let signed = sign(SECRET, b"{\"a\":1}");
        assert!(verify_signature(SECRET, b"{\"a\":2}", Some(&signed)).is_err());
        assert!(verify_signature(b"other", b"{\"a\":1}", Some(&signed)).is_err());
        assert!(verify_signature(SECRET, b"{\"a\":1}", Some("sha256=zz")).is_err());
        assert!(verify_signature(SECRET, b"{\"a\":1}", None).is_err());
    }

    #[test]
    fn parse_accepts_single_event_and_rejects_unknown_resources() {
        let single = br#"{"event_id":"e1","resource_type":"invoice","resourceId":"42"}"#;
        let events = parse_events(single).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].resource, ResourceType::Invoice);
        assert_eq!(events[0].resource_id, "42");

        let unknown = br#"{"events":[{"id":"e1","resource":"vendor","resource_id":"1"}]}"#;
        assert!(matches!(parse_events(unknown), Err(WebhookError::Malformed(_))));
        assert!(matches!(parse_events(br#"{"events":[]}"#), Err(WebhookError::Malformed(_))));
        assert!(matches!(parse_events(b"[1,2]"), Err(WebhookError::Malformed(_))));
    }

    #[tokio::test]
    async fn tampered_body_creates_no_event() {
        let server = MockServer::start().await;
        let store = MemoryStore::new();
        let (receiver, _) = receiver(&server, &store);

        let original = body("evt-1", "customer", "c-1");
        let signature = sign(SECRET, &original);
        let tampered = body("evt-1", "customer", "c-2");

        let err = receiver.receive(&tampered, Some(&signature)).await.unwrap_err();
        assert!(matches!(err, WebhookError::Signature(_)));
        assert!(store.find("evt-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn replay_applies_once() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/customers/c-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "Id": "c-1",
                "MetaData": { "LastUpdatedTime": "2026-03-01T11:00:00Z" }
            })))
            .expect(1)
            .mount(&server)
            .await;
        let store = MemoryStore::new();
        let (receiver, _) = receiver(&server, &store);

        let payload = body("evt-1", "customer", "c-1");
        let signature = sign(SECRET, &payload);

        let first = receiver.receive(&payload, Some(&signature)).await.unwrap();
        let second = receiver.receive(&payload, Some(&signature)).await.unwrap();

        assert_eq!(first.applied, 1);
        assert_eq!(second.replayed, 1);
        assert_eq!(second.applied, 0);
        assert_eq!(store.upsert_history().len(), 1);
        assert!(store.find("evt-1").await.unwrap().unwrap().is_processed());
    }

    #[tokio::test]
    async fn open_circuit_leaves_event_unprocessed_until_sweep() {
        let server = MockServer::start().await;
        serve_customer(&server, "c-1").await;
        let store = MemoryStore::new();
        let (receiver, breakers) = receiver(&server, &store);
        for _ in 0..3 {
            breakers
                .gate(ResourceType::Customer)
                .record_failure(Admission::Allowed, "HTTP 503");
        }

        let payload = body("evt-1", "customer", "c-1");
        let report = receiver
            .receive(&payload, Some(&sign(SECRET, &payload)))
            .await
            .unwrap();
        assert_eq!(report.pending, 1);

        let stored = store.find("evt-1").await.unwrap().unwrap();
        assert!(!stored.is_processed());
        assert_eq!(stored.attempts, 1);
        assert!(stored.last_error.unwrap().contains("circuit open"));

        breakers.gate(ResourceType::Customer).reset();
        let sweep = receiver.sweep_unprocessed(10).await.unwrap();
        assert_eq!(sweep, SweepReport { attempted: 1, applied: 1, failed: 0 });
        assert!(store.find("evt-1").await.unwrap().unwrap().is_processed());
        assert_eq!(store.count(ResourceType::Customer), 1);
    }

    #[tokio::test]
    async fn missing_upstream_record_is_settled_with_a_note() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let store = MemoryStore::new();
        let (receiver, _) = receiver(&server, &store);

        let payload = body("evt-9", "invoice", "gone");
        receiver
            .receive(&payload, Some(&sign(SECRET, &payload)))
            .await
            .unwrap();

        let stored = store.find("evt-9").await.unwrap().unwrap();
        assert!(stored.is_processed());
        assert_eq!(stored.last_error.as_deref(), Some("record not found upstream"));
    }
}
