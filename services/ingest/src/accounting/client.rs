use std::sync::Arc;
use std::time::Duration;

use reqwest::{header, Client, StatusCode, Url};
use serde_json::Value;
use tally_common::types::ResourceType;
use tally_config::parse_var_or;

use super::query::{record_url, ChangedSince};
use crate::breaker::{Admission, Breakers, Gate};

#[derive(Debug, Clone)]
pub struct AccountingClientConfig {
    pub base_url: String,
    pub api_token: String,
    pub page_size: usize,
    pub timeout_secs: u64,
}

impl AccountingClientConfig {
    /// Load the accounting API config from environment.
    ///
    /// Returns `Ok(None)` if `ACCOUNTING_BASE_URL` is not set (sync disabled).
    /// Returns `Err` if the base URL is set but the token is missing or a
    /// numeric setting does not parse.
    pub fn from_env() -> Result<Option<Self>, String> {
        let base_url = match std::env::var("ACCOUNTING_BASE_URL").ok() {
            Some(v) if !v.trim().is_empty() => v.trim().to_string(),
            _ => return Ok(None),
        };
        let api_token = std::env::var("ACCOUNTING_API_TOKEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| {
                "ACCOUNTING_API_TOKEN is required when ACCOUNTING_BASE_URL is set".to_string()
            })?;

        let page_size = parse_var_or("ACCOUNTING_PAGE_SIZE", 100usize).map_err(|e| e.to_string())?;
        let timeout_secs =
            parse_var_or("ACCOUNTING_TIMEOUT_SECS", 30u64).map_err(|e| e.to_string())?;

        Ok(Some(Self {
            base_url,
            api_token,
            page_size: page_size.max(1),
            timeout_secs: timeout_secs.max(1),
        }))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("circuit open for {resource}, retry in {}s", .retry_in.as_secs())]
    CircuitOpen {
        resource: ResourceType,
        retry_in: Duration,
    },

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("HTTP {status}: {body}")]
    HttpError { status: StatusCode, body: String },

    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("unexpected response body: {0}")]
    Decode(String),

    #[error("invalid accounting URL: {0}")]
    InvalidUrl(String),
}

impl ClientError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }
}

/// HTTP client for the accounting API. Every request passes through the
/// breaker of the resource it targets; nothing here retries or sleeps.
#[derive(Clone)]
pub struct AccountingClient {
    client: Client,
    base_url: Url,
    config: AccountingClientConfig,
    breakers: Arc<Breakers>,
}

impl AccountingClient {
    pub fn new(config: AccountingClientConfig, breakers: Arc<Breakers>) -> Result<Self, ClientError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| ClientError::InvalidUrl(format!("{}: {e}", config.base_url)))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url,
            config,
            breakers,
        })
    }

    pub fn breakers(&self) -> &Arc<Breakers> {
        &self.breakers
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Start a fresh page cursor over records changed at or after `query.since`.
    pub fn changed_since(&self, query: ChangedSince) -> PageCursor<'_> {
        PageCursor {
            client: self,
            query,
            start_position: 1,
            exhausted: false,
        }
    }

    /// Fetch one record by id. `Ok(None)` when the platform answers 404.
    pub async fn get_record(
        &self,
        resource: ResourceType,
        id: &str,
    ) -> Result<Option<Value>, ClientError> {
        let url = record_url(&self.base_url, resource, id).map_err(ClientError::InvalidUrl)?;
        match self.guarded_get(resource, url).await? {
            Some(body) => Ok(Some(unwrap_item(body))),
            None => Ok(None),
        }
    }

    /// One GET through the breaker. 404 maps to `Ok(None)`.
    ///
    /// 429, 5xx and transport errors count as breaker failures. Any other
    /// answer means the platform is up and counts as a success, even when the
    /// request itself was rejected.
    async fn guarded_get(
        &self,
        resource: ResourceType,
        url: Url,
    ) -> Result<Option<Value>, ClientError> {
        let gate = self.breakers.gate(resource);
        let admission = gate.allow();
        if let Admission::Denied { retry_in } = admission {
            tracing::debug!(%resource, retry_in_secs = retry_in.as_secs(), "circuit open, not calling upstream");
            return Err(ClientError::CircuitOpen { resource, retry_in });
        }

        let response = match self
            .client
            .get(url)
            .bearer_auth(&self.config.api_token)
            .header(header::ACCEPT, "application/json")
            .send()
            .await
        {
            Ok(resp) => resp,
            Err(e) => {
                gate.record_failure(admission, &e.to_string());
                return Err(ClientError::RequestError(e));
            }
        };

        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            gate.record_failure(admission, "429 Too Many Requests");
            tracing::warn!(%resource, ?retry_after, "rate limited by accounting API");
            return Err(ClientError::RateLimited { retry_after });
        }

        if status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            gate.record_failure(admission, &format!("HTTP {status}"));
            return Err(ClientError::HttpError { status, body });
        }

        if status == StatusCode::NOT_FOUND {
            gate.record_success(admission);
            return Ok(None);
        }

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            gate.record_success(admission);
            return Err(ClientError::HttpError { status, body });
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) => {
                gate.record_failure(admission, &e.to_string());
                return Err(ClientError::RequestError(e));
            }
        };
        gate.record_success(admission);

        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| ClientError::Decode(e.to_string()))
    }
}

/// A finite, forward-only walk over the pages of one `ChangedSince` query.
/// A new sync always starts a new cursor from the stored watermark.
pub struct PageCursor<'a> {
    client: &'a AccountingClient,
    query: ChangedSince,
    start_position: usize,
    exhausted: bool,
}

impl PageCursor<'_> {
    pub fn query(&self) -> &ChangedSince {
        &self.query
    }

    /// The next non-empty page, or `None` once the listing is exhausted.
    /// A short page is the last one.
    pub async fn next_page(&mut self) -> Result<Option<Vec<Value>>, ClientError> {
        if self.exhausted {
            return Ok(None);
        }

        let url = self
            .query
            .page_url(&self.client.base_url, self.start_position)
            .map_err(ClientError::InvalidUrl)?;
        let body = self
            .client
            .guarded_get(self.query.resource, url)
            .await?
            .ok_or_else(|| ClientError::HttpError {
                status: StatusCode::NOT_FOUND,
                body: format!("no listing for {}", self.query.resource.collection()),
            })?;

        let page = unwrap_items(body)?;
        if page.len() < self.query.page_size {
            self.exhausted = true;
        } else {
            self.start_position += self.query.page_size;
        }

        tracing::debug!(
            resource = %self.query.resource,
            count = page.len(),
            start_position = self.start_position,
            "fetched page"
        );

        if page.is_empty() {
            return Ok(None);
        }
        Ok(Some(page))
    }
}

/// Page bodies come as a bare array or as `{ "items": [...] }`.
fn unwrap_items(body: Value) -> Result<Vec<Value>, ClientError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove("items") {
            Some(Value::Array(items)) => Ok(items),
            Some(Value::Null) => Ok(Vec::new()),
            _ => Err(ClientError::Decode(
                "expected an array or an object with an \"items\" array".to_string(),
            )),
        },
        other => Err(ClientError::Decode(format!(
            "expected a page of records, got {}",
            kind(&other)
        ))),
    }
}

/// Single-record bodies come bare or as `{ "item": {...} }`.
fn unwrap_item(body: Value) -> Value {
    match body {
        Value::Object(mut map) if map.len() == 1 && map.contains_key("item") => {
            map.remove("item").unwrap_or(Value::Null)
        }
        other => other,
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitState};
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(base_url: &str) -> AccountingClientConfig {
        AccountingClientConfig {
            base_url: base_url.to_string(),
            api_token: "test-token".to_string(),
            page_size: 2,
            timeout_secs: 5,
        }
    }

    fn test_client(server: &MockServer) -> AccountingClient {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
        let breakers = Arc::new(Breakers::new(BreakerConfig::default(), Arc::new(clock)));
        AccountingClient::new(test_config(&server.uri()), breakers).unwrap()
    }

    fn records(ids: &[&str]) -> Vec<Value> {
        ids.iter()
            .map(|id| serde_json::json!({ "Id": id, "MetaData": { "LastUpdatedTime": "2026-03-01T08:00:00Z" } }))
            .collect()
    }

    fn since() -> ChangedSince {
        ChangedSince::new(
            ResourceType::Invoice,
            Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).unwrap(),
            2,
        )
    }

    async fn drain(cursor: &mut PageCursor<'_>) -> Result<Vec<Vec<Value>>, ClientError> {
        let mut pages = Vec::new();
        while let Some(page) = cursor.next_page().await? {
            pages.push(page);
        }
        Ok(pages)
    }

    #[tokio::test]
    async fn pages_until_short_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices"))
            .and(query_param("changed_since", "2026-03-01T06:00:00Z"))
            .and(query_param("start_position", "1"))
            .and(query_param("max_results", "2"))
            .and(header("authorization", "Bearer test-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(records(&["1", "2"])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices"))
            .and(query_param("start_position", "3"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "items": records(&["3"]) })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let mut cursor = client.changed_since(since());
        let pages = drain(&mut cursor).await.unwrap();

        assert_eq!(pages.len(), 2);
        assert_eq!(pages[0].len(), 2);
        assert_eq!(pages[1][0]["Id"], "3");
    }

    #[tokio::test]
    async fn full_last_page_ends_with_empty_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices"))
            .and(query_param("start_position", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(records(&["1", "2"])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices"))
            .and(query_param("start_position", "3"))
            .respond_with(ResponseTemplate::new(200).set_body_json(Vec::<Value>::new()))
            .expect(1)
            .mount(&server)
            .await;

        let client = test_client(&server);
        let pages = drain(&mut client.changed_since(since())).await.unwrap();
        assert_eq!(pages.len(), 1);
    }

    #[tokio::test]
    async fn server_errors_trip_only_their_own_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .expect(3)
            .mount(&server)
            .await;

        let client = test_client(&server);
        for _ in 0..3 {
            let err = client
                .changed_since(since())
                .next_page()
                .await
                .unwrap_err();
            assert!(matches!(err, ClientError::HttpError { status, .. } if status == StatusCode::SERVICE_UNAVAILABLE));
        }

        // Fourth call fails fast without reaching the server (expect(3) above).
        let err = client.changed_since(since()).next_page().await.unwrap_err();
        assert!(err.is_circuit_open(), "got: {err:?}");
        assert_eq!(
            client.breakers().gate(ResourceType::Invoice).status().state,
            CircuitState::Open
        );
        assert_eq!(
            client.breakers().gate(ResourceType::Customer).status().state,
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn rate_limit_is_a_failure_and_not_slept_on() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices"))
            .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "120"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client.changed_since(since()).next_page().await.unwrap_err();
        match err {
            ClientError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Some(Duration::from_secs(120)));
            }
            other => panic!("expected RateLimited, got: {other:?}"),
        }
        assert_eq!(
            client
                .breakers()
                .gate(ResourceType::Invoice)
                .status()
                .consecutive_failures,
            1
        );
    }

    #[tokio::test]
    async fn client_errors_do_not_trip_the_breaker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad changed_since"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        for _ in 0..5 {
            let err = client.changed_since(since()).next_page().await.unwrap_err();
            assert!(matches!(err, ClientError::HttpError { status, .. } if status == StatusCode::BAD_REQUEST));
        }
        let status = client.breakers().gate(ResourceType::Invoice).status();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn get_record_not_found_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/customers/404-me"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let record = client
            .get_record(ResourceType::Customer, "404-me")
            .await
            .unwrap();
        assert!(record.is_none());
    }

    #[tokio::test]
    async fn get_record_unwraps_item_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/payments/p-1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "item": { "Id": "p-1" } })),
            )
            .mount(&server)
            .await;

        let client = test_client(&server);
        let record = client
            .get_record(ResourceType::Payment, "p-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record["Id"], "p-1");
    }

    #[tokio::test]
    async fn undecodable_page_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/invoices"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>login</html>"))
            .mount(&server)
            .await;

        let client = test_client(&server);
        let err = client.changed_since(since()).next_page().await.unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)), "got: {err:?}");
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let breakers = Arc::new(Breakers::new(
            BreakerConfig::default(),
            Arc::new(ManualClock::new(Utc::now())),
        ));
        let result = AccountingClient::new(test_config("not a url"), breakers);
        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }
}
