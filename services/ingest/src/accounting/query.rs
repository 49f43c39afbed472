use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Url;
use tally_common::types::ResourceType;

/// "Everything of this type changed at or after `since`", one page of
/// `page_size` records at a time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedSince {
    pub resource: ResourceType,
    pub since: DateTime<Utc>,
    pub page_size: usize,
}

impl ChangedSince {
    pub fn new(resource: ResourceType, since: DateTime<Utc>, page_size: usize) -> Self {
        Self {
            resource,
            since,
            page_size: page_size.max(1),
        }
    }

    /// `{base}/v1/{collection}?changed_since=..&start_position=..&max_results=..`
    ///
    /// `start_position` is 1-based. The timestamp is truncated to whole
    /// seconds, which only widens the inclusive window.
    pub fn page_url(&self, base: &Url, start_position: usize) -> Result<Url, String> {
        let mut url = collection_url(base, self.resource)?;
        url.query_pairs_mut()
            .append_pair(
                "changed_since",
                &self.since.to_rfc3339_opts(SecondsFormat::Secs, true),
            )
            .append_pair("start_position", &start_position.to_string())
            .append_pair("max_results", &self.page_size.to_string());
        Ok(url)
    }
}

/// `{base}/v1/{collection}/{id}` with the id percent-encoded as one segment.
pub fn record_url(base: &Url, resource: ResourceType, id: &str) -> Result<Url, String> {
    let mut url = collection_url(base, resource)?;
    url.path_segments_mut()
        .map_err(|_| format!("base URL cannot carry a path: {base}"))?
        .push(id);
    Ok(url)
}

fn collection_url(base: &Url, resource: ResourceType) -> Result<Url, String> {
    let mut url = base.clone();
    url.set_query(None);
    url.path_segments_mut()
        .map_err(|_| format!("base URL cannot carry a path: {base}"))?
        .pop_if_empty()
        .push("v1")
        .push(resource.collection());
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn base() -> Url {
        Url::parse("https://books.example.com/api/").unwrap()
    }

    #[test]
    fn first_page_url() {
        let since = Utc.with_ymd_and_hms(2026, 3, 1, 6, 0, 0).unwrap();
        let query = ChangedSince::new(ResourceType::Invoice, since, 100);
        let url = query.page_url(&base(), 1).unwrap();
        assert_eq!(
            url.as_str(),
            "https://books.example.com/api/v1/invoices?changed_since=2026-03-01T06%3A00%3A00Z&start_position=1&max_results=100"
        );
    }

    #[test]
    fn epoch_watermark_renders_as_1970() {
        let query = ChangedSince::new(ResourceType::Customer, DateTime::<Utc>::default(), 50);
        let url = query.page_url(&base(), 51).unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert_eq!(pairs[0].1, "1970-01-01T00:00:00Z");
        assert_eq!(pairs[1].1, "51");
    }

    #[test]
    fn zero_page_size_is_clamped() {
        let query = ChangedSince::new(ResourceType::Payment, Utc::now(), 0);
        assert_eq!(query.page_size, 1);
    }

    #[test]
    fn record_id_is_escaped() {
        let url = record_url(&base(), ResourceType::Customer, "a/b c").unwrap();
        assert_eq!(
            url.as_str(),
            "https://books.example.com/api/v1/customers/a%2Fb%20c"
        );
    }

    #[test]
    fn base_without_trailing_slash() {
        let base = Url::parse("http://127.0.0.1:9000").unwrap();
        let url = record_url(&base, ResourceType::Payment, "77").unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:9000/v1/payments/77");
    }
}
