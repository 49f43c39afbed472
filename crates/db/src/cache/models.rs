use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tally_common::types::ResourceType;
use uuid::Uuid;

/// A local mirror of one accounting-platform record, keyed by the platform's
/// own identifier.
///
/// `local_id` is the only locally owned column: it links the row to a portal
/// entity (a client) and survives every upsert. Everything else, including the
/// promoted `fields` and the raw `payload`, belongs to the accounting platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord<T> {
    pub external_id: String,
    pub local_id: Option<Uuid>,
    pub last_modified: DateTime<Utc>,
    pub is_active: bool,
    #[serde(flatten)]
    pub fields: T,
    pub payload: serde_json::Value,
    pub synced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerFields {
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub balance: Option<Decimal>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvoiceFields {
    pub customer_ref: Option<String>,
    pub doc_number: Option<String>,
    pub total_amount: Option<Decimal>,
    pub balance: Option<Decimal>,
    pub due_date: Option<NaiveDate>,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentFields {
    pub customer_ref: Option<String>,
    pub invoice_ref: Option<String>,
    pub amount: Option<Decimal>,
    pub txn_date: Option<NaiveDate>,
}

pub type CachedCustomer = CachedRecord<CustomerFields>;
pub type CachedInvoice = CachedRecord<InvoiceFields>;
pub type CachedPayment = CachedRecord<PaymentFields>;

/// A batch of records of a single resource type, written in one transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheBatch {
    Customers(Vec<CachedCustomer>),
    Invoices(Vec<CachedInvoice>),
    Payments(Vec<CachedPayment>),
}

impl CacheBatch {
    pub fn empty(resource: ResourceType) -> Self {
        match resource {
            ResourceType::Customer => Self::Customers(Vec::new()),
            ResourceType::Invoice => Self::Invoices(Vec::new()),
            ResourceType::Payment => Self::Payments(Vec::new()),
        }
    }

    pub fn resource(&self) -> ResourceType {
        match self {
            Self::Customers(_) => ResourceType::Customer,
            Self::Invoices(_) => ResourceType::Invoice,
            Self::Payments(_) => ResourceType::Payment,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Customers(rows) => rows.len(),
            Self::Invoices(rows) => rows.len(),
            Self::Payments(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn external_ids(&self) -> Vec<String> {
        match self {
            Self::Customers(rows) => rows.iter().map(|r| r.external_id.clone()).collect(),
            Self::Invoices(rows) => rows.iter().map(|r| r.external_id.clone()).collect(),
            Self::Payments(rows) => rows.iter().map(|r| r.external_id.clone()).collect(),
        }
    }

    pub fn max_last_modified(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Customers(rows) => rows.iter().map(|r| r.last_modified).max(),
            Self::Invoices(rows) => rows.iter().map(|r| r.last_modified).max(),
            Self::Payments(rows) => rows.iter().map(|r| r.last_modified).max(),
        }
    }

    /// External ids of the parent records this batch links through
    /// (customer refs for invoices, invoice refs for payments).
    pub fn parent_refs(&self) -> Vec<String> {
        let mut refs: Vec<String> = match self {
            Self::Customers(_) => Vec::new(),
            Self::Invoices(rows) => rows
                .iter()
                .filter_map(|r| r.fields.customer_ref.clone())
                .collect(),
            Self::Payments(rows) => rows
                .iter()
                .filter_map(|r| r.fields.invoice_ref.clone())
                .collect(),
        };
        refs.sort();
        refs.dedup();
        refs
    }

    /// Fill `local_id` on rows that lack one from their parent's link.
    pub fn apply_parent_links(&mut self, links: &std::collections::HashMap<String, Uuid>) {
        match self {
            Self::Customers(_) => {}
            Self::Invoices(rows) => {
                for row in rows.iter_mut().filter(|r| r.local_id.is_none()) {
                    row.local_id = row
                        .fields
                        .customer_ref
                        .as_ref()
                        .and_then(|r| links.get(r).copied());
                }
            }
            Self::Payments(rows) => {
                for row in rows.iter_mut().filter(|r| r.local_id.is_none()) {
                    row.local_id = row
                        .fields
                        .invoice_ref
                        .as_ref()
                        .and_then(|r| links.get(r).copied());
                }
            }
        }
    }
}

/// A cached row of any resource type, as returned by the read contract.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum CachedEntry {
    Customer(CachedCustomer),
    Invoice(CachedInvoice),
    Payment(CachedPayment),
}

impl CachedEntry {
    pub fn external_id(&self) -> &str {
        match self {
            Self::Customer(r) => &r.external_id,
            Self::Invoice(r) => &r.external_id,
            Self::Payment(r) => &r.external_id,
        }
    }

    pub fn local_id(&self) -> Option<Uuid> {
        match self {
            Self::Customer(r) => r.local_id,
            Self::Invoice(r) => r.local_id,
            Self::Payment(r) => r.local_id,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            Self::Customer(r) => r.is_active,
            Self::Invoice(r) => r.is_active,
            Self::Payment(r) => r.is_active,
        }
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        match self {
            Self::Customer(r) => r.last_modified,
            Self::Invoice(r) => r.last_modified,
            Self::Payment(r) => r.last_modified,
        }
    }
}

/// Read-side filter for downstream CRUD queries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheFilter {
    pub is_active: Option<bool>,
    /// `Some(true)` keeps rows with a local link, `Some(false)` rows without.
    pub linked: Option<bool>,
    pub local_id: Option<Uuid>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl CacheFilter {
    pub fn matches(&self, entry: &CachedEntry) -> bool {
        if let Some(active) = self.is_active {
            if entry.is_active() != active {
                return false;
            }
        }
        if let Some(linked) = self.linked {
            if entry.local_id().is_some() != linked {
                return false;
            }
        }
        if let Some(local_id) = self.local_id {
            if entry.local_id() != Some(local_id) {
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::collections::HashMap;

    fn invoice(id: &str, customer: Option<&str>, local: Option<Uuid>) -> CachedInvoice {
        CachedRecord {
            external_id: id.to_string(),
            local_id: local,
            last_modified: Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
            is_active: true,
            fields: InvoiceFields {
                customer_ref: customer.map(str::to_string),
                ..Default::default()
            },
            payload: serde_json::json!({ "Id": id }),
            synced_at: Utc::now(),
        }
    }

    #[test]
    fn parent_refs_are_deduplicated() {
        let batch = CacheBatch::Invoices(vec![
            invoice("1", Some("c-2"), None),
            invoice("2", Some("c-1"), None),
            invoice("3", Some("c-2"), None),
            invoice("4", None, None),
        ]);
        assert_eq!(batch.parent_refs(), vec!["c-1", "c-2"]);
    }

    #[test]
    fn parent_links_do_not_replace_existing_links() {
        let existing = Uuid::new_v4();
        let resolved = Uuid::new_v4();
        let mut links = HashMap::new();
        links.insert("c-1".to_string(), resolved);

        let mut batch = CacheBatch::Invoices(vec![
            invoice("1", Some("c-1"), None),
            invoice("2", Some("c-1"), Some(existing)),
            invoice("3", Some("c-9"), None),
        ]);
        batch.apply_parent_links(&links);

        let CacheBatch::Invoices(rows) = batch else {
            panic!("batch changed type");
        };
        assert_eq!(rows[0].local_id, Some(resolved));
        assert_eq!(rows[1].local_id, Some(existing));
        assert_eq!(rows[2].local_id, None);
    }

    #[test]
    fn filter_by_link_state() {
        let linked = CachedEntry::Invoice(invoice("1", None, Some(Uuid::new_v4())));
        let unlinked = CachedEntry::Invoice(invoice("2", None, None));

        let filter = CacheFilter {
            linked: Some(false),
            ..Default::default()
        };
        assert!(!filter.matches(&linked));
        assert!(filter.matches(&unlinked));
    }

    #[test]
    fn entry_serializes_promoted_fields_flat() {
        let entry = CachedEntry::Invoice(invoice("inv-7", Some("c-1"), None));
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["external_id"], "inv-7");
        assert_eq!(json["customer_ref"], "c-1");
        assert!(json.get("fields").is_none());
    }
}
