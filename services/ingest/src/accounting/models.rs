//! Wire shapes of the accounting API.
//!
//! The platform is inconsistent across endpoints and API versions: field names
//! come in both `PascalCase` and `snake_case`, ids as strings or numbers, and
//! references as `{ "value": .. }` objects or bare ids. These types accept all
//! of them; anything they cannot read is rejected by the transform step.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ExternalId {
    Text(String),
    Number(i64),
}

impl ExternalId {
    pub fn into_string(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Number(n) => n.to_string(),
        }
    }
}

/// A reference to another record: `{ "value": "42", "name": ".." }` or `"42"`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum ExternalRef {
    Object {
        #[serde(alias = "Value")]
        value: ExternalId,
    },
    Bare(ExternalId),
}

impl ExternalRef {
    pub fn into_id(self) -> String {
        match self {
            Self::Object { value } | Self::Bare(value) => value.into_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetaData {
    #[serde(rename = "LastUpdatedTime", alias = "last_updated_time")]
    pub last_updated_time: Option<DateTime<Utc>>,
}

/// Fields shared by every resource: identity, change time, activity.
#[derive(Debug, Clone, Deserialize)]
pub struct RecordHeader {
    #[serde(rename = "Id", alias = "id")]
    pub id: ExternalId,
    #[serde(rename = "MetaData", alias = "meta_data", alias = "metadata", default)]
    pub meta: Option<MetaData>,
    #[serde(rename = "updated_at", alias = "UpdatedAt", alias = "LastUpdatedTime", default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(rename = "Active", alias = "active", default)]
    pub active: Option<bool>,
    /// Change-feed status; `Deleted`/`Voided` mark the record inactive.
    #[serde(rename = "status", alias = "Status", default)]
    pub status: Option<String>,
}

impl RecordHeader {
    pub fn last_modified(&self) -> Option<DateTime<Utc>> {
        self.meta
            .as_ref()
            .and_then(|m| m.last_updated_time)
            .or(self.updated_at)
    }

    pub fn is_active(&self) -> bool {
        let tombstoned = self
            .status
            .as_deref()
            .map(|s| s.eq_ignore_ascii_case("deleted") || s.eq_ignore_ascii_case("voided"))
            .unwrap_or(false);
        self.active.unwrap_or(true) && !tombstoned
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailAddress {
    #[serde(rename = "Address", alias = "address")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalCustomer {
    #[serde(flatten)]
    pub header: RecordHeader,
    #[serde(rename = "DisplayName", alias = "display_name", default)]
    pub display_name: Option<String>,
    #[serde(rename = "PrimaryEmailAddr", alias = "primary_email_addr", default)]
    pub primary_email: Option<EmailAddress>,
    #[serde(rename = "email", alias = "Email", default)]
    pub email: Option<String>,
    #[serde(rename = "Balance", alias = "balance", default)]
    pub balance: Option<Decimal>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalInvoice {
    #[serde(flatten)]
    pub header: RecordHeader,
    #[serde(rename = "CustomerRef", alias = "customer_ref", alias = "customer_id", default)]
    pub customer_ref: Option<ExternalRef>,
    #[serde(rename = "DocNumber", alias = "doc_number", default)]
    pub doc_number: Option<String>,
    #[serde(rename = "TotalAmt", alias = "total_amount", alias = "total", default)]
    pub total_amount: Option<Decimal>,
    #[serde(rename = "Balance", alias = "balance", default)]
    pub balance: Option<Decimal>,
    #[serde(rename = "DueDate", alias = "due_date", default)]
    pub due_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinkedTxn {
    #[serde(rename = "TxnId", alias = "txn_id")]
    pub txn_id: ExternalId,
    #[serde(rename = "TxnType", alias = "txn_type", default)]
    pub txn_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaymentLine {
    #[serde(rename = "LinkedTxn", alias = "linked_txn", default)]
    pub linked_txn: Vec<LinkedTxn>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExternalPayment {
    #[serde(flatten)]
    pub header: RecordHeader,
    #[serde(rename = "CustomerRef", alias = "customer_ref", alias = "customer_id", default)]
    pub customer_ref: Option<ExternalRef>,
    #[serde(rename = "InvoiceRef", alias = "invoice_ref", alias = "invoice_id", default)]
    pub invoice_ref: Option<ExternalRef>,
    #[serde(rename = "Line", alias = "line", alias = "lines", default)]
    pub lines: Vec<PaymentLine>,
    #[serde(rename = "TotalAmt", alias = "amount", alias = "total_amount", default)]
    pub amount: Option<Decimal>,
    #[serde(rename = "TxnDate", alias = "txn_date", default)]
    pub txn_date: Option<NaiveDate>,
}

impl ExternalPayment {
    /// The invoice this payment settles: an explicit reference, or the first
    /// linked transaction of type `Invoice`.
    pub fn invoice_id(&self) -> Option<String> {
        if let Some(r) = &self.invoice_ref {
            return Some(r.clone().into_id());
        }
        self.lines
            .iter()
            .flat_map(|line| line.linked_txn.iter())
            .find(|txn| {
                txn.txn_type
                    .as_deref()
                    .map(|t| t.eq_ignore_ascii_case("invoice"))
                    .unwrap_or(false)
            })
            .map(|txn| txn.txn_id.clone().into_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::prelude::FromPrimitive;

    #[test]
    fn deserialize_pascal_case_customer() {
        let json = serde_json::json!({
            "Id": "58",
            "DisplayName": "Harbor Builders",
            "PrimaryEmailAddr": { "Address": "ap@harbor.example" },
            "Balance": 1250.5,
            "Active": true,
            "MetaData": { "LastUpdatedTime": "2026-03-01T09:15:00-08:00" }
        });
        let customer: ExternalCustomer = serde_json::from_value(json).unwrap();
        assert_eq!(customer.header.id, ExternalId::Text("58".to_string()));
        assert_eq!(
            customer.header.last_modified().unwrap().to_rfc3339(),
            "2026-03-01T17:15:00+00:00"
        );
        assert_eq!(customer.balance, Decimal::from_f64(1250.5));
        assert!(customer.header.is_active());
    }

    #[test]
    fn deserialize_snake_case_invoice_with_numeric_ids() {
        let json = serde_json::json!({
            "id": 1042,
            "customer_ref": 58,
            "doc_number": "INV-1042",
            "total_amount": 980,
            "due_date": "2026-04-01",
            "updated_at": "2026-03-02T10:00:00Z"
        });
        let invoice: ExternalInvoice = serde_json::from_value(json).unwrap();
        assert_eq!(invoice.header.id.clone().into_string(), "1042");
        assert_eq!(invoice.customer_ref.unwrap().into_id(), "58");
        assert_eq!(
            invoice.due_date,
            Some(NaiveDate::from_ymd_opt(2026, 4, 1).unwrap())
        );
    }

    #[test]
    fn payment_invoice_from_linked_txn() {
        let json = serde_json::json!({
            "Id": "p-9",
            "Line": [
                { "LinkedTxn": [{ "TxnId": "cm-1", "TxnType": "CreditMemo" }] },
                { "LinkedTxn": [{ "TxnId": "1042", "TxnType": "Invoice" }] }
            ],
            "TotalAmt": 100
        });
        let payment: ExternalPayment = serde_json::from_value(json).unwrap();
        assert_eq!(payment.invoice_id().as_deref(), Some("1042"));
    }

    #[test]
    fn deleted_status_marks_inactive() {
        let json = serde_json::json!({ "Id": "7", "status": "Deleted" });
        let header: RecordHeader = serde_json::from_value(json).unwrap();
        assert!(!header.is_active());
        assert!(header.last_modified().is_none());
    }

    #[test]
    fn missing_id_is_rejected() {
        let json = serde_json::json!({ "DisplayName": "No id" });
        assert!(serde_json::from_value::<ExternalCustomer>(json).is_err());
    }
}
