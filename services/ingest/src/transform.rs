//! Raw accounting records → cache rows.
//!
//! A record that cannot be read (wrong shape, no id, no change time) is
//! skipped and counted; it never aborts the page it came in.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tally_common::types::ResourceType;
use tally_db::cache::models::{
    CacheBatch, CachedCustomer, CachedInvoice, CachedPayment, CachedRecord, CustomerFields,
    InvoiceFields, PaymentFields,
};

use crate::accounting::models::{
    ExternalCustomer, ExternalInvoice, ExternalPayment, RecordHeader,
};

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("malformed {resource} record: {source}")]
    Shape {
        resource: ResourceType,
        #[source]
        source: serde_json::Error,
    },

    #[error("{resource} {id} has no last-modified timestamp")]
    MissingTimestamp { resource: ResourceType, id: String },

    #[error("{resource} record has an empty id")]
    EmptyId { resource: ResourceType },
}

#[derive(Debug)]
pub struct TransformedPage {
    pub batch: CacheBatch,
    pub rejected: usize,
}

/// Transform one page. Accepted rows keep their page order.
pub fn transform_page(
    resource: ResourceType,
    raw: Vec<Value>,
    synced_at: DateTime<Utc>,
) -> TransformedPage {
    let mut batch = CacheBatch::empty(resource);
    let mut rejected = 0;

    for record in raw {
        let result = match &mut batch {
            CacheBatch::Customers(rows) => customer(record, synced_at).map(|r| rows.push(r)),
            CacheBatch::Invoices(rows) => invoice(record, synced_at).map(|r| rows.push(r)),
            CacheBatch::Payments(rows) => payment(record, synced_at).map(|r| rows.push(r)),
        };
        if let Err(e) = result {
            tracing::warn!(%resource, error = %e, "skipping malformed record");
            rejected += 1;
        }
    }

    TransformedPage { batch, rejected }
}

/// Transform a single record fetched by id.
pub fn transform_record(
    resource: ResourceType,
    raw: Value,
    synced_at: DateTime<Utc>,
) -> Result<CacheBatch, TransformError> {
    Ok(match resource {
        ResourceType::Customer => CacheBatch::Customers(vec![customer(raw, synced_at)?]),
        ResourceType::Invoice => CacheBatch::Invoices(vec![invoice(raw, synced_at)?]),
        ResourceType::Payment => CacheBatch::Payments(vec![payment(raw, synced_at)?]),
    })
}

fn decode<T: DeserializeOwned>(resource: ResourceType, raw: &Value) -> Result<T, TransformError> {
    T::deserialize(raw).map_err(|source| TransformError::Shape { resource, source })
}

/// Build the row from the shared header; `fields` carries the promoted columns.
fn row<T>(
    resource: ResourceType,
    header: RecordHeader,
    fields: T,
    payload: Value,
    synced_at: DateTime<Utc>,
) -> Result<CachedRecord<T>, TransformError> {
    let last_modified = header.last_modified();
    let is_active = header.is_active();
    let external_id = header.id.into_string();
    if external_id.trim().is_empty() {
        return Err(TransformError::EmptyId { resource });
    }
    let last_modified = last_modified.ok_or_else(|| TransformError::MissingTimestamp {
        resource,
        id: external_id.clone(),
    })?;

    Ok(CachedRecord {
        external_id,
        local_id: None,
        last_modified,
        is_active,
        fields,
        payload,
        synced_at,
    })
}

fn customer(raw: Value, synced_at: DateTime<Utc>) -> Result<CachedCustomer, TransformError> {
    let resource = ResourceType::Customer;
    let ext: ExternalCustomer = decode(resource, &raw)?;
    let email = ext
        .primary_email
        .and_then(|e| e.address)
        .or(ext.email)
        .filter(|e| !e.trim().is_empty());
    let fields = CustomerFields {
        display_name: ext.display_name,
        email,
        balance: ext.balance,
    };
    row(resource, ext.header, fields, raw, synced_at)
}

fn invoice(raw: Value, synced_at: DateTime<Utc>) -> Result<CachedInvoice, TransformError> {
    let resource = ResourceType::Invoice;
    let ext: ExternalInvoice = decode(resource, &raw)?;
    let status = invoice_status(&ext);
    let fields = InvoiceFields {
        customer_ref: ext.customer_ref.map(|r| r.into_id()),
        doc_number: ext.doc_number,
        total_amount: ext.total_amount,
        balance: ext.balance,
        due_date: ext.due_date,
        status,
    };
    row(resource, ext.header, fields, raw, synced_at)
}

fn payment(raw: Value, synced_at: DateTime<Utc>) -> Result<CachedPayment, TransformError> {
    let resource = ResourceType::Payment;
    let ext: ExternalPayment = decode(resource, &raw)?;
    let fields = PaymentFields {
        invoice_ref: ext.invoice_id(),
        customer_ref: ext.customer_ref.map(|r| r.into_id()),
        amount: ext.amount,
        txn_date: ext.txn_date,
    };
    row(resource, ext.header, fields, raw, synced_at)
}

/// Upstream status if given, otherwise derived from the open balance.
fn invoice_status(ext: &ExternalInvoice) -> Option<String> {
    if let Some(status) = ext.header.status.as_deref() {
        return Some(status.to_ascii_lowercase());
    }
    ext.balance.map(|balance| {
        if balance.is_zero() {
            "paid".to_string()
        } else {
            "open".to_string()
        }
    })
}
