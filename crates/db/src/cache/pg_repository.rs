use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row, Transaction};
use tally_common::error::{TallyError, TallyResult};
use tally_common::types::ResourceType;
use uuid::Uuid;

use crate::cache::models::{
    CacheBatch, CacheFilter, CachedCustomer, CachedEntry, CachedInvoice, CachedPayment,
    CachedRecord, CustomerFields, InvoiceFields, PaymentFields,
};
use crate::cache::repositories::CacheRepository;

const CUSTOMER_COLUMNS: &str =
    "external_id, local_id, last_modified, is_active, display_name, email, balance, payload, synced_at";
const INVOICE_COLUMNS: &str = "external_id, local_id, last_modified, is_active, customer_ref, doc_number, \
     total_amount, balance, due_date, status, payload, synced_at";
const PAYMENT_COLUMNS: &str = "external_id, local_id, last_modified, is_active, customer_ref, invoice_ref, \
     amount, txn_date, payload, synced_at";

fn table(resource: ResourceType) -> &'static str {
    match resource {
        ResourceType::Customer => "cached_customers",
        ResourceType::Invoice => "cached_invoices",
        ResourceType::Payment => "cached_payments",
    }
}

fn columns(resource: ResourceType) -> &'static str {
    match resource {
        ResourceType::Customer => CUSTOMER_COLUMNS,
        ResourceType::Invoice => INVOICE_COLUMNS,
        ResourceType::Payment => PAYMENT_COLUMNS,
    }
}

/// Conflict guard shared by all cache upserts: older data never overwrites
/// newer data, and an identical re-delivery touches nothing.
fn merge_guard(table: &str) -> String {
    format!(
        "where excluded.last_modified > {table}.last_modified
            or (excluded.last_modified = {table}.last_modified
                and (excluded.payload is distinct from {table}.payload
                     or ({table}.local_id is null and excluded.local_id is not null)))"
    )
}

fn db_err(e: sqlx::Error) -> TallyError {
    TallyError::Database(e.to_string())
}

#[derive(Clone)]
pub struct PgCacheRepository {
    pool: PgPool,
}

impl PgCacheRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn map_customer(row: &PgRow) -> CachedCustomer {
        CachedRecord {
            external_id: row.get("external_id"),
            local_id: row.get("local_id"),
            last_modified: row.get("last_modified"),
            is_active: row.get("is_active"),
            fields: CustomerFields {
                display_name: row.get("display_name"),
                email: row.get("email"),
                balance: row.get("balance"),
            },
            payload: row.get("payload"),
            synced_at: row.get("synced_at"),
        }
    }

    fn map_invoice(row: &PgRow) -> CachedInvoice {
        CachedRecord {
            external_id: row.get("external_id"),
            local_id: row.get("local_id"),
            last_modified: row.get("last_modified"),
            is_active: row.get("is_active"),
            fields: InvoiceFields {
                customer_ref: row.get("customer_ref"),
                doc_number: row.get("doc_number"),
                total_amount: row.get("total_amount"),
                balance: row.get("balance"),
                due_date: row.get("due_date"),
                status: row.get("status"),
            },
            payload: row.get("payload"),
            synced_at: row.get("synced_at"),
        }
    }

    fn map_payment(row: &PgRow) -> CachedPayment {
        CachedRecord {
            external_id: row.get("external_id"),
            local_id: row.get("local_id"),
            last_modified: row.get("last_modified"),
            is_active: row.get("is_active"),
            fields: PaymentFields {
                customer_ref: row.get("customer_ref"),
                invoice_ref: row.get("invoice_ref"),
                amount: row.get("amount"),
                txn_date: row.get("txn_date"),
            },
            payload: row.get("payload"),
            synced_at: row.get("synced_at"),
        }
    }

    fn map_entry(resource: ResourceType, row: &PgRow) -> CachedEntry {
        match resource {
            ResourceType::Customer => CachedEntry::Customer(Self::map_customer(row)),
            ResourceType::Invoice => CachedEntry::Invoice(Self::map_invoice(row)),
            ResourceType::Payment => CachedEntry::Payment(Self::map_payment(row)),
        }
    }

    async fn upsert_customers(
        tx: &mut Transaction<'_, Postgres>,
        rows: &[CachedCustomer],
    ) -> TallyResult<usize> {
        let sql = format!(
            "insert into cached_customers ({CUSTOMER_COLUMNS})
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             on conflict (external_id) do update set
               local_id = coalesce(cached_customers.local_id, excluded.local_id),
               last_modified = excluded.last_modified,
               is_active = excluded.is_active,
               display_name = excluded.display_name,
               email = excluded.email,
               balance = excluded.balance,
               payload = excluded.payload,
               synced_at = excluded.synced_at
             {}",
            merge_guard("cached_customers")
        );

        let mut changed = 0;
        for row in rows {
            let result = sqlx::query(&sql)
                .bind(&row.external_id)
                .bind(row.local_id)
                .bind(row.last_modified)
                .bind(row.is_active)
                .bind(&row.fields.display_name)
                .bind(&row.fields.email)
                .bind(row.fields.balance)
                .bind(&row.payload)
                .bind(row.synced_at)
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
            changed += result.rows_affected() as usize;
        }
        Ok(changed)
    }

    async fn upsert_invoices(
        tx: &mut Transaction<'_, Postgres>,
        rows: &[CachedInvoice],
    ) -> TallyResult<usize> {
        let sql = format!(
            "insert into cached_invoices ({INVOICE_COLUMNS})
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             on conflict (external_id) do update set
               local_id = coalesce(cached_invoices.local_id, excluded.local_id),
               last_modified = excluded.last_modified,
               is_active = excluded.is_active,
               customer_ref = excluded.customer_ref,
               doc_number = excluded.doc_number,
               total_amount = excluded.total_amount,
               balance = excluded.balance,
               due_date = excluded.due_date,
               status = excluded.status,
               payload = excluded.payload,
               synced_at = excluded.synced_at
             {}",
            merge_guard("cached_invoices")
        );

        let mut changed = 0;
        for row in rows {
            let result = sqlx::query(&sql)
                .bind(&row.external_id)
                .bind(row.local_id)
                .bind(row.last_modified)
                .bind(row.is_active)
                .bind(&row.fields.customer_ref)
                .bind(&row.fields.doc_number)
                .bind(row.fields.total_amount)
                .bind(row.fields.balance)
                .bind(row.fields.due_date)
                .bind(&row.fields.status)
                .bind(&row.payload)
                .bind(row.synced_at)
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
            changed += result.rows_affected() as usize;
        }
        Ok(changed)
    }

    async fn upsert_payments(
        tx: &mut Transaction<'_, Postgres>,
        rows: &[CachedPayment],
    ) -> TallyResult<usize> {
        let sql = format!(
            "insert into cached_payments ({PAYMENT_COLUMNS})
             values ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
             on conflict (external_id) do update set
               local_id = coalesce(cached_payments.local_id, excluded.local_id),
               last_modified = excluded.last_modified,
               is_active = excluded.is_active,
               customer_ref = excluded.customer_ref,
               invoice_ref = excluded.invoice_ref,
               amount = excluded.amount,
               txn_date = excluded.txn_date,
               payload = excluded.payload,
               synced_at = excluded.synced_at
             {}",
            merge_guard("cached_payments")
        );

        let mut changed = 0;
        for row in rows {
            let result = sqlx::query(&sql)
                .bind(&row.external_id)
                .bind(row.local_id)
                .bind(row.last_modified)
                .bind(row.is_active)
                .bind(&row.fields.customer_ref)
                .bind(&row.fields.invoice_ref)
                .bind(row.fields.amount)
                .bind(row.fields.txn_date)
                .bind(&row.payload)
                .bind(row.synced_at)
                .execute(&mut **tx)
                .await
                .map_err(db_err)?;
            changed += result.rows_affected() as usize;
        }
        Ok(changed)
    }
}

#[async_trait]
impl CacheRepository for PgCacheRepository {
    async fn upsert_batch(&self, batch: &CacheBatch) -> TallyResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.map_err(db_err)?;

        let changed = match batch {
            CacheBatch::Customers(rows) => Self::upsert_customers(&mut tx, rows).await?,
            CacheBatch::Invoices(rows) => Self::upsert_invoices(&mut tx, rows).await?,
            CacheBatch::Payments(rows) => Self::upsert_payments(&mut tx, rows).await?,
        };

        tx.commit().await.map_err(db_err)?;
        Ok(changed)
    }

    async fn local_links(
        &self,
        resource: ResourceType,
        external_ids: &[String],
    ) -> TallyResult<HashMap<String, Uuid>> {
        if external_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let sql = format!(
            "select external_id, local_id from {}
             where local_id is not null and external_id = any($1)",
            table(resource)
        );
        let rows = sqlx::query(&sql)
            .bind(external_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(rows
            .iter()
            .map(|r| (r.get::<String, _>("external_id"), r.get::<Uuid, _>("local_id")))
            .collect())
    }

    async fn set_local_link(
        &self,
        resource: ResourceType,
        external_id: &str,
        local_id: Option<Uuid>,
    ) -> TallyResult<()> {
        let sql = format!(
            "update {} set local_id = $1 where external_id = $2",
            table(resource)
        );
        let result = sqlx::query(&sql)
            .bind(local_id)
            .bind(external_id)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(TallyError::NotFound(format!(
                "cached {resource} not found: {external_id}"
            )));
        }
        Ok(())
    }

    async fn get(
        &self,
        resource: ResourceType,
        external_id: &str,
    ) -> TallyResult<Option<CachedEntry>> {
        let sql = format!(
            "select {} from {} where external_id = $1",
            columns(resource),
            table(resource)
        );
        let row = sqlx::query(&sql)
            .bind(external_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;

        Ok(row.map(|r| Self::map_entry(resource, &r)))
    }

    async fn list(
        &self,
        resource: ResourceType,
        filter: CacheFilter,
    ) -> TallyResult<Vec<CachedEntry>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "select {} from {} where true",
            columns(resource),
            table(resource)
        ));

        if let Some(active) = filter.is_active {
            qb.push(" and is_active = ").push_bind(active);
        }
        match filter.linked {
            Some(true) => {
                qb.push(" and local_id is not null");
            }
            Some(false) => {
                qb.push(" and local_id is null");
            }
            None => {}
        }
        if let Some(local_id) = filter.local_id {
            qb.push(" and local_id = ").push_bind(local_id);
        }

        qb.push(" order by last_modified desc, external_id");
        qb.push(" limit ").push_bind(filter.limit.unwrap_or(50));
        qb.push(" offset ").push_bind(filter.offset.unwrap_or(0));

        let rows = qb.build().fetch_all(&self.pool).await.map_err(db_err)?;
        Ok(rows.iter().map(|r| Self::map_entry(resource, r)).collect())
    }
}
