//! # Tally Repository
//!
//! Durable record of bills and line items. While a bill machine is live the
//! repository lags it by at most one activity retry window; after the
//! machine terminates this is the sole source of truth.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use tally_common::config::DatabaseConfig;
use tally_common::{Bill, BillStatus, BillingError, Currency, LineItem, Result};

pub use memory::MemoryRepository;

/// Data persistence interface for bills and line items
#[async_trait]
pub trait Repository: Send + Sync {
    /// Insert a newly opened bill.
    async fn create_bill(&self, bill: &Bill) -> Result<()>;

    /// Fetch a bill with its line items ordered by creation time.
    async fn get_bill_by_id(&self, bill_id: Uuid) -> Result<Bill>;

    /// Set status to closed iff currently open. Returns whether a row was
    /// affected; a second close reports `false` and callers decide what
    /// that means.
    async fn close_bill(&self, bill_id: Uuid, closed_at: DateTime<Utc>) -> Result<bool>;

    /// Unconditional insert; callers guarantee identifier uniqueness.
    async fn add_line_item(&self, item: &LineItem) -> Result<()>;

    /// Line items for a bill, created_at ascending.
    async fn list_line_items_by_bill_id(&self, bill_id: Uuid) -> Result<Vec<LineItem>>;
}

/// Repository backed by Postgres
#[derive(Clone)]
pub struct SqlRepository {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct BillRow {
    id: Uuid,
    customer_id: String,
    status: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    workflow_id: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl BillRow {
    fn into_bill(self, line_items: Vec<LineItem>) -> Result<Bill> {
        Ok(Bill {
            id: self.id,
            customer_id: self.customer_id,
            status: BillStatus::parse(&self.status)?,
            period_start: self.period_start,
            period_end: self.period_end,
            workflow_id: self.workflow_id,
            created_at: self.created_at,
            updated_at: self.updated_at,
            closed_at: self.closed_at,
            line_items,
            total: None,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LineItemRow {
    id: Uuid,
    bill_id: Uuid,
    description: String,
    currency: String,
    quantity: Decimal,
    unit_price: Decimal,
    created_at: DateTime<Utc>,
}

impl From<LineItemRow> for LineItem {
    fn from(row: LineItemRow) -> Self {
        LineItem {
            id: row.id,
            bill_id: row.bill_id,
            description: row.description,
            currency: Currency::new(row.currency.trim()),
            quantity: row.quantity,
            unit_price: row.unit_price,
            created_at: row.created_at,
            total: Decimal::ZERO,
        }
    }
}

fn storage_err(err: sqlx::Error) -> BillingError {
    match err {
        sqlx::Error::RowNotFound => BillingError::BillNotFound,
        other => BillingError::Storage(other.to_string()),
    }
}

impl SqlRepository {
    /// Connect a pool against the configured database.
    #[instrument(skip(cfg))]
    pub async fn connect(cfg: &DatabaseConfig) -> Result<Self> {
        info!(
            max_connections = cfg.max_connections,
            min_connections = cfg.min_connections,
            "connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(cfg.max_connections)
            .min_connections(cfg.min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&cfg.url)
            .await
            .map_err(storage_err)?;

        info!("PostgreSQL connection pool established");
        Ok(Self { pool })
    }

    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply pending migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<()> {
        info!("running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| BillingError::Storage(e.to_string()))?;
        info!("database migrations completed");
        Ok(())
    }
}

#[async_trait]
impl Repository for SqlRepository {
    #[instrument(skip(self, bill), fields(bill_id = %bill.id, customer_id = %bill.customer_id))]
    async fn create_bill(&self, bill: &Bill) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO bills (id, customer_id, status, period_start, period_end, workflow_id, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(bill.id)
        .bind(&bill.customer_id)
        .bind(bill.status.as_str())
        .bind(bill.period_start)
        .bind(bill.period_end)
        .bind(&bill.workflow_id)
        .bind(bill.created_at)
        .bind(bill.updated_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        info!("bill created in database");
        Ok(())
    }

    #[instrument(skip(self), fields(bill_id = %bill_id))]
    async fn get_bill_by_id(&self, bill_id: Uuid) -> Result<Bill> {
        let row = sqlx::query_as::<_, BillRow>(
            r#"
            SELECT id, customer_id, status, period_start, period_end, workflow_id, created_at, updated_at, closed_at
            FROM bills
            WHERE id = $1
            "#,
        )
        .bind(bill_id)
        .fetch_one(&self.pool)
        .await
        .map_err(storage_err)?;

        let line_items = self.list_line_items_by_bill_id(bill_id).await?;
        row.into_bill(line_items)
    }

    #[instrument(skip(self), fields(bill_id = %bill_id))]
    async fn close_bill(&self, bill_id: Uuid, closed_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bills
            SET status = 'closed', closed_at = $1, updated_at = NOW()
            WHERE id = $2 AND status = 'open'
            "#,
        )
        .bind(closed_at)
        .bind(bill_id)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        let affected = result.rows_affected();
        if affected == 0 {
            warn!("no rows affected when closing bill");
            return Ok(false);
        }

        info!(rows_affected = affected, "bill closed in database");
        Ok(true)
    }

    #[instrument(skip(self, item), fields(bill_id = %item.bill_id, line_item_id = %item.id))]
    async fn add_line_item(&self, item: &LineItem) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO line_items (id, bill_id, description, currency, quantity, unit_price, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(item.id)
        .bind(item.bill_id)
        .bind(&item.description)
        .bind(item.currency.as_str())
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.created_at)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        info!("line item persisted");
        Ok(())
    }

    #[instrument(skip(self), fields(bill_id = %bill_id))]
    async fn list_line_items_by_bill_id(&self, bill_id: Uuid) -> Result<Vec<LineItem>> {
        let rows = sqlx::query_as::<_, LineItemRow>(
            r#"
            SELECT id, bill_id, description, currency, quantity, unit_price, created_at
            FROM line_items
            WHERE bill_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(bill_id)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(rows.into_iter().map(LineItem::from).collect())
    }
}
