//! In-memory repository
//!
//! Backs tests and local development where a Postgres instance is not
//! available. Semantics mirror [`SqlRepository`]: close is conditional on
//! the stored status, line items are returned in created_at order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::warn;
use uuid::Uuid;

use tally_common::{Bill, BillStatus, BillingError, LineItem, Result};

use crate::Repository;

/// DashMap-backed repository with SqlRepository semantics
#[derive(Default)]
pub struct MemoryRepository {
    bills: DashMap<Uuid, Bill>,
    line_items: DashMap<Uuid, Vec<LineItem>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored bills.
    pub fn bill_count(&self) -> usize {
        self.bills.len()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn create_bill(&self, bill: &Bill) -> Result<()> {
        if self.bills.contains_key(&bill.id) {
            return Err(BillingError::Storage(format!(
                "duplicate bill id: {}",
                bill.id
            )));
        }
        let mut stored = bill.clone();
        stored.line_items = Vec::new();
        stored.total = None;
        self.bills.insert(stored.id, stored);
        Ok(())
    }

    async fn get_bill_by_id(&self, bill_id: Uuid) -> Result<Bill> {
        let mut bill = self
            .bills
            .get(&bill_id)
            .map(|entry| entry.clone())
            .ok_or(BillingError::BillNotFound)?;
        bill.line_items = self.list_line_items_by_bill_id(bill_id).await?;
        Ok(bill)
    }

    async fn close_bill(&self, bill_id: Uuid, closed_at: DateTime<Utc>) -> Result<bool> {
        let Some(mut bill) = self.bills.get_mut(&bill_id) else {
            warn!(%bill_id, "close requested for unknown bill");
            return Ok(false);
        };
        if bill.status == BillStatus::Closed {
            return Ok(false);
        }
        bill.status = BillStatus::Closed;
        bill.closed_at = Some(closed_at);
        bill.updated_at = Utc::now();
        Ok(true)
    }

    async fn add_line_item(&self, item: &LineItem) -> Result<()> {
        self.line_items
            .entry(item.bill_id)
            .or_default()
            .push(item.clone());
        Ok(())
    }

    async fn list_line_items_by_bill_id(&self, bill_id: Uuid) -> Result<Vec<LineItem>> {
        let mut items = self
            .line_items
            .get(&bill_id)
            .map(|entry| entry.clone())
            .unwrap_or_default();
        items.sort_by_key(|item| item.created_at);
        Ok(items)
    }
}
