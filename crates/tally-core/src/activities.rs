//! Billing activities
//!
//! The side effects a bill machine drives against the repository. Each is
//! invoked through [`crate::runtime::execute_activity`], which owns the
//! retry discipline; the methods here are single attempts.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use tally_common::{Bill, LineItem, Result};
use tally_repository::Repository;

pub struct BillingActivities {
    repository: Arc<dyn Repository>,
}

impl BillingActivities {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// Persist the newly opened bill.
    #[instrument(skip(self, bill), fields(bill_id = %bill.id))]
    pub async fn save_bill(&self, bill: &Bill) -> Result<()> {
        self.repository.create_bill(bill).await?;
        info!("bill saved");
        Ok(())
    }

    /// Persist a single line item.
    #[instrument(skip(self, item), fields(bill_id = %item.bill_id, line_item_id = %item.id))]
    pub async fn add_line_item_to_bill(&self, item: &LineItem) -> Result<()> {
        self.repository.add_line_item(item).await?;
        info!("line item persisted");
        Ok(())
    }

    /// Flip the persisted status and return the refreshed record.
    #[instrument(skip(self), fields(bill_id = %bill_id))]
    pub async fn close_bill(&self, bill_id: Uuid, closed_at: DateTime<Utc>) -> Result<Bill> {
        let affected = self.repository.close_bill(bill_id, closed_at).await?;
        if !affected {
            warn!("bill was already closed in the repository");
        }
        self.repository.get_bill_by_id(bill_id).await
    }
}
