//! Durable bill machine
//!
//! One instance per bill. The machine owns the authoritative open/closed
//! state while it is live: it persists the opened bill, absorbs
//! add-line-item and close-bill signals, fires a timer at period end, and
//! drives the persistence activities. The selection loop processes exactly
//! one stimulus at a time; it exits as soon as the in-memory bill is
//! closed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use tally_common::{Bill, BillingError, LineItem, Result};

use crate::activities::BillingActivities;
use crate::runtime::{execute_activity, ActivityOptions, Clock};

/// External stimuli delivered into a machine instance
#[derive(Debug, Clone)]
pub enum MachineSignal {
    AddLineItem(LineItem),
    CloseBill { requested_at: DateTime<Utc> },
}

pub struct BillMachine {
    bill: Bill,
    activities: Arc<BillingActivities>,
    options: ActivityOptions,
    clock: Arc<dyn Clock>,
}

impl BillMachine {
    pub fn new(
        bill: Bill,
        activities: Arc<BillingActivities>,
        options: ActivityOptions,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            bill,
            activities,
            options,
            clock,
        }
    }

    /// Initial bill snapshot, before the machine has run.
    pub fn bill(&self) -> &Bill {
        &self.bill
    }

    pub(crate) async fn run(
        mut self,
        mut signals: mpsc::UnboundedReceiver<MachineSignal>,
        snapshot: watch::Sender<Bill>,
    ) -> Result<()> {
        info!(bill_id = %self.bill.id, "starting bill machine");

        // save_bill must succeed before anything else; exhaustion aborts
        // the whole instance.
        let activities = Arc::clone(&self.activities);
        let bill = self.bill.clone();
        execute_activity(&self.options, "save_bill", || {
            let activities = Arc::clone(&activities);
            let bill = bill.clone();
            async move { activities.save_bill(&bill).await }
        })
        .await?;
        snapshot.send_replace(self.bill.clone());

        let delta = (self.bill.period_end - self.clock.now())
            .to_std()
            .unwrap_or_default();
        let timer = tokio::time::sleep(delta);
        tokio::pin!(timer);
        let mut timer_fired = false;

        while !self.bill.is_closed() {
            tokio::select! {
                maybe_signal = signals.recv() => match maybe_signal {
                    Some(MachineSignal::AddLineItem(item)) => {
                        info!(line_item_id = %item.id, "received add line item signal");
                        self.handle_add_line_item(item, &snapshot).await;
                    }
                    Some(MachineSignal::CloseBill { requested_at }) => {
                        info!("received close bill signal");
                        self.handle_close(requested_at, &snapshot).await;
                    }
                    None => {
                        error!(bill_id = %self.bill.id, "signal channel closed before bill closed");
                        return Err(BillingError::Internal(
                            "signal channel closed before bill closed".into(),
                        ));
                    }
                },
                _ = &mut timer, if !timer_fired => {
                    timer_fired = true;
                    info!("billing period ended, automatically closing bill");
                    let now = self.clock.now();
                    self.handle_close(now, &snapshot).await;
                }
            }
        }

        info!(bill_id = %self.bill.id, "bill machine completed");
        Ok(())
    }

    async fn handle_add_line_item(&mut self, item: LineItem, snapshot: &watch::Sender<Bill>) {
        if !self.bill.add_line_item(item.clone()) {
            warn!(line_item_id = %item.id, "bill is closed, dropping line item signal");
            return;
        }
        snapshot.send_replace(self.bill.clone());

        let activities = Arc::clone(&self.activities);
        let persist_item = item.clone();
        let result = execute_activity(&self.options, "add_line_item_to_bill", || {
            let activities = Arc::clone(&activities);
            let item = persist_item.clone();
            async move { activities.add_line_item_to_bill(&item).await }
        })
        .await;

        if let Err(e) = result {
            // Compensate so machine memory never diverges from the
            // repository: the item is removed rather than kept in a state
            // that would vanish at termination.
            error!(
                line_item_id = %item.id,
                error = %e,
                "failed to persist line item, removing from bill"
            );
            self.bill.remove_line_item(item.id);
            snapshot.send_replace(self.bill.clone());
        }
    }

    async fn handle_close(&mut self, requested_at: DateTime<Utc>, snapshot: &watch::Sender<Bill>) {
        if !self.bill.close(requested_at) {
            warn!("bill is already closed, ignoring close bill signal");
            return;
        }
        snapshot.send_replace(self.bill.clone());

        let activities = Arc::clone(&self.activities);
        let bill_id = self.bill.id;
        let result = execute_activity(&self.options, "close_bill", || {
            let activities = Arc::clone(&activities);
            async move { activities.close_bill(bill_id, requested_at).await }
        })
        .await;

        if let Err(e) = result {
            error!(error = %e, "failed to close bill in repository");
        }
    }
}
