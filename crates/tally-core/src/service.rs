//! Billing service
//!
//! Fronts the durable bill machines: routes incoming requests, starts or
//! signals the appropriate instance, reconciles live machine state with the
//! repository, and computes read-time totals. The machine is authoritative
//! while it is live; after termination the repository is.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use tally_common::{
    AddLineItemRequest, AppConfig, Bill, BillStatus, BillingError, CreateBillRequest, LineItem,
    Result,
};
use tally_rates::ExchangeRates;
use tally_repository::Repository;

use crate::activities::BillingActivities;
use crate::machine::{BillMachine, MachineSignal};
use crate::runtime::{ActivityOptions, MachineRuntime, RetryPolicy, StartOptions};

pub struct BillingService {
    cfg: Arc<AppConfig>,
    runtime: Arc<MachineRuntime>,
    repository: Arc<dyn Repository>,
    rates: Arc<dyn ExchangeRates>,
    activities: Arc<BillingActivities>,
}

impl BillingService {
    pub fn new(
        cfg: Arc<AppConfig>,
        runtime: Arc<MachineRuntime>,
        repository: Arc<dyn Repository>,
        rates: Arc<dyn ExchangeRates>,
    ) -> Self {
        let activities = Arc::new(BillingActivities::new(Arc::clone(&repository)));
        Self {
            cfg,
            runtime,
            repository,
            rates,
            activities,
        }
    }

    fn workflow_id(&self, bill_id: Uuid) -> String {
        format!("{}{}", self.cfg.billing.workflow_id_prefix, bill_id)
    }

    fn activity_options(&self) -> ActivityOptions {
        ActivityOptions {
            start_to_close_timeout: Duration::from_secs(
                self.cfg.machine.activity_start_to_close_secs,
            ),
            retry: RetryPolicy::from_config(&self.cfg.machine.retry),
        }
    }

    /// Open a new bill and start its machine. The initial persistence
    /// completes asynchronously inside the machine; callers observe
    /// eventual consistency for it.
    #[instrument(skip(self, req), fields(customer_id = %req.customer_id))]
    pub async fn create_bill(&self, req: &CreateBillRequest) -> Result<Bill> {
        let bill_id = Uuid::new_v4();
        let workflow_id = self.workflow_id(bill_id);
        let now = self.runtime.clock().now();

        let bill = Bill {
            id: bill_id,
            customer_id: req.customer_id.clone(),
            status: BillStatus::Open,
            period_start: req.period_start,
            period_end: req.period_end,
            workflow_id: workflow_id.clone(),
            created_at: now,
            updated_at: now,
            closed_at: None,
            line_items: Vec::new(),
            total: None,
        };

        let execution_timeout = (req.period_end - req.period_start)
            .to_std()
            .unwrap_or_default()
            + Duration::from_secs(self.cfg.machine.execution_timeout_buffer_secs);

        let machine = BillMachine::new(
            bill.clone(),
            Arc::clone(&self.activities),
            self.activity_options(),
            self.runtime.clock(),
        );
        self.runtime
            .start(&workflow_id, machine, StartOptions { execution_timeout })?;

        info!(bill_id = %bill_id, workflow_id = %workflow_id, "bill created, machine started");
        Ok(bill)
    }

    /// Fetch a bill with totals computed against the current rates
    /// snapshot.
    #[instrument(skip(self), fields(bill_id = %id))]
    pub async fn get_bill(&self, id: Uuid) -> Result<Bill> {
        let bill = self.fetch_bill(id).await?;
        self.with_totals(bill).await
    }

    /// Validate-free append path; admission checks run before this is
    /// called. The just-signalled item is appended to the returned view
    /// only when the re-read does not already contain it.
    #[instrument(skip(self, req), fields(bill_id = %bill_id))]
    pub async fn add_line_item(&self, bill_id: Uuid, req: &AddLineItemRequest) -> Result<Bill> {
        let bill = self.fetch_bill(bill_id).await?;
        if bill.is_closed() {
            warn!("attempted to add line item to closed bill");
            return Err(BillingError::BillClosed);
        }

        let item = LineItem {
            id: Uuid::new_v4(),
            bill_id,
            description: req.description.clone(),
            currency: req.currency.clone(),
            quantity: req.quantity,
            unit_price: req.unit_price,
            created_at: self.runtime.clock().now(),
            total: Decimal::ZERO,
        };

        self.runtime
            .signal(&bill.workflow_id, MachineSignal::AddLineItem(item.clone()))?;
        info!(line_item_id = %item.id, "line item signal sent");

        let mut bill = self.fetch_bill(bill_id).await?;
        if !bill.line_items.iter().any(|existing| existing.id == item.id) {
            bill.add_line_item(item);
        }
        self.with_totals(bill).await
    }

    /// Close a bill. Closing an already-closed bill returns it unchanged.
    #[instrument(skip(self), fields(bill_id = %id))]
    pub async fn close_bill(&self, id: Uuid) -> Result<Bill> {
        let bill = self.fetch_bill(id).await?;
        if bill.is_closed() {
            info!("bill is already closed");
            return self.with_totals(bill).await;
        }

        let now = self.runtime.clock().now();
        self.runtime.signal(
            &bill.workflow_id,
            MachineSignal::CloseBill { requested_at: now },
        )?;
        info!("close signal sent");

        let mut bill = self.fetch_bill(id).await?;
        // The re-read may predate the machine absorbing the signal; mark
        // the view closed so the caller sees the terminal state.
        bill.close(now);
        self.with_totals(bill).await
    }

    /// Machine first, repository second. The machine is authoritative
    /// while live; a failed query falls through to the system of record.
    async fn fetch_bill(&self, id: Uuid) -> Result<Bill> {
        let workflow_id = self.workflow_id(id);
        match self.runtime.query(&workflow_id) {
            Ok(bill) => {
                debug!("bill retrieved from machine");
                Ok(bill)
            }
            Err(e) => {
                debug!(error = %e, "machine query failed, falling back to repository");
                self.repository.get_bill_by_id(id).await
            }
        }
    }

    async fn with_totals(&self, mut bill: Bill) -> Result<Bill> {
        let rates = self.rates.get_rates().await?;
        bill.compute_totals(&rates)?;
        Ok(bill)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use tally_common::{Currency, RatesSnapshot};
    use tally_repository::MemoryRepository;

    struct StaticRates(RatesSnapshot);

    #[async_trait]
    impl ExchangeRates for StaticRates {
        async fn get_rates(&self) -> Result<RatesSnapshot> {
            Ok(self.0.clone())
        }
    }

    struct FailingRates;

    #[async_trait]
    impl ExchangeRates for FailingRates {
        async fn get_rates(&self) -> Result<RatesSnapshot> {
            Err(BillingError::UpstreamUnavailable("provider down".into()))
        }
    }

    fn snapshot(rates: &[(&str, Decimal)]) -> RatesSnapshot {
        let map: HashMap<String, Decimal> =
            rates.iter().map(|(c, r)| (c.to_string(), *r)).collect();
        RatesSnapshot::new(map, Utc::now())
    }

    fn service_with(rates: Arc<dyn ExchangeRates>) -> (BillingService, Arc<MemoryRepository>) {
        let mut cfg = AppConfig::default();
        cfg.machine.retry.initial_interval_secs = 0;
        cfg.machine.retry.maximum_attempts = 2;
        let repository = Arc::new(MemoryRepository::new());
        let service = BillingService::new(
            Arc::new(cfg),
            MachineRuntime::with_system_clock(),
            repository.clone(),
            rates,
        );
        (service, repository)
    }

    fn usd_service() -> (BillingService, Arc<MemoryRepository>) {
        service_with(Arc::new(StaticRates(snapshot(&[
            ("USD", dec!(1.0)),
            ("GEL", dec!(2.5)),
        ]))))
    }

    fn create_request() -> CreateBillRequest {
        let now = Utc::now();
        CreateBillRequest {
            customer_id: "c1".to_string(),
            period_start: now,
            period_end: now + ChronoDuration::days(30),
        }
    }

    fn item_request(currency: &str) -> AddLineItemRequest {
        AddLineItemRequest {
            description: "X".to_string(),
            currency: Currency::new(currency),
            quantity: dec!(2),
            unit_price: dec!(10.00),
        }
    }

    async fn wait_for_closed_view(service: &BillingService, id: Uuid) {
        for _ in 0..500 {
            if let Ok(bill) = service.get_bill(id).await {
                if bill.is_closed() {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("bill never observed closed: {id}");
    }

    #[tokio::test]
    async fn test_create_bill_returns_open_bill_and_starts_machine() {
        let (service, _) = usd_service();
        let bill = service.create_bill(&create_request()).await.unwrap();

        assert_eq!(bill.status, BillStatus::Open);
        assert!(bill.closed_at.is_none());
        assert!(service.runtime.is_active(&bill.workflow_id));
    }

    #[tokio::test]
    async fn test_create_add_get_totals() {
        let (service, _) = usd_service();
        let bill = service.create_bill(&create_request()).await.unwrap();

        let view = service
            .add_line_item(bill.id, &item_request("USD"))
            .await
            .unwrap();

        assert_eq!(view.line_items.len(), 1);
        let total = view.total.as_ref().unwrap();
        let usd = Currency::new("USD");
        assert_eq!(total.by_currency[&usd].to_string(), "20.0000");
        assert_eq!(total.converted[&usd].amount.to_string(), "20.00");
    }

    #[tokio::test]
    async fn test_optimistic_append_does_not_double_count() {
        let (service, _) = usd_service();
        let bill = service.create_bill(&create_request()).await.unwrap();

        service
            .add_line_item(bill.id, &item_request("USD"))
            .await
            .unwrap();

        // Give the machine time to absorb the signal, then check the view
        // still holds exactly one item.
        for _ in 0..100 {
            let view = service.get_bill(bill.id).await.unwrap();
            if !view.line_items.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let second = service
            .add_line_item(bill.id, &item_request("GEL"))
            .await
            .unwrap();
        let descriptions: Vec<_> = second.line_items.iter().map(|i| i.id).collect();
        let mut deduped = descriptions.clone();
        deduped.sort();
        deduped.dedup();
        assert_eq!(descriptions.len(), deduped.len(), "line item double-counted");
    }

    #[tokio::test]
    async fn test_add_line_item_to_closed_bill_fails() {
        let (service, _) = usd_service();
        let bill = service.create_bill(&create_request()).await.unwrap();

        service.close_bill(bill.id).await.unwrap();
        wait_for_closed_view(&service, bill.id).await;

        let err = service
            .add_line_item(bill.id, &item_request("USD"))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::BillClosed));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_on_closed_at() {
        let (service, _) = usd_service();
        let bill = service.create_bill(&create_request()).await.unwrap();

        let first = service.close_bill(bill.id).await.unwrap();
        let first_closed_at = first.closed_at.unwrap();
        wait_for_closed_view(&service, bill.id).await;

        let second = service.close_bill(bill.id).await.unwrap();
        assert_eq!(second.closed_at, Some(first_closed_at));
    }

    #[tokio::test]
    async fn test_get_bill_unknown_id_not_found() {
        let (service, _) = usd_service();
        let err = service.get_bill(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, BillingError::BillNotFound));
    }

    #[tokio::test]
    async fn test_get_bill_falls_back_to_repository_after_termination() {
        let (service, repository) = usd_service();
        let bill = service.create_bill(&create_request()).await.unwrap();

        let pre_close = service
            .add_line_item(bill.id, &item_request("USD"))
            .await
            .unwrap();
        service.close_bill(bill.id).await.unwrap();

        // Wait until the machine instance is gone, not merely closed.
        for _ in 0..500 {
            if !service.runtime.is_active(&bill.workflow_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!service.runtime.is_active(&bill.workflow_id));

        let from_repo = service.get_bill(bill.id).await.unwrap();
        assert_eq!(from_repo.status, BillStatus::Closed);
        assert_eq!(from_repo.line_items.len(), pre_close.line_items.len());
        let usd = Currency::new("USD");
        assert_eq!(
            from_repo.total.as_ref().unwrap().by_currency[&usd].to_string(),
            "20.0000"
        );
        // And the repository agrees it holds the terminal state.
        assert_eq!(
            repository.get_bill_by_id(bill.id).await.unwrap().status,
            BillStatus::Closed
        );
    }

    #[tokio::test]
    async fn test_rate_provider_failure_surfaces_upstream_unavailable() {
        let (service, _) = service_with(Arc::new(FailingRates));
        let bill = service.create_bill(&create_request()).await.unwrap();

        let err = service.get_bill(bill.id).await.unwrap_err();
        assert_eq!(err.code(), "upstream_unavailable");
    }

    #[tokio::test]
    async fn test_missing_rate_surfaces_currency_not_found() {
        let (service, _) =
            service_with(Arc::new(StaticRates(snapshot(&[("USD", dec!(1.0))]))));
        let bill = service.create_bill(&create_request()).await.unwrap();

        let err = service
            .add_line_item(bill.id, &item_request("GEL"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "currency_not_found");
    }

    #[tokio::test]
    async fn test_multi_currency_conversion_via_service() {
        let (service, _) = usd_service();
        let bill = service.create_bill(&create_request()).await.unwrap();

        service
            .add_line_item(
                bill.id,
                &AddLineItemRequest {
                    description: "usd charge".to_string(),
                    currency: Currency::new("USD"),
                    quantity: dec!(1),
                    unit_price: dec!(10.00),
                },
            )
            .await
            .unwrap();

        // Let the machine absorb the first signal so the second response
        // reflects both items.
        for _ in 0..500 {
            let view = service.get_bill(bill.id).await.unwrap();
            if !view.line_items.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let view = service
            .add_line_item(
                bill.id,
                &AddLineItemRequest {
                    description: "gel charge".to_string(),
                    currency: Currency::new("GEL"),
                    quantity: dec!(2),
                    unit_price: dec!(5.00),
                },
            )
            .await
            .unwrap();

        let total = view.total.as_ref().unwrap();
        let usd = Currency::new("USD");
        let gel = Currency::new("GEL");
        assert_eq!(total.converted[&usd].amount.to_string(), "14.00");
        assert_eq!(total.converted[&gel].amount.to_string(), "35.00");
    }
}
