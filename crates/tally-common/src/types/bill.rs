//! Bill model and read-time totals
//!
//! A bill owns its billing window and an append-only list of line items.
//! Totals are a transient view: they are computed against a rates snapshot
//! at read time and never persisted.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BillingError, Result};

use super::currency::Currency;
use super::line_item::LineItem;
use super::rates::RatesSnapshot;

/// Bill lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillStatus {
    Open,
    Closed,
}

impl BillStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillStatus::Open => "open",
            BillStatus::Closed => "closed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "open" => Ok(BillStatus::Open),
            "closed" => Ok(BillStatus::Closed),
            other => Err(BillingError::invalid_argument(format!(
                "invalid bill status: {other}, supported statuses are open and closed"
            ))),
        }
    }
}

/// A customer's billing period with its line items and status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bill {
    pub id: Uuid,
    pub customer_id: String,
    pub status: BillStatus,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub workflow_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set if and only if status is closed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub line_items: Vec<LineItem>,
    /// Transient read-time view, never persisted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<Total>,
}

/// Read-time totals for a bill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Total {
    /// Currency → sum of that currency's line items
    pub by_currency: BTreeMap<Currency, Decimal>,
    /// Currency → whole-bill total expressed in that currency
    pub converted: BTreeMap<Currency, ConvertedTotal>,
}

/// Whole-bill total expressed in one target currency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConvertedTotal {
    pub amount: Decimal,
    /// Timestamp of the rates snapshot used, for staleness audits
    pub rate_updated_at: DateTime<Utc>,
}

/// Storage scale of quantity/unit_price money columns
const MONEY_SCALE: u32 = 4;

impl Bill {
    pub fn is_open(&self) -> bool {
        self.status == BillStatus::Open
    }

    pub fn is_closed(&self) -> bool {
        self.status == BillStatus::Closed
    }

    /// Append a line item unless the bill is closed. Returns whether the
    /// item was accepted.
    pub fn add_line_item(&mut self, item: LineItem) -> bool {
        if self.is_closed() {
            return false;
        }
        self.line_items.push(item);
        true
    }

    /// Remove a previously appended line item by id. Returns whether an
    /// item was removed.
    pub fn remove_line_item(&mut self, id: Uuid) -> bool {
        let before = self.line_items.len();
        self.line_items.retain(|item| item.id != id);
        self.line_items.len() != before
    }

    /// Transition to closed at the given instant. Returns whether the
    /// transition happened; closing a closed bill is a no-op.
    pub fn close(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_closed() {
            return false;
        }
        self.status = BillStatus::Closed;
        self.closed_at = Some(at);
        true
    }

    /// Compute read-time totals against a rates snapshot.
    ///
    /// `by_currency` sums are normalized to the storage scale. Each entry of
    /// `converted` is the whole-bill total expressed in that currency:
    /// per-currency subtotals are converted at rate(target)/rate(source) and
    /// rounded half-away-from-zero to the target currency's fraction digits.
    /// A currency present on the bill but absent from the snapshot fails the
    /// whole computation; no partial totals are produced.
    pub fn compute_totals(&mut self, rates: &RatesSnapshot) -> Result<()> {
        if self.line_items.is_empty() {
            return Ok(());
        }

        for item in &mut self.line_items {
            item.total = item.quantity * item.unit_price;
        }

        let mut by_currency: BTreeMap<Currency, Decimal> = BTreeMap::new();
        for item in &self.line_items {
            *by_currency.entry(item.currency.clone()).or_default() += item.total;
        }
        for amount in by_currency.values_mut() {
            *amount = amount.round_dp_with_strategy(
                MONEY_SCALE,
                RoundingStrategy::MidpointAwayFromZero,
            );
            amount.rescale(MONEY_SCALE);
        }

        let mut converted = BTreeMap::new();
        for (currency, amount) in &by_currency {
            let fraction = currency.fraction_digits();
            let to_rate = rates
                .rate(currency)
                .ok_or_else(|| BillingError::CurrencyNotFound(currency.to_string()))?;

            let mut sum = *amount;
            for (other, amount_other) in &by_currency {
                if other == currency {
                    continue;
                }
                let from_rate = rates
                    .rate(other)
                    .ok_or_else(|| BillingError::CurrencyNotFound(other.to_string()))?;
                let piece = (*amount_other * to_rate / from_rate)
                    .round_dp_with_strategy(fraction, RoundingStrategy::MidpointAwayFromZero);
                sum += piece;
            }

            let mut amount =
                sum.round_dp_with_strategy(fraction, RoundingStrategy::MidpointAwayFromZero);
            amount.rescale(fraction);
            converted.insert(
                currency.clone(),
                ConvertedTotal {
                    amount,
                    rate_updated_at: rates.updated_at,
                },
            );
        }

        self.total = Some(Total {
            by_currency,
            converted,
        });
        Ok(())
    }
}
