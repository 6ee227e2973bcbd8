//! Exchange rates snapshot

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::currency::Currency;

/// Currency → rate map against a common base, immutable once produced.
///
/// Rates are fixed-point decimals from the provider boundary onwards; no
/// binary-float rate math happens inside the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatesSnapshot {
    pub rates: HashMap<String, Decimal>,
    /// When this snapshot was fetched from the provider
    pub updated_at: DateTime<Utc>,
}

impl RatesSnapshot {
    pub fn new(rates: HashMap<String, Decimal>, updated_at: DateTime<Utc>) -> Self {
        Self { rates, updated_at }
    }

    /// Rate for a currency against the snapshot's base, if present.
    pub fn rate(&self, currency: &Currency) -> Option<Decimal> {
        self.rates.get(currency.as_str()).copied()
    }
}
