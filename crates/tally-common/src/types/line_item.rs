//! Line item model

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::currency::Currency;

/// An individual charge within a bill. Created once, never updated or
/// deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub id: Uuid,
    pub bill_id: Uuid,
    pub description: String,
    pub currency: Currency,
    /// Strictly positive on ingress
    pub quantity: Decimal,
    /// Non-negative on ingress
    pub unit_price: Decimal,
    pub created_at: DateTime<Utc>,
    /// Derived quantity × unit_price; populated when totals are computed
    #[serde(default)]
    pub total: Decimal,
}

impl LineItem {
    /// Derived per-item total.
    pub fn amount(&self) -> Decimal {
        self.quantity * self.unit_price
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_amount() {
        let item = LineItem {
            id: Uuid::new_v4(),
            bill_id: Uuid::new_v4(),
            description: "compute hours".to_string(),
            currency: Currency::new("USD"),
            quantity: dec!(2),
            unit_price: dec!(10.00),
            created_at: Utc::now(),
            total: Decimal::ZERO,
        };
        assert_eq!(item.amount(), dec!(20.00));
    }
}
