//! Wire request and response shapes

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::bill::Bill;
use super::currency::Currency;

/// Request to open a new bill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBillRequest {
    pub customer_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

/// Request to append a line item to a bill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddLineItemRequest {
    pub description: String,
    pub currency: Currency,
    pub quantity: Decimal,
    pub unit_price: Decimal,
}

/// Response envelope carrying a bill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillResponse {
    pub data: Bill,
}
