//! # Tally Common
//!
//! Shared types, errors, configuration, and admission rules for the tally
//! billing service.
//!
//! ## Core Types
//!
//! - [`Bill`]: a customer's billing period plus its line items and status
//! - [`LineItem`]: a single charge (description, currency, quantity, price)
//! - [`Total`]: read-time per-currency and converted totals
//! - [`RatesSnapshot`]: currency → rate map with a timestamp
//! - [`BillingError`]: the unified error taxonomy

pub mod config;
pub mod error;
pub mod types;
pub mod validation;

pub use config::AppConfig;
pub use error::{BillingError, Result};
pub use types::{
    AddLineItemRequest, Bill, BillResponse, BillStatus, ConvertedTotal, CreateBillRequest,
    Currency, LineItem, RatesSnapshot, Total,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
