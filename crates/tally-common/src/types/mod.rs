//! Domain types for the billing service

pub mod bill;
pub mod currency;
pub mod line_item;
pub mod rates;
pub mod requests;

pub use bill::{Bill, BillStatus, ConvertedTotal, Total};
pub use currency::Currency;
pub use line_item::LineItem;
pub use rates::RatesSnapshot;
pub use requests::{AddLineItemRequest, BillResponse, CreateBillRequest};
