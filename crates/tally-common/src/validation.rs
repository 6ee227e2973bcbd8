//! Admission checks on customer-supplied data
//!
//! Applied before any state change. Violations fail fast with an
//! invalid-argument error whose message names the offending field.

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use tracing::warn;

use crate::config::ValidationConfig;
use crate::error::{BillingError, Result};
use crate::types::{AddLineItemRequest, CreateBillRequest};

pub fn validate_create_bill_request(
    req: &CreateBillRequest,
    cfg: &ValidationConfig,
) -> Result<()> {
    if req.customer_id.is_empty() {
        warn!("validation failed: customer_id is required");
        return Err(BillingError::invalid_argument("customer_id is required"));
    }

    if req.period_end < req.period_start {
        warn!(
            period_start = %req.period_start,
            period_end = %req.period_end,
            "validation failed: period_end is before period_start"
        );
        return Err(BillingError::invalid_argument(
            "period_end must be after period_start",
        ));
    }

    let max_period = Duration::days(cfg.max_billing_period_days);
    if req.period_end - req.period_start > max_period {
        warn!(
            period_start = %req.period_start,
            period_end = %req.period_end,
            "validation failed: billing period too long"
        );
        return Err(BillingError::invalid_argument(format!(
            "billing period cannot exceed {} days",
            cfg.max_billing_period_days
        )));
    }

    let cutoff = Utc::now() - Duration::days(cfg.max_past_start_days);
    if req.period_start < cutoff {
        warn!(
            period_start = %req.period_start,
            cutoff = %cutoff,
            "validation failed: period_start too far in the past"
        );
        return Err(BillingError::invalid_argument(format!(
            "period_start cannot be more than {} days in the past",
            cfg.max_past_start_days
        )));
    }

    Ok(())
}

pub fn validate_add_line_item_request(
    req: &AddLineItemRequest,
    cfg: &ValidationConfig,
) -> Result<()> {
    if req.description.is_empty() {
        warn!("validation failed: description is required");
        return Err(BillingError::invalid_argument("description is required"));
    }

    if req.description.len() > cfg.max_description_length {
        warn!(
            description_length = req.description.len(),
            "validation failed: description too long"
        );
        return Err(BillingError::invalid_argument(format!(
            "description cannot exceed {} characters",
            cfg.max_description_length
        )));
    }

    req.currency.validate(&cfg.allowed_currencies)?;

    if req.quantity <= Decimal::ZERO {
        warn!(quantity = %req.quantity, "validation failed: invalid quantity");
        return Err(BillingError::invalid_argument(
            "quantity must be greater than zero",
        ));
    }

    if req.quantity > cfg.max_quantity {
        warn!(quantity = %req.quantity, "validation failed: quantity too high");
        return Err(BillingError::invalid_argument(format!(
            "quantity cannot exceed {}",
            cfg.max_quantity
        )));
    }

    if req.unit_price < Decimal::ZERO {
        warn!(unit_price = %req.unit_price, "validation failed: negative unit price");
        return Err(BillingError::invalid_argument(
            "unit_price cannot be negative",
        ));
    }

    if req.unit_price > cfg.max_unit_price {
        warn!(unit_price = %req.unit_price, "validation failed: unit price too high");
        return Err(BillingError::invalid_argument(format!(
            "unit_price cannot exceed {}",
            cfg.max_unit_price
        )));
    }

    let total = req.quantity * req.unit_price;
    if total > cfg.max_total_amount {
        warn!(total = %total, "validation failed: total amount too high");
        return Err(BillingError::invalid_argument(format!(
            "total line item amount cannot exceed {}",
            cfg.max_total_amount
        )));
    }

    Ok(())
}
