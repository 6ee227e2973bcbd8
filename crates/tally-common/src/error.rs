//! Error types for the tally billing service
//!
//! Provides a unified error type covering the full taxonomy surfaced to
//! callers plus the internal infrastructure variants that never leak.

use thiserror::Error;

/// Result type alias using BillingError
pub type Result<T> = std::result::Result<T, BillingError>;

/// Unified error type for billing operations
#[derive(Debug, Error)]
pub enum BillingError {
    /// Admission failure on customer-supplied data
    #[error("{0}")]
    InvalidArgument(String),

    /// Bill absent from both the live machine and the repository
    #[error("bill not found")]
    BillNotFound,

    /// Mutation attempted on a closed bill
    #[error("bill is closed and cannot be modified")]
    BillClosed,

    /// Rate missing for a line-item currency
    #[error("no exchange rate for currency: {0}")]
    CurrencyNotFound(String),

    /// Rate provider failure or timeout
    #[error("exchange rate provider unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Database failure
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization failure
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Machine instance not found or already terminated
    #[error("machine is not active: {0}")]
    MachineNotActive(String),

    /// A machine instance with this workflow id is already running
    #[error("machine already started: {0}")]
    MachineAlreadyStarted(String),

    /// Activity attempt exceeded its start-to-close timeout
    #[error("activity timed out: {0}")]
    ActivityTimeout(String),

    /// Anything not otherwise classified
    #[error("internal error: {0}")]
    Internal(String),
}

impl BillingError {
    /// Build an admission error with a message naming the offending field.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        BillingError::InvalidArgument(message.into())
    }

    /// Stable error code drawn from the public taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            BillingError::InvalidArgument(_) => "invalid_argument",
            BillingError::BillNotFound => "not_found",
            BillingError::BillClosed => "bill_closed",
            BillingError::CurrencyNotFound(_) => "currency_not_found",
            BillingError::UpstreamUnavailable(_) => "upstream_unavailable",
            BillingError::Storage(_)
            | BillingError::Serialization(_)
            | BillingError::MachineNotActive(_)
            | BillingError::MachineAlreadyStarted(_)
            | BillingError::ActivityTimeout(_)
            | BillingError::Internal(_) => "internal",
        }
    }

    /// Whether this variant carries infrastructure detail that must not
    /// reach external callers verbatim.
    pub fn is_internal(&self) -> bool {
        self.code() == "internal"
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes() {
        assert_eq!(BillingError::BillNotFound.code(), "not_found");
        assert_eq!(BillingError::BillClosed.code(), "bill_closed");
        assert_eq!(
            BillingError::CurrencyNotFound("GEL".into()).code(),
            "currency_not_found"
        );
        assert_eq!(
            BillingError::Storage("connection reset".into()).code(),
            "internal"
        );
    }

    #[test]
    fn test_internal_variants_flagged() {
        assert!(BillingError::Storage("boom".into()).is_internal());
        assert!(BillingError::MachineNotActive("wf-1".into()).is_internal());
        assert!(!BillingError::BillClosed.is_internal());
    }

    #[test]
    fn test_invalid_argument_message() {
        let err = BillingError::invalid_argument("customer_id is required");
        assert_eq!(err.to_string(), "customer_id is required");
    }
}
