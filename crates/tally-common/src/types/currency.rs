//! Currency code newtype
//!
//! Currencies travel as upper-case ISO 4217 codes. Membership in the
//! configured allow-list is checked at admission; fraction digits drive
//! rounding of converted totals.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, Result};

/// ISO 4217 currency code
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Currency(String);

impl Currency {
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check membership in the configured allow-list.
    pub fn validate(&self, allowed: &[String]) -> Result<()> {
        if allowed.iter().any(|c| c == &self.0) {
            return Ok(());
        }
        Err(BillingError::invalid_argument(format!(
            "unsupported currency: {}",
            self.0
        )))
    }

    /// Number of fractional digits carried by amounts in this currency.
    pub fn fraction_digits(&self) -> u32 {
        match self.0.as_str() {
            "BIF" | "CLP" | "DJF" | "GNF" | "JPY" | "KMF" | "KRW" | "PYG" | "RWF" | "VND"
            | "VUV" | "XAF" | "XOF" | "XPF" => 0,
            "BHD" | "IQD" | "JOD" | "KWD" | "LYD" | "OMR" | "TND" => 3,
            _ => 2,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Currency {
    fn from(code: &str) -> Self {
        Currency::new(code)
    }
}
