//! Value Objects for the bundle engine

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self { Self(value.into()) }
            pub fn as_str(&self) -> &str { &self.0 }
            pub fn is_blank(&self) -> bool { self.0.trim().is_empty() }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self { Self(value.to_string()) }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self { Self(value) }
        }
    };
}

string_id!(
    /// Catalog id of a bundle definition
    BundleId
);
string_id!(
    /// Stable id of one candidate slot inside a bundle
    SlotId
);
string_id!(
    /// Purchasable product variant
    VariantId
);
string_id!(ProductId);
string_id!(CartId);
string_id!(LineItemId);

/// Money value object, held in minor currency units (cents).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money { amount: i64, currency: String }

impl Money {
    pub fn new(amount: i64, currency: &str) -> Self { Self { amount, currency: currency.to_lowercase() } }

    /// Converts a major-unit amount (e.g. `5.00`) into minor units, rounding half away from zero.
    pub fn from_major(amount: Decimal, currency: &str) -> Self {
        let scale = Decimal::from(10_i64.pow(minor_unit_exponent(currency)));
        let minor = (amount * scale)
            .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
            .to_i64()
            .unwrap_or_default();
        Self::new(minor, currency)
    }

    pub fn amount(&self) -> i64 { self.amount }
}

/// Number of decimal places of the smallest unit for an ISO currency code.
pub fn minor_unit_exponent(currency: &str) -> u32 {
    match currency.to_lowercase().as_str() {
        "jpy" | "krw" | "vnd" | "clp" | "isk" | "ugx" => 0,
        "bhd" | "kwd" | "omr" | "jod" | "tnd" => 3,
        _ => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[test]
    fn test_major_minor_conversion() {
        assert_eq!(Money::from_major(Decimal::new(500, 2), "usd").amount(), 500);
        assert_eq!(Money::from_major(Decimal::new(1005, 3), "USD").amount(), 101);
        assert_eq!(Money::from_major(Decimal::from(1500), "jpy").amount(), 1500);
        assert_eq!(Money::from_major(Decimal::new(1234, 3), "kwd").amount(), 1234);
    }
    #[test]
    fn test_blank_ids() {
        assert!(CartId::new("  ").is_blank());
        assert!(!BundleId::from("b_1").is_blank());
        assert_eq!(SlotId::from("s1").to_string(), "s1");
    }
}
