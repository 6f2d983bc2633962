//! Human-readable USDC amounts and their conversion to on-chain units.

use alloy::primitives::U256;
use rust_decimal::Decimal;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::str::FromStr;

/// USDC uses 6 decimals on every chain the Gateway supports.
pub const USDC_DECIMALS: u32 = 6;

/// A USDC amount in whole-token units (e.g. `2.01`).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct Usdc(pub(crate) Decimal);

impl FromStr for Usdc {
    type Err = rust_decimal::Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(value).map(Self)
    }
}

impl Display for Usdc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Usdc {
    pub const fn new(value: Decimal) -> Self {
        Self(value)
    }

    /// Converts to the token's smallest unit (6 decimals).
    ///
    /// Returns an error for negative values and for amounts with more
    /// precision than the token can represent.
    pub fn to_base_units(self) -> Result<U256, UsdcConversionError> {
        if self.0.is_sign_negative() && !self.0.is_zero() {
            return Err(UsdcConversionError::NegativeValue(self.0));
        }

        let scaled = self
            .0
            .checked_mul(Decimal::from(10u64.pow(USDC_DECIMALS)))
            .ok_or(UsdcConversionError::Overflow(self.0))?;

        if !scaled.fract().is_zero() {
            return Err(UsdcConversionError::TooPrecise(self.0));
        }

        scaled
            .to_u128()
            .map(U256::from)
            .ok_or(UsdcConversionError::Overflow(self.0))
    }

    /// Builds an amount from the token's smallest unit.
    pub fn from_base_units(units: U256) -> Result<Self, UsdcConversionError> {
        let units = i128::try_from(units).map_err(|_| UsdcConversionError::UnitsOverflow(units))?;

        Decimal::try_from_i128_with_scale(units, USDC_DECIMALS)
            .map(|value| Self(value.normalize()))
            .map_err(|_| UsdcConversionError::UnitsOverflow(U256::from(units)))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum UsdcConversionError {
    #[error("USDC amount cannot be negative: {0}")]
    NegativeValue(Decimal),
    #[error("USDC amount {0} has more than 6 decimal places")]
    TooPrecise(Decimal),
    #[error("USDC amount {0} overflows on-chain units")]
    Overflow(Decimal),
    #[error("{0} base units do not fit a decimal amount")]
    UnitsOverflow(U256),
}
